use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stream::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverKind {
    S3,
    Webdav,
    Local,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::S3 => "S3",
            DriverKind::Webdav => "WEBDAV",
            DriverKind::Local => "LOCAL",
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S3" => Ok(DriverKind::S3),
            "WEBDAV" => Ok(DriverKind::Webdav),
            "LOCAL" => Ok(DriverKind::Local),
            other => Err(anyhow::anyhow!("unknown driver kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
}

fn directory_kind() -> &'static str {
    "directory"
}

fn proxy_kind() -> &'static str {
    "proxy"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirListing {
    pub path: String,
    #[serde(rename = "type", skip_deserializing, default = "directory_kind")]
    pub kind: &'static str,
    pub is_root: bool,
    /// True for directories synthesized by the mount resolver (ancestors
    /// of mount points) rather than listed by a driver.
    pub is_virtual: bool,
    pub items: Vec<FileInfo>,
}

impl DirListing {
    pub fn new(path: impl Into<String>, items: Vec<FileInfo>) -> Self {
        let path = path.into();
        Self {
            is_root: path == "/",
            path,
            kind: "directory",
            is_virtual: false,
            items,
        }
    }

    pub fn virtual_dir(path: impl Into<String>, items: Vec<FileInfo>) -> Self {
        let mut listing = Self::new(path, items);
        listing.is_virtual = true;
        listing
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Refresh hint: skip caches along the way.
    pub no_cache: bool,
}

/// Bounded or streaming upload body.
pub enum UploadSource {
    Bytes(bytes::Bytes),
    Stream {
        stream: ByteStream,
        size: Option<u64>,
    },
}

impl UploadSource {
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            UploadSource::Bytes(b) => Some(b.len() as u64),
            UploadSource::Stream { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadSource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            UploadSource::Stream { size, .. } => {
                f.debug_struct("Stream").field("size", size).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    /// Refuse to replace an existing object unless set.
    pub overwrite: bool,
}

pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CopyOptions {
    pub skip_existing: bool,
    /// Called with cumulative bytes copied for the current item.
    pub on_progress: Option<ProgressFn>,
}

impl std::fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyOptions")
            .field("skip_existing", &self.skip_existing)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyOutcome {
    pub status: CopyStatus,
    pub source_path: String,
    pub target_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRemoveResult {
    pub success: u32,
    pub failed: Vec<RemoveFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlKind {
    NativeDirect,
    CustomHost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrl {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: UrlKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyUrl {
    pub url: String,
    #[serde(rename = "type", skip_deserializing, default = "proxy_kind")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ProxyUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: "proxy",
            channel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipartStrategy {
    PerPartUrl,
    SingleSession,
}

#[derive(Debug, Clone)]
pub struct MultipartInitRequest {
    pub file_size: u64,
    pub content_type: Option<String>,
    pub part_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    pub part_number: u32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInit {
    pub storage_path: String,
    pub strategy: MultipartStrategy,
    pub part_size: u64,
    pub total_parts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Per-part presigned URLs (`per_part_url` strategy).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_urls: Vec<PartUrl>,
    /// One session URL (`single_session` strategy).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartComplete {
    pub storage_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartUploadInfo {
    pub upload_id: String,
    pub storage_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub part_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// One item of a cross-storage transfer plan produced by the source
/// driver; the task orchestrator performs the actual byte movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossStoragePlan {
    pub source_path: String,
    pub target_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<DownloadUrl>,
}
