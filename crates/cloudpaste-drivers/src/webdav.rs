use async_trait::async_trait;
use futures_util::TryStreamExt as _;
use url::Url;

use cloudpaste_core::DriverError;
use cloudpaste_core::path as vpath;
use cloudpaste_driver_api::{
    BatchRemoveResult, Capability, CapabilitySet, CopyOptions, CopyOutcome, CopyStatus,
    DirListing, DriverKind, FileInfo, ListOptions, ProxyUrl, RemoveFailure, StorageDriver,
    StreamDescriptor, StreamHandle, UploadOptions, UploadSource,
};

use crate::webdav_client::{WebdavClient, WebdavCredentials, WebdavFileMeta, WebdavPropfindEntry};

/// Driver for a WebDAV endpoint (read/write/propfind only).
#[derive(Debug)]
pub struct WebdavDriver {
    client: WebdavClient,
}

impl WebdavDriver {
    pub fn from_config(config: &serde_json::Value) -> Result<Self, DriverError> {
        let endpoint = config
            .get("endpoint")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DriverError::new("INVALID_CONFIG", "webdav driver requires an endpoint"))?;
        let username = config
            .get("username")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let password = config
            .get("password")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let base_url = Url::parse(endpoint)
            .map_err(|e| DriverError::new("INVALID_CONFIG", format!("bad endpoint: {e}")))?;
        let client = WebdavClient::new(
            base_url,
            WebdavCredentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        )?;
        Ok(Self { client })
    }

    fn entry_to_info(&self, dir_path: &str, entry: &WebdavPropfindEntry) -> FileInfo {
        let mimetype = if entry.is_directory {
            None
        } else {
            Some(
                mime_guess::from_path(&entry.name)
                    .first_or_octet_stream()
                    .to_string(),
            )
        };
        FileInfo {
            name: entry.name.clone(),
            path: vpath::join(dir_path, &entry.name),
            is_directory: entry.is_directory,
            size: if entry.is_directory { None } else { entry.size },
            modified: entry.mtime,
            mimetype,
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<WebdavPropfindEntry>, DriverError> {
        let url = self.client.url_for(path)?;
        match self.client.propfind(&url, 0).await {
            Ok(entries) => Ok(entries.into_iter().next()),
            Err(e) if e.http_status == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_parent(&self, path: &str) -> Result<(), DriverError> {
        if let Some(parent) = vpath::parent(path)
            && parent != "/"
        {
            let url = self.client.url_for(&format!("{parent}/"))?;
            self.client.ensure_collection(&url).await?;
        }
        Ok(())
    }
}

struct WebdavDescriptor {
    client: WebdavClient,
    url: Url,
    meta: WebdavFileMeta,
}

fn response_stream(res: reqwest::Response) -> cloudpaste_driver_api::ByteStream {
    Box::pin(res.bytes_stream().map_err(std::io::Error::other))
}

#[async_trait]
impl StreamDescriptor for WebdavDescriptor {
    fn size(&self) -> Option<u64> {
        self.meta.size
    }

    fn content_type(&self) -> Option<&str> {
        self.meta.content_type.as_deref()
    }

    fn etag(&self) -> Option<&str> {
        self.meta.etag.as_deref()
    }

    fn last_modified(&self) -> Option<i64> {
        self.meta.last_modified
    }

    async fn open(&self) -> Result<StreamHandle, DriverError> {
        let (res, _, _) = self.client.get(&self.url, None).await?;
        Ok(StreamHandle::new(response_stream(res)))
    }

    async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<Option<StreamHandle>, DriverError> {
        let (res, _, ranged) = self.client.get(&self.url, Some((start, end))).await?;
        // A server may ignore Range and answer 200 with the full body; the
        // handle reports that so the streaming layer slices in software.
        Ok(Some(if ranged {
            StreamHandle::new(response_stream(res))
        } else {
            StreamHandle::full_body(response_stream(res))
        }))
    }
}

#[async_trait]
impl StorageDriver for WebdavDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Webdav
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            Capability::Reader,
            Capability::Writer,
            Capability::Proxy,
            Capability::Atomic,
        ])
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        let root = self.client.url_for("/")?;
        self.client.propfind(&root, 0).await?;
        Ok(())
    }

    async fn list_directory(
        &self,
        path: &str,
        _opts: &ListOptions,
    ) -> Result<DirListing, DriverError> {
        let dir = vpath::normalize_dir(path)
            .map_err(|e| DriverError::new("INVALID_PATH", e.to_string()))?;
        let url = self.client.url_for(&dir)?;
        let entries = self.client.propfind(&url, 1).await?;

        // Depth-1 responses include the collection itself; drop it by href.
        // Entry hrefs are percent-decoded, so decode ours before comparing.
        let self_path = percent_encoding::percent_decode_str(url.path())
            .decode_utf8_lossy()
            .trim_end_matches('/')
            .to_string();
        let items = entries
            .iter()
            .filter(|e| e.href.trim_end_matches('/') != self_path)
            .map(|e| self.entry_to_info(path, e))
            .collect();
        Ok(DirListing::new(path, items))
    }

    async fn get_file_info(&self, path: &str) -> Result<FileInfo, DriverError> {
        let entry = self
            .stat(path)
            .await?
            .ok_or_else(|| DriverError::not_found(format!("{path} not found")))?;
        let parent = vpath::parent(path).unwrap_or_else(|| "/".to_string());
        Ok(self.entry_to_info(&parent, &entry))
    }

    async fn download_file(&self, path: &str) -> Result<Box<dyn StreamDescriptor>, DriverError> {
        let url = self.client.url_for(path)?;
        // Prefer HEAD for metadata; fall back to PROPFIND for servers
        // without HEAD support.
        let meta = match self.client.head(&url).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Err(DriverError::not_found(format!("{path} not found"))),
            Err(_) => {
                let entry = self
                    .stat(path)
                    .await?
                    .ok_or_else(|| DriverError::not_found(format!("{path} not found")))?;
                WebdavFileMeta {
                    size: entry.size,
                    content_type: None,
                    etag: None,
                    last_modified: entry.mtime,
                }
            }
        };
        Ok(Box::new(WebdavDescriptor {
            client: self.client.clone(),
            url,
            meta,
        }))
    }

    async fn upload_file(
        &self,
        path: &str,
        source: UploadSource,
        opts: &UploadOptions,
    ) -> Result<FileInfo, DriverError> {
        if !opts.overwrite && self.stat(path).await?.is_some() {
            return Err(DriverError::new(
                "ALREADY_EXISTS",
                format!("{path} already exists"),
            ));
        }
        self.ensure_parent(path).await?;

        let url = self.client.url_for(path)?;
        let content_type = opts
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let size = source.size_hint();
        let body = match source {
            UploadSource::Bytes(bytes) => reqwest::Body::from(bytes),
            UploadSource::Stream { stream, .. } => reqwest::Body::wrap_stream(stream),
        };
        self.client
            .put_stream(&url, body, size, &content_type)
            .await?;

        self.get_file_info(path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), DriverError> {
        let dir = vpath::normalize_dir(path)
            .map_err(|e| DriverError::new("INVALID_PATH", e.to_string()))?;
        let url = self.client.url_for(&dir)?;
        self.client.ensure_collection(&url).await
    }

    async fn batch_remove_items(&self, paths: &[String]) -> Result<BatchRemoveResult, DriverError> {
        let mut result = BatchRemoveResult::default();
        for path in paths {
            let removed = async {
                let url = self.client.url_for(path)?;
                if self.client.delete(&url).await? {
                    Ok::<_, DriverError>(())
                } else {
                    Err(DriverError::not_found(format!("{path} not found")))
                }
            }
            .await;

            match removed {
                Ok(()) => result.success += 1,
                Err(error) => result.failed.push(RemoveFailure {
                    path: path.clone(),
                    error: error.to_string(),
                }),
            }
        }
        Ok(result)
    }

    async fn rename_item(&self, old_path: &str, new_path: &str) -> Result<(), DriverError> {
        self.ensure_parent(new_path).await?;
        let source = self.client.url_for(old_path)?;
        let destination = self.client.url_for(new_path)?;
        self.client.move_to(&source, &destination, true).await
    }

    async fn copy_item(
        &self,
        source_path: &str,
        target_path: &str,
        opts: &CopyOptions,
    ) -> Result<CopyOutcome, DriverError> {
        let source_entry = self
            .stat(source_path)
            .await?
            .ok_or_else(|| DriverError::not_found(format!("{source_path} not found")))?;

        if opts.skip_existing
            && let Some(existing) = self.stat(target_path).await?
            && existing.size == source_entry.size
        {
            return Ok(CopyOutcome {
                status: CopyStatus::Skipped,
                source_path: source_path.to_string(),
                target_path: target_path.to_string(),
                content_length: source_entry.size,
                error: None,
            });
        }

        self.ensure_parent(target_path).await?;
        let source = self.client.url_for(source_path)?;
        let destination = self.client.url_for(target_path)?;
        self.client.copy_to(&source, &destination, true).await?;

        // Server-side COPY has no byte stream; report completion once.
        if let (Some(on_progress), Some(size)) = (&opts.on_progress, source_entry.size) {
            on_progress(size);
        }

        Ok(CopyOutcome {
            status: CopyStatus::Success,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            content_length: source_entry.size,
            error: None,
        })
    }

    fn supports_proxy_mode(&self) -> bool {
        true
    }

    fn generate_proxy_url(&self, path: &str) -> Result<ProxyUrl, DriverError> {
        Ok(ProxyUrl::new(format!("/api/proxy{path}")))
    }
}
