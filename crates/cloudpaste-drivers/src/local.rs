use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt as _;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio_util::io::ReaderStream;
use tracing::debug;

use cloudpaste_core::DriverError;
use cloudpaste_core::path as vpath;
use cloudpaste_driver_api::{
    BatchRemoveResult, Capability, CapabilitySet, CopyOptions, CopyOutcome, CopyStatus,
    DirListing, DriverKind, FileInfo, ListOptions, ProxyUrl, RemoveFailure, StorageDriver,
    StreamDescriptor, StreamHandle, UploadOptions, UploadSource,
};

const COPY_CHUNK: usize = 256 * 1024;

/// Filesystem driver rooted at a configured directory.
#[derive(Debug)]
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &serde_json::Value) -> Result<Self, DriverError> {
        let root = config
            .get("root")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DriverError::new("INVALID_CONFIG", "local driver requires a root"))?;
        Ok(Self::new(root))
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, DriverError> {
        let normalized = vpath::normalize(path)
            .map_err(|e| DriverError::new("INVALID_PATH", e.to_string()))?;
        let rest = normalized.trim_start_matches('/');
        Ok(if rest.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rest)
        })
    }

    async fn file_info_at(&self, abs: &Path, virtual_path: &str) -> Result<FileInfo, DriverError> {
        let meta = tokio::fs::metadata(abs).await?;
        Ok(file_info_from_meta(virtual_path, &meta))
    }
}

fn file_info_from_meta(virtual_path: &str, meta: &std::fs::Metadata) -> FileInfo {
    let name = vpath::file_name(virtual_path).unwrap_or("/").to_string();
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    let mimetype = if meta.is_dir() {
        None
    } else {
        Some(
            mime_guess::from_path(virtual_path)
                .first_or_octet_stream()
                .to_string(),
        )
    };
    FileInfo {
        name,
        path: virtual_path.to_string(),
        is_directory: meta.is_dir(),
        size: if meta.is_dir() { None } else { Some(meta.len()) },
        modified,
        mimetype,
    }
}

struct LocalDescriptor {
    abs: PathBuf,
    size: u64,
    content_type: String,
    etag: String,
    modified: Option<i64>,
}

#[async_trait]
impl StreamDescriptor for LocalDescriptor {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn content_type(&self) -> Option<&str> {
        Some(&self.content_type)
    }

    fn etag(&self) -> Option<&str> {
        Some(&self.etag)
    }

    fn last_modified(&self) -> Option<i64> {
        self.modified
    }

    async fn open(&self) -> Result<StreamHandle, DriverError> {
        let file = tokio::fs::File::open(&self.abs).await?;
        Ok(StreamHandle::new(Box::pin(ReaderStream::new(file))))
    }

    async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<Option<StreamHandle>, DriverError> {
        let mut file = tokio::fs::File::open(&self.abs).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let limit = match end {
            Some(end) => end.saturating_sub(start) + 1,
            None => u64::MAX,
        };
        let reader = file.take(limit);
        Ok(Some(StreamHandle::new(Box::pin(ReaderStream::new(reader)))))
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Local
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
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn list_directory(
        &self,
        path: &str,
        _opts: &ListOptions,
    ) -> Result<DirListing, DriverError> {
        let abs = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&abs).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta = entry.metadata().await?;
            items.push(file_info_from_meta(&vpath::join(path, &name), &meta));
        }
        items.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then(a.name.cmp(&b.name)));
        Ok(DirListing::new(path, items))
    }

    async fn get_file_info(&self, path: &str) -> Result<FileInfo, DriverError> {
        let abs = self.resolve(path)?;
        self.file_info_at(&abs, path).await
    }

    async fn download_file(&self, path: &str) -> Result<Box<dyn StreamDescriptor>, DriverError> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs).await?;
        if meta.is_dir() {
            return Err(DriverError::new("NOT_A_FILE", format!("{path} is a directory")));
        }
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        Ok(Box::new(LocalDescriptor {
            abs,
            size: meta.len(),
            content_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string(),
            etag: format!("\"{:x}-{:x}\"", meta.len(), modified.unwrap_or(0)),
            modified,
        }))
    }

    async fn upload_file(
        &self,
        path: &str,
        source: UploadSource,
        opts: &UploadOptions,
    ) -> Result<FileInfo, DriverError> {
        let abs = self.resolve(path)?;
        if !opts.overwrite && tokio::fs::try_exists(&abs).await? {
            return Err(DriverError::new(
                "ALREADY_EXISTS",
                format!("{path} already exists"),
            ));
        }
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Stage into a partial file and rename into place so a torn upload
        // never becomes visible.
        let file_name = abs
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DriverError::new("INVALID_PATH", "missing file name"))?;
        let tmp = abs.with_file_name(format!("{file_name}.partial"));
        let _ = tokio::fs::remove_file(&tmp).await;

        let mut file = tokio::fs::File::create(&tmp).await?;
        match source {
            UploadSource::Bytes(bytes) => {
                file.write_all(&bytes).await?;
            }
            UploadSource::Stream { mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    file.write_all(&chunk?).await?;
                }
            }
        }
        file.flush().await?;
        drop(file);

        let _ = tokio::fs::remove_file(&abs).await;
        tokio::fs::rename(&tmp, &abs).await?;
        debug!(path, "stored local file");
        self.file_info_at(&abs, path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), DriverError> {
        let abs = self.resolve(path)?;
        tokio::fs::create_dir_all(&abs).await?;
        Ok(())
    }

    async fn batch_remove_items(&self, paths: &[String]) -> Result<BatchRemoveResult, DriverError> {
        let mut result = BatchRemoveResult::default();
        for path in paths {
            let removed = async {
                let abs = self.resolve(path)?;
                let meta = tokio::fs::metadata(&abs).await?;
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(&abs).await?;
                } else {
                    tokio::fs::remove_file(&abs).await?;
                }
                Ok::<_, DriverError>(())
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
        let old_abs = self.resolve(old_path)?;
        let new_abs = self.resolve(new_path)?;
        if let Some(parent) = new_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old_abs, &new_abs).await?;
        Ok(())
    }

    async fn copy_item(
        &self,
        source_path: &str,
        target_path: &str,
        opts: &CopyOptions,
    ) -> Result<CopyOutcome, DriverError> {
        let src = self.resolve(source_path)?;
        let dst = self.resolve(target_path)?;
        let src_meta = tokio::fs::metadata(&src).await?;

        if src_meta.is_dir() {
            tokio::fs::create_dir_all(&dst).await?;
            return Ok(CopyOutcome {
                status: CopyStatus::Success,
                source_path: source_path.to_string(),
                target_path: target_path.to_string(),
                content_length: Some(0),
                error: None,
            });
        }

        // Same-size target counts as already copied.
        if opts.skip_existing
            && let Ok(dst_meta) = tokio::fs::metadata(&dst).await
            && dst_meta.len() == src_meta.len()
        {
            debug!(source_path, target_path, "skipping existing copy target");
            return Ok(CopyOutcome {
                status: CopyStatus::Skipped,
                source_path: source_path.to_string(),
                target_path: target_path.to_string(),
                content_length: Some(src_meta.len()),
                error: None,
            });
        }

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = dst
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DriverError::new("INVALID_PATH", "missing file name"))?;
        let tmp = dst.with_file_name(format!("{file_name}.partial"));
        let _ = tokio::fs::remove_file(&tmp).await;

        let mut reader = tokio::fs::File::open(&src).await?;
        let mut writer = tokio::fs::File::create(&tmp).await?;
        let mut copied = 0_u64;
        let mut buf = vec![0_u8; COPY_CHUNK];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            copied += n as u64;
            if let Some(on_progress) = &opts.on_progress {
                on_progress(copied);
            }
        }
        writer.flush().await?;
        drop(writer);

        if copied != src_meta.len() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DriverError::new(
                "COPY_SIZE_MISMATCH",
                format!("expected {} bytes, copied {copied}", src_meta.len()),
            ));
        }

        let _ = tokio::fs::remove_file(&dst).await;
        tokio::fs::rename(&tmp, &dst).await?;

        Ok(CopyOutcome {
            status: CopyStatus::Success,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            content_length: Some(copied),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    async fn driver(tmp: &tempfile::TempDir) -> LocalDriver {
        let driver = LocalDriver::new(tmp.path());
        driver.initialize().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn upload_list_download_round_trip() {
        let tmp = tempdir().unwrap();
        let driver = driver(&tmp).await;

        driver
            .upload_file(
                "/docs/note.txt",
                UploadSource::Bytes(bytes::Bytes::from_static(b"hello world")),
                &UploadOptions {
                    overwrite: true,
                    ..UploadOptions::default()
                },
            )
            .await
            .unwrap();

        let listing = driver
            .list_directory("/docs", &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].name, "note.txt");
        assert_eq!(listing.items[0].size, Some(11));

        let descriptor = driver.download_file("/docs/note.txt").await.unwrap();
        assert_eq!(descriptor.size(), Some(11));
        let mut handle = descriptor.open().await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = handle.stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn range_open_honors_bounds() {
        let tmp = tempdir().unwrap();
        let driver = driver(&tmp).await;
        let data: Vec<u8> = (0..=255).collect();
        driver
            .upload_file(
                "/blob.bin",
                UploadSource::Bytes(bytes::Bytes::from(data.clone())),
                &UploadOptions {
                    overwrite: true,
                    ..UploadOptions::default()
                },
            )
            .await
            .unwrap();

        let descriptor = driver.download_file("/blob.bin").await.unwrap();
        let mut handle = descriptor.open_range(10, Some(19)).await.unwrap().unwrap();
        assert!(handle.supports_range);
        let mut body = Vec::new();
        while let Some(chunk) = handle.stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, &data[10..=19]);
    }

    #[tokio::test]
    async fn copy_reports_progress_and_skips_existing() {
        let tmp = tempdir().unwrap();
        let driver = driver(&tmp).await;
        let payload = vec![7_u8; 600 * 1024];
        driver
            .upload_file(
                "/a.bin",
                UploadSource::Bytes(bytes::Bytes::from(payload)),
                &UploadOptions {
                    overwrite: true,
                    ..UploadOptions::default()
                },
            )
            .await
            .unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_cb = seen.clone();
        let outcome = driver
            .copy_item(
                "/a.bin",
                "/b.bin",
                &CopyOptions {
                    skip_existing: true,
                    on_progress: Some(Arc::new(move |bytes| {
                        seen_in_cb.store(bytes, Ordering::Relaxed);
                    })),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, CopyStatus::Success);
        assert_eq!(outcome.content_length, Some(600 * 1024));
        assert_eq!(seen.load(Ordering::Relaxed), 600 * 1024);

        let again = driver
            .copy_item(
                "/a.bin",
                "/b.bin",
                &CopyOptions {
                    skip_existing: true,
                    on_progress: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(again.status, CopyStatus::Skipped);
    }

    #[tokio::test]
    async fn batch_remove_reports_per_path_failures() {
        let tmp = tempdir().unwrap();
        let driver = driver(&tmp).await;
        driver
            .upload_file(
                "/keep/x.txt",
                UploadSource::Bytes(bytes::Bytes::from_static(b"x")),
                &UploadOptions {
                    overwrite: true,
                    ..UploadOptions::default()
                },
            )
            .await
            .unwrap();

        let result = driver
            .batch_remove_items(&["/keep/x.txt".to_string(), "/missing.txt".to_string()])
            .await
            .unwrap();
        assert_eq!(result.success, 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].path, "/missing.txt");
    }

    #[tokio::test]
    async fn overwrite_guard_refuses_existing_target() {
        let tmp = tempdir().unwrap();
        let driver = driver(&tmp).await;
        let opts = UploadOptions::default();
        driver
            .upload_file(
                "/f.txt",
                UploadSource::Bytes(bytes::Bytes::from_static(b"one")),
                &UploadOptions {
                    overwrite: true,
                    ..UploadOptions::default()
                },
            )
            .await
            .unwrap();
        let err = driver
            .upload_file("/f.txt", UploadSource::Bytes(bytes::Bytes::from_static(b"two")), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.code, "ALREADY_EXISTS");
    }
}
