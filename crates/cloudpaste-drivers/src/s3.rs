use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use futures_util::StreamExt as _;
use tokio::io::AsyncWriteExt as _;
use tokio_util::io::ReaderStream;
use tracing::debug;

use cloudpaste_core::DriverError;
use cloudpaste_core::path as vpath;
use cloudpaste_driver_api::{
    BatchRemoveResult, Capability, CapabilitySet, CompletedPart, CopyOptions, CopyOutcome,
    CopyStatus, CrossStoragePlan, DirListing, DownloadUrl, DriverKind, FileInfo, ListOptions,
    MultipartInit, MultipartInitRequest, MultipartComplete, MultipartStrategy,
    MultipartUploadInfo, PartInfo, PartUrl, RemoveFailure, StorageDriver, StreamDescriptor,
    StreamHandle, UploadOptions, UploadSource, UrlKind,
};

const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const DELETE_BATCH: usize = 1000;

#[derive(Debug)]
pub struct S3Driver {
    client: Client,
    bucket: String,
    /// Key prefix the driver is rooted at; empty or ends with '/'.
    root_prefix: String,
    custom_host: Option<String>,
}

fn service_error<E>(op: &'static str, err: E) -> DriverError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.code().unwrap_or("S3_ERROR").to_string();
    let status = match code.as_str() {
        "NoSuchKey" | "NoSuchUpload" | "NotFound" => Some(404),
        "AccessDenied" => Some(403),
        "SlowDown" => Some(503),
        _ => None,
    };
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    let mut mapped = DriverError::new(code, format!("s3 {op} failed: {message}")).with_source(err);
    if let Some(status) = status {
        mapped.http_status = Some(status);
    }
    mapped
}

fn sdk_error<E>(op: &'static str, err: SdkError<E>) -> DriverError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = match &err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    };
    let code = err
        .code()
        .map(str::to_string)
        .unwrap_or_else(|| match &err {
            SdkError::TimeoutError(_) => "TIMEOUT".to_string(),
            SdkError::DispatchFailure(_) => "CONNECTION".to_string(),
            _ => "S3_ERROR".to_string(),
        });
    let mut mapped =
        DriverError::new(code, format!("s3 {op} failed: {err}")).with_source(err);
    mapped.http_status = status;
    mapped
}

impl S3Driver {
    pub fn from_config(config: &serde_json::Value) -> Result<Self, DriverError> {
        let get = |key: &str| config.get(key).and_then(|v| v.as_str()).unwrap_or_default();
        let bucket = get("bucket");
        if bucket.is_empty() {
            return Err(DriverError::new("INVALID_CONFIG", "s3 driver requires a bucket"));
        }
        let access_key_id = get("access_key_id");
        let secret_access_key = get("secret_access_key");
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            return Err(DriverError::new("INVALID_CONFIG", "s3 driver requires credentials"));
        }

        let region = if get("region").is_empty() {
            "us-east-1".to_string()
        } else {
            get("region").to_string()
        };
        let credentials =
            Credentials::new(access_key_id, secret_access_key, None, None, "cloudpaste");

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(
                config
                    .get("force_path_style")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            );
        if !get("endpoint").is_empty() {
            builder = builder.endpoint_url(get("endpoint"));
        }

        let mut root_prefix = get("root_prefix").trim_matches('/').to_string();
        if !root_prefix.is_empty() {
            root_prefix.push('/');
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            root_prefix,
            custom_host: config
                .get("custom_host")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.root_prefix, path.trim_start_matches('/'))
    }

    fn dir_key(&self, path: &str) -> String {
        let key = self.key(path);
        let key = key.trim_end_matches('/');
        if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        }
    }

    fn url_kind(&self) -> UrlKind {
        if self.custom_host.is_some() {
            UrlKind::CustomHost
        } else {
            UrlKind::NativeDirect
        }
    }

    fn rewrite_host(&self, url: String) -> String {
        let Some(host) = &self.custom_host else {
            return url;
        };
        match url::Url::parse(&url) {
            Ok(parsed) => format!(
                "{}{}{}",
                host.trim_end_matches('/'),
                parsed.path(),
                parsed.query().map(|q| format!("?{q}")).unwrap_or_default()
            ),
            Err(_) => url,
        }
    }

    async fn head_size(&self, path: &str) -> Result<Option<u64>, DriverError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(head) => Ok(head.content_length().map(|n| n as u64)),
            Err(err) => {
                let svc = err.into_service_error();
                if svc.is_not_found() {
                    Ok(None)
                } else {
                    Err(service_error("head_object", svc))
                }
            }
        }
    }

    async fn presign_get(&self, path: &str, expires_in: u64) -> Result<String, DriverError> {
        let config = PresigningConfig::expires_in(Duration::from_secs(expires_in))
            .map_err(|e| DriverError::new("INVALID_CONFIG", e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .presigned(config)
            .await
            .map_err(|e| sdk_error("presign get_object", e))?;
        Ok(self.rewrite_host(presigned.uri().to_string()))
    }
}

struct S3Descriptor {
    client: Client,
    bucket: String,
    key: String,
    size: u64,
    content_type: Option<String>,
    etag: Option<String>,
    last_modified: Option<i64>,
}

impl S3Descriptor {
    async fn fetch(&self, range: Option<String>) -> Result<StreamHandle, DriverError> {
        let mut req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key);
        if let Some(range) = range {
            req = req.range(range);
        }
        let resp = req.send().await.map_err(|e| sdk_error("get_object", e))?;
        let reader = resp.body.into_async_read();
        Ok(StreamHandle::new(Box::pin(ReaderStream::new(reader))))
    }
}

#[async_trait]
impl StreamDescriptor for S3Descriptor {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn last_modified(&self) -> Option<i64> {
        self.last_modified
    }

    async fn open(&self) -> Result<StreamHandle, DriverError> {
        self.fetch(None).await
    }

    async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<Option<StreamHandle>, DriverError> {
        let range = match end {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };
        Ok(Some(self.fetch(Some(range)).await?))
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn kind(&self) -> DriverKind {
        DriverKind::S3
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            Capability::Reader,
            Capability::Writer,
            Capability::DirectLink,
            Capability::Multipart,
            Capability::Atomic,
        ])
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| sdk_error("head_bucket", e))?;
        Ok(())
    }

    async fn list_directory(
        &self,
        path: &str,
        _opts: &ListOptions,
    ) -> Result<DirListing, DriverError> {
        let prefix = self.dir_key(path);
        let mut items = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(token) = &continuation_token {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| sdk_error("list_objects_v2", e))?;

            for common in resp.common_prefixes() {
                let Some(sub_prefix) = common.prefix() else {
                    continue;
                };
                let name = sub_prefix
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                items.push(FileInfo {
                    path: vpath::join(path, &name),
                    name,
                    is_directory: true,
                    size: None,
                    modified: None,
                    mimetype: None,
                });
            }

            for object in resp.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                // The directory marker itself is not a child.
                if key == prefix {
                    continue;
                }
                let name = key.rsplit('/').next().unwrap_or_default().to_string();
                items.push(FileInfo {
                    path: vpath::join(path, &name),
                    mimetype: Some(
                        mime_guess::from_path(&name)
                            .first_or_octet_stream()
                            .to_string(),
                    ),
                    name,
                    is_directory: false,
                    size: object.size().map(|n| n as u64),
                    modified: object.last_modified().map(|t| t.secs()),
                });
            }

            continuation_token = resp.next_continuation_token().map(str::to_string);
            if continuation_token.is_none() {
                break;
            }
        }

        items.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then(a.name.cmp(&b.name)));
        Ok(DirListing::new(path, items))
    }

    async fn get_file_info(&self, path: &str) -> Result<FileInfo, DriverError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(head) => Ok(FileInfo {
                name: vpath::file_name(path).unwrap_or("/").to_string(),
                path: path.to_string(),
                is_directory: false,
                size: head.content_length().map(|n| n as u64),
                modified: head.last_modified().map(|t| t.secs()),
                mimetype: head.content_type().map(str::to_string),
            }),
            Err(err) => {
                let svc = err.into_service_error();
                if !svc.is_not_found() {
                    return Err(service_error("head_object", svc));
                }
                // Not an object; a non-empty prefix is a directory.
                let prefix = self.dir_key(path);
                let resp = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .max_keys(1)
                    .send()
                    .await
                    .map_err(|e| sdk_error("list_objects_v2", e))?;
                if resp.key_count().unwrap_or(0) > 0 {
                    Ok(FileInfo {
                        name: vpath::file_name(path).unwrap_or("/").to_string(),
                        path: path.to_string(),
                        is_directory: true,
                        size: None,
                        modified: None,
                        mimetype: None,
                    })
                } else {
                    Err(DriverError::not_found(format!("{path} not found")))
                }
            }
        }
    }

    async fn download_file(&self, path: &str) -> Result<Box<dyn StreamDescriptor>, DriverError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|err| {
                let svc = err.into_service_error();
                if svc.is_not_found() {
                    DriverError::not_found(format!("{path} not found"))
                } else {
                    service_error("head_object", svc)
                }
            })?;

        Ok(Box::new(S3Descriptor {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.key(path),
            size: head.content_length().unwrap_or(0) as u64,
            content_type: head.content_type().map(str::to_string),
            etag: head.e_tag().map(str::to_string),
            last_modified: head.last_modified().map(|t| t.secs()),
        }))
    }

    async fn upload_file(
        &self,
        path: &str,
        source: UploadSource,
        opts: &UploadOptions,
    ) -> Result<FileInfo, DriverError> {
        if !opts.overwrite && self.head_size(path).await?.is_some() {
            return Err(DriverError::new(
                "ALREADY_EXISTS",
                format!("{path} already exists"),
            ));
        }

        let body = match source {
            UploadSource::Bytes(bytes) => S3ByteStream::from(bytes.to_vec()),
            UploadSource::Stream { mut stream, .. } => {
                // SigV4 needs the full length up front; spool to disk rather
                // than buffering the payload in memory.
                let spool = std::env::temp_dir().join(format!(
                    "cloudpaste-s3-upload-{}-{}.tmp",
                    std::process::id(),
                    cloudpaste_core::ids::epoch_ms()
                ));
                let mut file = tokio::fs::File::create(&spool).await?;
                while let Some(chunk) = stream.next().await {
                    file.write_all(&chunk?).await?;
                }
                file.flush().await?;
                drop(file);
                let body = S3ByteStream::from_path(&spool)
                    .await
                    .map_err(|e| DriverError::new("IO_ERROR", e.to_string()))?;
                let _ = tokio::fs::remove_file(&spool).await;
                body
            }
        };

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(body);
        if let Some(content_type) = &opts.content_type {
            req = req.content_type(content_type);
        }
        req.send().await.map_err(|e| sdk_error("put_object", e))?;
        debug!(path, bucket = %self.bucket, "stored s3 object");

        self.get_file_info(path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), DriverError> {
        let key = self.dir_key(path);
        if key.is_empty() {
            return Ok(());
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(S3ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| sdk_error("put_object", e))?;
        Ok(())
    }

    async fn batch_remove_items(&self, paths: &[String]) -> Result<BatchRemoveResult, DriverError> {
        let mut result = BatchRemoveResult::default();

        for path in paths {
            let removed = async {
                let keys: Vec<String> = if path.ends_with('/') {
                    // Directory removal deletes every key under the prefix.
                    let prefix = self.dir_key(path);
                    let mut keys = Vec::new();
                    let mut token: Option<String> = None;
                    loop {
                        let mut req = self
                            .client
                            .list_objects_v2()
                            .bucket(&self.bucket)
                            .prefix(&prefix);
                        if let Some(t) = &token {
                            req = req.continuation_token(t);
                        }
                        let resp = req
                            .send()
                            .await
                            .map_err(|e| sdk_error("list_objects_v2", e))?;
                        keys.extend(resp.contents().iter().filter_map(|o| o.key().map(str::to_string)));
                        token = resp.next_continuation_token().map(str::to_string);
                        if token.is_none() {
                            break;
                        }
                    }
                    keys
                } else {
                    vec![self.key(path)]
                };

                if keys.is_empty() {
                    return Err(DriverError::not_found(format!("{path} not found")));
                }

                for batch in keys.chunks(DELETE_BATCH) {
                    let objects: Vec<aws_sdk_s3::types::ObjectIdentifier> = batch
                        .iter()
                        .map(|key| {
                            aws_sdk_s3::types::ObjectIdentifier::builder()
                                .key(key)
                                .build()
                                .map_err(|e| DriverError::new("S3_ERROR", e.to_string()))
                        })
                        .collect::<Result<_, _>>()?;
                    let delete = aws_sdk_s3::types::Delete::builder()
                        .set_objects(Some(objects))
                        .build()
                        .map_err(|e| DriverError::new("S3_ERROR", e.to_string()))?;
                    self.client
                        .delete_objects()
                        .bucket(&self.bucket)
                        .delete(delete)
                        .send()
                        .await
                        .map_err(|e| sdk_error("delete_objects", e))?;
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
        // S3 has no rename; copy then delete.
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, self.key(old_path)))
            .key(self.key(new_path))
            .send()
            .await
            .map_err(|e| sdk_error("copy_object", e))?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(old_path))
            .send()
            .await
            .map_err(|e| sdk_error("delete_object", e))?;
        Ok(())
    }

    async fn copy_item(
        &self,
        source_path: &str,
        target_path: &str,
        opts: &CopyOptions,
    ) -> Result<CopyOutcome, DriverError> {
        let source_size = self
            .head_size(source_path)
            .await?
            .ok_or_else(|| DriverError::not_found(format!("{source_path} not found")))?;

        if opts.skip_existing
            && let Some(existing) = self.head_size(target_path).await?
            && existing == source_size
        {
            return Ok(CopyOutcome {
                status: CopyStatus::Skipped,
                source_path: source_path.to_string(),
                target_path: target_path.to_string(),
                content_length: Some(source_size),
                error: None,
            });
        }

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, self.key(source_path)))
            .key(self.key(target_path))
            .send()
            .await
            .map_err(|e| sdk_error("copy_object", e))?;

        // Server-side copy; report completion in one tick.
        if let Some(on_progress) = &opts.on_progress {
            on_progress(source_size);
        }

        Ok(CopyOutcome {
            status: CopyStatus::Success,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            content_length: Some(source_size),
            error: None,
        })
    }

    async fn prepare_cross_storage_copy(
        &self,
        source_path: &str,
        target_path: &str,
    ) -> Result<CrossStoragePlan, DriverError> {
        let url = self.generate_download_url(source_path, 3600).await?;
        Ok(CrossStoragePlan {
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            download_url: Some(url),
        })
    }

    async fn generate_download_url(
        &self,
        path: &str,
        expires_in: u64,
    ) -> Result<DownloadUrl, DriverError> {
        let url = self.presign_get(path, expires_in).await?;
        Ok(DownloadUrl {
            url,
            kind: self.url_kind(),
            expires_in: Some(expires_in),
            expires_at: Some(cloudpaste_core::ids::epoch_s() + expires_in as i64),
        })
    }

    async fn generate_upload_url(
        &self,
        path: &str,
        expires_in: u64,
    ) -> Result<DownloadUrl, DriverError> {
        let config = PresigningConfig::expires_in(Duration::from_secs(expires_in))
            .map_err(|e| DriverError::new("INVALID_CONFIG", e.to_string()))?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .presigned(config)
            .await
            .map_err(|e| sdk_error("presign put_object", e))?;
        Ok(DownloadUrl {
            url: self.rewrite_host(presigned.uri().to_string()),
            kind: self.url_kind(),
            expires_in: Some(expires_in),
            expires_at: Some(cloudpaste_core::ids::epoch_s() + expires_in as i64),
        })
    }

    async fn init_multipart_upload(
        &self,
        path: &str,
        req: &MultipartInitRequest,
    ) -> Result<MultipartInit, DriverError> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.key(path));
        if let Some(content_type) = &req.content_type {
            create = create.content_type(content_type);
        }
        let created = create
            .send()
            .await
            .map_err(|e| sdk_error("create_multipart_upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| DriverError::new("S3_ERROR", "missing upload id"))?
            .to_string();

        let part_size = req.part_size.unwrap_or(DEFAULT_PART_SIZE).max(MIN_PART_SIZE);
        let total_parts = req.file_size.div_ceil(part_size).max(1) as u32;
        let part_urls = self
            .refresh_multipart_urls(path, &upload_id, &(1..=total_parts).collect::<Vec<_>>())
            .await?;

        Ok(MultipartInit {
            storage_path: path.to_string(),
            strategy: MultipartStrategy::PerPartUrl,
            part_size,
            total_parts,
            upload_id: Some(upload_id),
            part_urls,
            session_url: None,
        })
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<MultipartComplete, DriverError> {
        let completed: Vec<aws_sdk_s3::types::CompletedPart> = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        let upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.key(path))
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| sdk_error("complete_multipart_upload", e))?;

        let size = self.head_size(path).await.unwrap_or(None);
        Ok(MultipartComplete {
            storage_path: path.to_string(),
            etag: resp.e_tag().map(str::to_string),
            size,
        })
    }

    async fn abort_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
    ) -> Result<(), DriverError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.key(path))
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("abort_multipart_upload", e))?;
        Ok(())
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
    ) -> Result<Vec<MultipartUploadInfo>, DriverError> {
        let resp = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(self.dir_key(prefix))
            .send()
            .await
            .map_err(|e| sdk_error("list_multipart_uploads", e))?;

        Ok(resp
            .uploads()
            .iter()
            .filter_map(|u| {
                Some(MultipartUploadInfo {
                    upload_id: u.upload_id()?.to_string(),
                    storage_path: format!(
                        "/{}",
                        u.key()?.strip_prefix(&self.root_prefix).unwrap_or(u.key()?)
                    ),
                    initiated_at: u.initiated().map(|t| t.secs()),
                })
            })
            .collect())
    }

    async fn list_multipart_parts(
        &self,
        path: &str,
        upload_id: &str,
    ) -> Result<Vec<PartInfo>, DriverError> {
        let resp = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(self.key(path))
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("list_parts", e))?;

        Ok(resp
            .parts()
            .iter()
            .map(|p| PartInfo {
                part_number: p.part_number().unwrap_or(0) as u32,
                size: p.size().map(|n| n as u64),
                etag: p.e_tag().map(str::to_string),
            })
            .collect())
    }

    async fn refresh_multipart_urls(
        &self,
        path: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> Result<Vec<PartUrl>, DriverError> {
        let config = PresigningConfig::expires_in(Duration::from_secs(3600))
            .map_err(|e| DriverError::new("INVALID_CONFIG", e.to_string()))?;
        let mut urls = Vec::with_capacity(part_numbers.len());
        for part_number in part_numbers {
            let presigned = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(self.key(path))
                .upload_id(upload_id)
                .part_number(*part_number as i32)
                .presigned(config.clone())
                .await
                .map_err(|e| sdk_error("presign upload_part", e))?;
            urls.push(PartUrl {
                part_number: *part_number,
                url: self.rewrite_host(presigned.uri().to_string()),
            });
        }
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> S3Driver {
        S3Driver::from_config(&serde_json::json!({
            "bucket": "media",
            "region": "eu-west-1",
            "access_key_id": "AKIA",
            "secret_access_key": "secret",
            "root_prefix": "paste",
        }))
        .unwrap()
    }

    #[test]
    fn key_mapping_respects_root_prefix() {
        let d = driver();
        assert_eq!(d.key("/a/b.txt"), "paste/a/b.txt");
        assert_eq!(d.dir_key("/a"), "paste/a/");
        assert_eq!(d.dir_key("/"), "paste/");
    }

    #[test]
    fn custom_host_rewrites_presigned_urls() {
        let d = S3Driver::from_config(&serde_json::json!({
            "bucket": "media",
            "access_key_id": "AKIA",
            "secret_access_key": "secret",
            "custom_host": "https://cdn.example.com",
        }))
        .unwrap();
        assert_eq!(d.url_kind(), UrlKind::CustomHost);
        let rewritten =
            d.rewrite_host("https://media.s3.amazonaws.com/a/b.txt?X-Amz-Signature=x".to_string());
        assert_eq!(rewritten, "https://cdn.example.com/a/b.txt?X-Amz-Signature=x");
    }

    #[test]
    fn missing_credentials_rejected() {
        let err = S3Driver::from_config(&serde_json::json!({"bucket": "media"})).unwrap_err();
        assert_eq!(err.code, "INVALID_CONFIG");
    }
}
