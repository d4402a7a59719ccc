//! Storage driver contract.
//!
//! A driver implements the three required methods plus whichever optional
//! method groups its declared capabilities promise. Optional methods default
//! to a typed `NOT_IMPLEMENTED` error, so a call that slipped past
//! capability gating still fails cleanly instead of panicking.

pub mod capability;
pub mod stream;
pub mod types;

use async_trait::async_trait;

use cloudpaste_core::DriverError;

pub use capability::{Capability, CapabilitySet};
pub use stream::{ByteStream, StreamDescriptor, StreamHandle};
pub use types::*;

fn unimplemented<T>(method: &'static str) -> Result<T, DriverError> {
    Err(DriverError::new(
        "NOT_IMPLEMENTED",
        format!("driver does not implement {method}"),
    ))
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// The capability set this driver declares. Validated against the
    /// per-kind supported table at construction.
    fn capabilities(&self) -> CapabilitySet;

    async fn initialize(&self) -> Result<(), DriverError>;

    async fn cleanup(&self) -> Result<(), DriverError> {
        Ok(())
    }

    // READER

    async fn list_directory(
        &self,
        path: &str,
        opts: &ListOptions,
    ) -> Result<DirListing, DriverError> {
        let _ = (path, opts);
        unimplemented("list_directory")
    }

    async fn get_file_info(&self, path: &str) -> Result<FileInfo, DriverError> {
        let _ = path;
        unimplemented("get_file_info")
    }

    async fn download_file(&self, path: &str) -> Result<Box<dyn StreamDescriptor>, DriverError> {
        let _ = path;
        unimplemented("download_file")
    }

    // WRITER

    async fn upload_file(
        &self,
        path: &str,
        source: UploadSource,
        opts: &UploadOptions,
    ) -> Result<FileInfo, DriverError> {
        let _ = (path, source, opts);
        unimplemented("upload_file")
    }

    async fn create_directory(&self, path: &str) -> Result<(), DriverError> {
        let _ = path;
        unimplemented("create_directory")
    }

    async fn batch_remove_items(&self, paths: &[String]) -> Result<BatchRemoveResult, DriverError> {
        let _ = paths;
        unimplemented("batch_remove_items")
    }

    // ATOMIC (same-storage rename/copy)

    async fn rename_item(&self, old_path: &str, new_path: &str) -> Result<(), DriverError> {
        let _ = (old_path, new_path);
        unimplemented("rename_item")
    }

    async fn copy_item(
        &self,
        source_path: &str,
        target_path: &str,
        opts: &CopyOptions,
    ) -> Result<CopyOutcome, DriverError> {
        let _ = (source_path, target_path, opts);
        unimplemented("copy_item")
    }

    /// Prepare a cross-storage transfer for one item. The default plan has
    /// no presigned source; drivers with DIRECT_LINK attach one so the copy
    /// worker can pull straight from the backing store.
    async fn prepare_cross_storage_copy(
        &self,
        source_path: &str,
        target_path: &str,
    ) -> Result<CrossStoragePlan, DriverError> {
        Ok(CrossStoragePlan {
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            download_url: None,
        })
    }

    // DIRECT_LINK

    async fn generate_download_url(
        &self,
        path: &str,
        expires_in: u64,
    ) -> Result<DownloadUrl, DriverError> {
        let _ = (path, expires_in);
        unimplemented("generate_download_url")
    }

    async fn generate_upload_url(
        &self,
        path: &str,
        expires_in: u64,
    ) -> Result<DownloadUrl, DriverError> {
        let _ = (path, expires_in);
        unimplemented("generate_upload_url")
    }

    // PROXY

    fn supports_proxy_mode(&self) -> bool {
        false
    }

    fn generate_proxy_url(&self, path: &str) -> Result<ProxyUrl, DriverError> {
        let _ = path;
        unimplemented("generate_proxy_url")
    }

    // MULTIPART

    async fn init_multipart_upload(
        &self,
        path: &str,
        req: &MultipartInitRequest,
    ) -> Result<MultipartInit, DriverError> {
        let _ = (path, req);
        unimplemented("init_multipart_upload")
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<MultipartComplete, DriverError> {
        let _ = (path, upload_id, parts);
        unimplemented("complete_multipart_upload")
    }

    async fn abort_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
    ) -> Result<(), DriverError> {
        let _ = (path, upload_id);
        unimplemented("abort_multipart_upload")
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
    ) -> Result<Vec<MultipartUploadInfo>, DriverError> {
        let _ = prefix;
        unimplemented("list_multipart_uploads")
    }

    async fn list_multipart_parts(
        &self,
        path: &str,
        upload_id: &str,
    ) -> Result<Vec<PartInfo>, DriverError> {
        let _ = (path, upload_id);
        unimplemented("list_multipart_parts")
    }

    async fn refresh_multipart_urls(
        &self,
        path: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> Result<Vec<PartUrl>, DriverError> {
        let _ = (path, upload_id, part_numbers);
        unimplemented("refresh_multipart_urls")
    }
}

/// Gate an operation on a declared capability.
pub fn require_capability(
    driver: &dyn StorageDriver,
    cap: Capability,
) -> Result<(), cloudpaste_core::AppError> {
    if driver.capabilities().contains(cap) {
        Ok(())
    } else {
        Err(cloudpaste_core::AppError::NotImplemented(cap.method_group()))
    }
}
