use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use cloudpaste_core::DriverError;

/// Chunked file body. Items are io errors so transport adapters can
/// distinguish a mid-stream failure from a clean end.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// An open file body. Dropping the handle releases the underlying
/// connection or file descriptor; there is no separate close call.
pub struct StreamHandle {
    pub stream: ByteStream,
    /// Whether the stream already honors the range it was opened with.
    /// False means the driver delivered a full body (e.g. a WebDAV server
    /// that ignored `Range`) and the caller must slice in software.
    pub supports_range: bool,
}

impl StreamHandle {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            supports_range: true,
        }
    }

    pub fn full_body(stream: ByteStream) -> Self {
        Self {
            stream,
            supports_range: false,
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("supports_range", &self.supports_range)
            .finish_non_exhaustive()
    }
}

/// Metadata plus stream factories for one file, as returned by
/// `download_file`. The streaming access layer negotiates HTTP semantics
/// on top of this.
#[async_trait]
pub trait StreamDescriptor: Send + Sync {
    /// Total size in bytes; None when the backing store does not report it.
    fn size(&self) -> Option<u64>;

    fn content_type(&self) -> Option<&str> {
        None
    }

    fn etag(&self) -> Option<&str> {
        None
    }

    /// Last modification as unix seconds.
    fn last_modified(&self) -> Option<i64> {
        None
    }

    /// Open the full body.
    async fn open(&self) -> Result<StreamHandle, DriverError>;

    /// Open `[start, end]` (inclusive; `end = None` means to EOF). `Ok(None)`
    /// means the driver has no native range support and the caller should
    /// open the full body and slice.
    async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<Option<StreamHandle>, DriverError> {
        let _ = (start, end);
        Ok(None)
    }
}
