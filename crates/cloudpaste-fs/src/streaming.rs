//! Streaming access layer: uniform HTTP range/conditional semantics over
//! driver stream descriptors.
//!
//! Expected HTTP outcomes (304/412/416) are folded into the returned
//! `RangeReader` as data, not errors; only upstream failures surface as
//! `AppError`.

use futures_util::StreamExt as _;

use cloudpaste_core::AppError;
use cloudpaste_driver_api::{ByteStream, StreamDescriptor, StreamHandle};

use crate::range::{RangeDecision, parse_range};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    FsWeb,
    Webdav,
    Proxy,
    Share,
    ObjectApi,
    Preview,
    InternalJob,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::FsWeb => "fs-web",
            Channel::Webdav => "webdav",
            Channel::Proxy => "proxy",
            Channel::Share => "share",
            Channel::ObjectApi => "object-api",
            Channel::Preview => "preview",
            Channel::InternalJob => "internal-job",
        }
    }

    fn cache_policy(&self) -> Option<&'static str> {
        match self {
            Channel::FsWeb | Channel::Webdav | Channel::ObjectApi => Some("private, no-cache"),
            Channel::Proxy | Channel::Share | Channel::Preview => Some("public, max-age=3600"),
            Channel::InternalJob => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamRequest<'a> {
    pub channel: Option<Channel>,
    pub range_header: Option<&'a str>,
    pub if_none_match: Option<&'a str>,
    pub if_modified_since: Option<&'a str>,
    pub if_match: Option<&'a str>,
    pub if_unmodified_since: Option<&'a str>,
}

/// HTTP-semantics wrapper a transport adapter turns into a response.
/// Dropping the reader (or its body handle) cancels the transfer.
pub struct RangeReader {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body: Option<StreamHandle>,
}

impl RangeReader {
    fn empty(status: u16, headers: Vec<(String, String)>) -> Self {
        Self {
            status,
            headers,
            body: None,
        }
    }

    pub fn take_body(&mut self) -> Option<StreamHandle> {
        self.body.take()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

impl std::fmt::Debug for RangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeReader")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Weak ETag comparison: a `W/` prefix is ignored on either side.
fn etag_weak_eq(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches("W/").to_string();
    strip(a) == strip(b)
}

fn etag_list_matches(header: &str, etag: &str) -> bool {
    header.trim() == "*"
        || header
            .split(',')
            .any(|candidate| etag_weak_eq(candidate, etag))
}

fn parse_http_date(value: &str) -> Option<i64> {
    httpdate::parse_http_date(value)
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

enum Conditional {
    Proceed,
    NotModified,
    PreconditionFailed,
}

fn evaluate_conditionals(
    req: &StreamRequest<'_>,
    etag: Option<&str>,
    last_modified: Option<i64>,
) -> Conditional {
    if let Some(if_match) = req.if_match {
        let matched = match etag {
            Some(etag) => etag_list_matches(if_match, etag),
            None => if_match.trim() == "*",
        };
        if !matched {
            return Conditional::PreconditionFailed;
        }
    }

    if let (Some(if_unmodified), Some(modified)) = (req.if_unmodified_since, last_modified)
        && let Some(limit) = parse_http_date(if_unmodified)
        && modified > limit
    {
        return Conditional::PreconditionFailed;
    }

    if let (Some(if_none_match), Some(etag)) = (req.if_none_match, etag) {
        if etag_list_matches(if_none_match, etag) {
            return Conditional::NotModified;
        }
        // An If-None-Match header takes precedence over If-Modified-Since.
        return Conditional::Proceed;
    }

    if let (Some(if_modified), Some(modified)) = (req.if_modified_since, last_modified)
        && let Some(since) = parse_http_date(if_modified)
        && modified <= since
    {
        return Conditional::NotModified;
    }

    Conditional::Proceed
}

/// Skip `skip` bytes, then pass through at most `take` bytes. Used when a
/// driver delivered a full body for a range request.
pub fn slice_stream(inner: ByteStream, skip: u64, take: Option<u64>) -> ByteStream {
    let state = (inner, skip, take.unwrap_or(u64::MAX));
    Box::pin(futures::stream::unfold(
        state,
        |(mut inner, mut skip, mut remaining)| async move {
            loop {
                if remaining == 0 {
                    return None;
                }
                let mut chunk = match inner.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(error)) => return Some((Err(error), (inner, skip, 0))),
                    None => return None,
                };
                if skip > 0 {
                    if (chunk.len() as u64) <= skip {
                        skip -= chunk.len() as u64;
                        continue;
                    }
                    chunk = chunk.slice(skip as usize..);
                    skip = 0;
                }
                if (chunk.len() as u64) > remaining {
                    chunk = chunk.slice(..remaining as usize);
                }
                remaining -= chunk.len() as u64;
                return Some((Ok(chunk), (inner, skip, remaining)));
            }
        },
    ))
}

fn validator_headers(etag: Option<&str>, last_modified: Option<i64>) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if let Some(etag) = etag {
        headers.push(("ETag".to_string(), etag.to_string()));
    }
    if let Some(modified) = last_modified
        && let Ok(modified) = u64::try_from(modified)
    {
        let when = std::time::UNIX_EPOCH + std::time::Duration::from_secs(modified);
        headers.push(("Last-Modified".to_string(), httpdate::fmt_http_date(when)));
    }
    headers
}

/// Produce a `RangeReader` for a download request against a descriptor.
pub async fn open_range_reader(
    descriptor: &dyn StreamDescriptor,
    req: &StreamRequest<'_>,
) -> Result<RangeReader, AppError> {
    let size = descriptor.size();
    let etag = descriptor.etag().map(str::to_string);
    let last_modified = descriptor.last_modified();

    let mut headers = validator_headers(etag.as_deref(), last_modified);

    match evaluate_conditionals(req, etag.as_deref(), last_modified) {
        Conditional::NotModified => return Ok(RangeReader::empty(304, headers)),
        Conditional::PreconditionFailed => return Ok(RangeReader::empty(412, headers)),
        Conditional::Proceed => {}
    }

    headers.push(("Accept-Ranges".to_string(), "bytes".to_string()));
    headers.push((
        "Content-Type".to_string(),
        descriptor
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string(),
    ));
    if let Some(channel) = req.channel
        && let Some(policy) = channel.cache_policy()
    {
        headers.push(("Cache-Control".to_string(), policy.to_string()));
    }

    let decision = parse_range(req.range_header, size);

    match decision {
        RangeDecision::Unsatisfiable => {
            let size = size.unwrap_or(0);
            headers.push(("Content-Range".to_string(), format!("bytes */{size}")));
            Ok(RangeReader::empty(416, headers))
        }
        RangeDecision::Full => {
            let handle = descriptor.open().await?;
            if let Some(size) = size {
                headers.push(("Content-Length".to_string(), size.to_string()));
            }
            Ok(RangeReader {
                status: 200,
                headers,
                body: Some(handle),
            })
        }
        RangeDecision::Partial { start, end } => {
            let take = end.map(|end| end - start + 1);
            let handle = match descriptor.open_range(start, end).await? {
                Some(handle) if handle.supports_range => handle,
                Some(full_body) => {
                    // The driver delivered a full stream despite the range
                    // (e.g. a WebDAV server that ignored the header).
                    StreamHandle::new(slice_stream(full_body.stream, start, take))
                }
                None => {
                    let full = descriptor.open().await?;
                    StreamHandle::new(slice_stream(full.stream, start, take))
                }
            };

            if let Some(length) = take {
                headers.push(("Content-Length".to_string(), length.to_string()));
            }
            match (end, size) {
                (Some(end), Some(size)) => {
                    headers.push(("Content-Range".to_string(), format!("bytes {start}-{end}/{size}")));
                }
                // Unknown total size: no honest Content-Range can be formed.
                _ => {}
            }
            Ok(RangeReader {
                status: 206,
                headers,
                body: Some(handle),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use cloudpaste_core::DriverError;

    use super::*;

    /// In-memory descriptor with a switch for range-ignoring backends.
    struct MemoryDescriptor {
        data: Vec<u8>,
        etag: Option<&'static str>,
        last_modified: Option<i64>,
        honors_range: bool,
        native_range: bool,
    }

    impl MemoryDescriptor {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                etag: None,
                last_modified: None,
                honors_range: true,
                native_range: true,
            }
        }

        fn chunked(&self, from: usize, to: usize) -> ByteStream {
            let chunks: Vec<std::io::Result<Bytes>> = self.data[from..to]
                .chunks(7)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Box::pin(futures::stream::iter(chunks))
        }
    }

    #[async_trait]
    impl StreamDescriptor for MemoryDescriptor {
        fn size(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        fn content_type(&self) -> Option<&str> {
            Some("text/plain")
        }

        fn etag(&self) -> Option<&str> {
            self.etag
        }

        fn last_modified(&self) -> Option<i64> {
            self.last_modified
        }

        async fn open(&self) -> Result<StreamHandle, DriverError> {
            Ok(StreamHandle::new(self.chunked(0, self.data.len())))
        }

        async fn open_range(
            &self,
            start: u64,
            end: Option<u64>,
        ) -> Result<Option<StreamHandle>, DriverError> {
            if !self.native_range {
                return Ok(None);
            }
            if !self.honors_range {
                // Full body despite the range request.
                return Ok(Some(StreamHandle::full_body(
                    self.chunked(0, self.data.len()),
                )));
            }
            let end = end.map(|e| e as usize + 1).unwrap_or(self.data.len());
            Ok(Some(StreamHandle::new(
                self.chunked(start as usize, end.min(self.data.len())),
            )))
        }
    }

    async fn collect(handle: StreamHandle) -> Vec<u8> {
        let mut body = Vec::new();
        let mut stream = handle.stream;
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        body
    }

    fn header<'a>(reader: &'a RangeReader, name: &str) -> Option<&'a str> {
        reader
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn thousand_bytes() -> Vec<u8> {
        (0..1000_u32).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn known_size_range_read() {
        let descriptor = MemoryDescriptor::new(thousand_bytes());
        let mut reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                range_header: Some("bytes=100-199"),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(reader.status, 206);
        assert_eq!(header(&reader, "Content-Length"), Some("100"));
        assert_eq!(
            header(&reader, "Content-Range"),
            Some("bytes 100-199/1000")
        );
        assert_eq!(header(&reader, "Accept-Ranges"), Some("bytes"));
        let body = collect(reader.take_body().unwrap()).await;
        assert_eq!(body, &thousand_bytes()[100..=199]);
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416_with_star_range() {
        let descriptor = MemoryDescriptor::new(thousand_bytes());
        let reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                range_header: Some("bytes=2000-2999"),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(reader.status, 416);
        assert_eq!(header(&reader, "Content-Range"), Some("bytes */1000"));
        assert!(!reader.has_body());
    }

    #[tokio::test]
    async fn conditional_get_returns_304_with_etag() {
        let mut descriptor = MemoryDescriptor::new(thousand_bytes());
        descriptor.etag = Some("\"v1\"");
        let reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                if_none_match: Some("\"v1\""),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(reader.status, 304);
        assert_eq!(header(&reader, "ETag"), Some("\"v1\""));
        assert!(!reader.has_body());

        // Weak comparison strips W/.
        let reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                if_none_match: Some("W/\"v1\""),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(reader.status, 304);
    }

    #[tokio::test]
    async fn if_match_mismatch_is_412() {
        let mut descriptor = MemoryDescriptor::new(thousand_bytes());
        descriptor.etag = Some("\"v2\"");
        let reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                if_match: Some("\"v1\""),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(reader.status, 412);
        assert!(!reader.has_body());
    }

    #[tokio::test]
    async fn full_read_has_length_and_cache_policy() {
        let descriptor = MemoryDescriptor::new(thousand_bytes());
        let mut reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                channel: Some(Channel::Share),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(reader.status, 200);
        assert_eq!(header(&reader, "Content-Length"), Some("1000"));
        assert_eq!(header(&reader, "Content-Type"), Some("text/plain"));
        assert_eq!(header(&reader, "Cache-Control"), Some("public, max-age=3600"));
        let body = collect(reader.take_body().unwrap()).await;
        assert_eq!(body, thousand_bytes());
    }

    #[tokio::test]
    async fn range_ignoring_backend_gets_software_sliced() {
        let mut descriptor = MemoryDescriptor::new(thousand_bytes());
        descriptor.honors_range = false;
        let mut reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                range_header: Some("bytes=10-29"),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(reader.status, 206);
        let body = collect(reader.take_body().unwrap()).await;
        assert_eq!(body, &thousand_bytes()[10..=29]);
    }

    #[tokio::test]
    async fn no_native_range_support_gets_software_sliced() {
        let mut descriptor = MemoryDescriptor::new(thousand_bytes());
        descriptor.native_range = false;
        let mut reader = open_range_reader(
            &descriptor,
            &StreamRequest {
                range_header: Some("bytes=990-"),
                ..StreamRequest::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(reader.status, 206);
        assert_eq!(header(&reader, "Content-Range"), Some("bytes 990-999/1000"));
        let body = collect(reader.take_body().unwrap()).await;
        assert_eq!(body, &thousand_bytes()[990..]);
    }
}
