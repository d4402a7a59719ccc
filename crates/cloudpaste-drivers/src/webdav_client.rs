use std::time::{Duration, UNIX_EPOCH};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use url::Url;

use cloudpaste_core::DriverError;

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/');

pub(crate) fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.set_query(None);
    redacted.set_fragment(None);
    redacted.to_string()
}

fn parent_collection_url(url: &Url) -> Option<Url> {
    // `Url` paths are always absolute; `/` is the root boundary and is never
    // MKCOL'd (servers typically reject that).
    let trimmed = url.path().trim_end_matches('/');
    let slash = trimmed.rfind('/')?;
    if slash == 0 {
        return None;
    }

    let mut parent = url.clone();
    parent.set_path(&format!("{}/", &trimmed[..slash]));
    Some(parent)
}

#[derive(Debug, Clone)]
pub struct WebdavCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebdavPropfindEntry {
    pub href: String,
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
}

/// Metadata scraped from a GET/HEAD response.
#[derive(Debug, Clone, Default)]
pub struct WebdavFileMeta {
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
}

fn transport_error(error: reqwest::Error) -> DriverError {
    let code = if error.is_timeout() {
        "TIMEOUT"
    } else if error.is_connect() {
        "CONNECTION"
    } else {
        "NETWORK"
    };
    DriverError::new(code, error.to_string()).with_source(error)
}

fn http_error(status: StatusCode, message: String) -> DriverError {
    let code = match status {
        StatusCode::NOT_FOUND => "NOT_FOUND".to_string(),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => "FORBIDDEN".to_string(),
        s => format!("WEBDAV_HTTP_{}", s.as_u16()),
    };
    DriverError::new(code, format!("webdav request failed: HTTP {status}: {message}"))
        .with_status(status.as_u16())
}

fn parse_retry_after(res: &reqwest::Response) -> Option<Duration> {
    let v = res.headers().get(RETRY_AFTER)?.to_str().ok()?.trim();
    if v.is_empty() {
        return None;
    }

    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    // Retry-After also supports HTTP-date.
    if let Ok(t) = httpdate::parse_http_date(v) {
        if let Ok(d) = t.duration_since(std::time::SystemTime::now()) {
            return Some(d);
        }
        return Some(Duration::from_secs(0));
    }

    None
}

#[derive(Debug, Clone)]
pub struct WebdavClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: WebdavCredentials,
}

impl WebdavClient {
    pub fn new(base_url: Url, credentials: WebdavCredentials) -> Result<Self, DriverError> {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(
            self.credentials.username.clone(),
            Some(self.credentials.password.clone()),
        )
    }

    /// Map a driver sub-path onto the remote, percent-encoding each segment.
    pub fn url_for(&self, sub_path: &str) -> Result<Url, DriverError> {
        let trailing = sub_path.ends_with('/');
        let encoded: Vec<String> = sub_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|seg| utf8_percent_encode(seg, PATH_SEGMENT).to_string())
            .collect();
        let mut rel = encoded.join("/");
        if trailing && !rel.is_empty() {
            rel.push('/');
        }
        self.base_url
            .join(&rel)
            .map_err(|e| DriverError::new("INVALID_PATH", e.to_string()))
    }

    pub async fn propfind(
        &self,
        url: &Url,
        depth: u32,
    ) -> Result<Vec<WebdavPropfindEntry>, DriverError> {
        const BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getcontentlength/>
    <D:getlastmodified/>
    <D:getcontenttype/>
  </D:prop>
</D:propfind>
"#;
        tracing::debug!(url = %redact_url(url), depth, "webdav propfind");
        let depth_name = reqwest::header::HeaderName::from_static("depth");
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|e| DriverError::new("WEBDAV_ERROR", e.to_string()))?;
        let res = self
            .authed(
                self.http
                    .request(method, url.clone())
                    .header(depth_name, depth.to_string())
                    .header(CONTENT_TYPE, "application/xml")
                    .body(BODY),
            )
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        if status != StatusCode::MULTI_STATUS && status != StatusCode::OK {
            let message = res.text().await.unwrap_or_default();
            return Err(http_error(status, message));
        }

        let text = res.text().await.map_err(transport_error)?;
        parse_propfind_multistatus(&text)
    }

    /// WebDAV MKCOL does not create intermediate collections; many servers
    /// answer 409 when parents are missing, so parents are created first.
    pub async fn ensure_collection(&self, url: &Url) -> Result<(), DriverError> {
        let mut pending = Vec::<Url>::new();
        let mut current = url.clone();
        let mut base_ready = false;

        for _ in 0..=32 {
            let status = self.mkcol_once(&current).await?;
            match status {
                StatusCode::CREATED | StatusCode::METHOD_NOT_ALLOWED | StatusCode::OK => {
                    base_ready = true;
                    break;
                }
                StatusCode::CONFLICT => {
                    let parent = parent_collection_url(&current).ok_or_else(|| {
                        DriverError::new(
                            "WEBDAV_ERROR",
                            "MKCOL failed: HTTP 409 (missing parent collections)",
                        )
                        .with_status(409)
                    })?;
                    pending.push(current);
                    current = parent;
                }
                s => return Err(http_error(s, "MKCOL failed".to_string())),
            }
        }

        if !base_ready {
            return Err(DriverError::new(
                "WEBDAV_ERROR",
                "mkcol recursion limit exceeded",
            ));
        }

        while let Some(next) = pending.pop() {
            let status = self.mkcol_once(&next).await?;
            match status {
                StatusCode::CREATED | StatusCode::METHOD_NOT_ALLOWED | StatusCode::OK => {}
                s => return Err(http_error(s, "MKCOL failed".to_string())),
            }
        }

        Ok(())
    }

    async fn mkcol_once(&self, url: &Url) -> Result<StatusCode, DriverError> {
        let method = Method::from_bytes(b"MKCOL")
            .map_err(|e| DriverError::new("WEBDAV_ERROR", e.to_string()))?;
        let mut attempt = 1_u32;
        let mut backoff = Duration::from_secs(1);
        loop {
            tracing::debug!(url = %redact_url(url), "webdav mkcol");
            let res = self
                .authed(self.http.request(method.clone(), url.clone()))
                .send()
                .await
                .map_err(transport_error)?;
            let status = res.status();
            match status {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE if attempt < 3 => {
                    let delay = parse_retry_after(&res)
                        .unwrap_or(backoff)
                        .min(Duration::from_secs(60));
                    tokio::time::sleep(delay).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    attempt += 1;
                }
                _ => return Ok(status),
            }
        }
    }

    pub async fn head(&self, url: &Url) -> Result<Option<WebdavFileMeta>, DriverError> {
        tracing::debug!(url = %redact_url(url), "webdav head");
        let res = self
            .authed(self.http.head(url.clone()))
            .send()
            .await
            .map_err(transport_error)?;

        match res.status() {
            StatusCode::OK => Ok(Some(meta_from_headers(&res))),
            StatusCode::NOT_FOUND => Ok(None),
            s => {
                let message = res.text().await.unwrap_or_default();
                Err(http_error(s, message))
            }
        }
    }

    /// GET, optionally with a byte range. Returns the response plus whether
    /// the server actually honored the range (206). Servers are allowed to
    /// ignore `Range` and answer 200 with the full body.
    pub async fn get(
        &self,
        url: &Url,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<(reqwest::Response, WebdavFileMeta, bool), DriverError> {
        tracing::debug!(url = %redact_url(url), range = ?range, "webdav get");
        let mut req = self.http.get(url.clone());
        if let Some((start, end)) = range {
            let header = match end {
                Some(end) => format!("bytes={start}-{end}"),
                None => format!("bytes={start}-"),
            };
            req = req.header(RANGE, header);
        }

        let res = self.authed(req).send().await.map_err(transport_error)?;
        let status = res.status();
        match status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                let meta = meta_from_headers(&res);
                let ranged = status == StatusCode::PARTIAL_CONTENT;
                Ok((res, meta, ranged))
            }
            s => {
                let message = res.text().await.unwrap_or_default();
                Err(http_error(s, message))
            }
        }
    }

    pub async fn put_stream(
        &self,
        url: &Url,
        body: reqwest::Body,
        size: Option<u64>,
        content_type: &str,
    ) -> Result<(), DriverError> {
        tracing::debug!(url = %redact_url(url), size = ?size, "webdav put");
        let mut req = self
            .http
            .put(url.clone())
            .header(CONTENT_TYPE, content_type.to_string())
            .body(body);
        if let Some(size) = size {
            req = req.header(CONTENT_LENGTH, size);
        }

        let res = self.authed(req).send().await.map_err(transport_error)?;
        let status = res.status();
        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            s => {
                let message = res.text().await.unwrap_or_default();
                Err(http_error(s, message))
            }
        }
    }

    pub async fn delete(&self, url: &Url) -> Result<bool, DriverError> {
        tracing::debug!(url = %redact_url(url), "webdav delete");
        let res = self
            .authed(self.http.delete(url.clone()))
            .send()
            .await
            .map_err(transport_error)?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => {
                let message = res.text().await.unwrap_or_default();
                Err(http_error(s, message))
            }
        }
    }

    async fn destination_request(
        &self,
        verb: &'static [u8],
        source: &Url,
        destination: &Url,
        overwrite: bool,
    ) -> Result<(), DriverError> {
        let method = Method::from_bytes(verb)
            .map_err(|e| DriverError::new("WEBDAV_ERROR", e.to_string()))?;
        tracing::debug!(
            source = %redact_url(source),
            destination = %redact_url(destination),
            method = %method,
            "webdav destination request"
        );
        let destination_name = reqwest::header::HeaderName::from_static("destination");
        let overwrite_name = reqwest::header::HeaderName::from_static("overwrite");
        let res = self
            .authed(
                self.http
                    .request(method, source.clone())
                    .header(destination_name, destination.to_string())
                    .header(overwrite_name, if overwrite { "T" } else { "F" }),
            )
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = res.text().await.unwrap_or_default();
            Err(http_error(status, message))
        }
    }

    pub async fn move_to(
        &self,
        source: &Url,
        destination: &Url,
        overwrite: bool,
    ) -> Result<(), DriverError> {
        self.destination_request(b"MOVE", source, destination, overwrite)
            .await
    }

    pub async fn copy_to(
        &self,
        source: &Url,
        destination: &Url,
        overwrite: bool,
    ) -> Result<(), DriverError> {
        self.destination_request(b"COPY", source, destination, overwrite)
            .await
    }
}

fn meta_from_headers(res: &reqwest::Response) -> WebdavFileMeta {
    let size = res
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    let content_type = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let etag = res
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = res
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    WebdavFileMeta {
        size,
        content_type,
        etag,
        last_modified,
    }
}

fn parse_propfind_multistatus(xml: &str) -> Result<Vec<WebdavPropfindEntry>, DriverError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| DriverError::new("WEBDAV_ERROR", format!("invalid multistatus: {e}")))?;

    let mut out = Vec::<WebdavPropfindEntry>::new();
    for response in doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "response")
    {
        let Some(mut href) = response
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "href")
            .and_then(|n| n.text())
            .and_then(decode_href_path)
        else {
            continue;
        };

        let mut is_directory = false;
        let mut size = None::<u64>;
        let mut mtime = None::<i64>;

        for propstat in response
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "propstat")
        {
            let status = propstat
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "status")
                .and_then(|n| n.text())
                .unwrap_or("");
            if !status.contains(" 200 ") {
                continue;
            }

            let Some(prop) = propstat
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "prop")
            else {
                continue;
            };

            if let Some(resourcetype) = prop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "resourcetype")
                && resourcetype
                    .children()
                    .any(|n| n.is_element() && n.tag_name().name() == "collection")
            {
                is_directory = true;
                if !href.ends_with('/') {
                    href.push('/');
                }
            }

            size = prop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "getcontentlength")
                .and_then(|n| n.text())
                .map(str::trim)
                .and_then(|v| v.parse::<u64>().ok());

            if let Some(v) = prop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "getlastmodified")
                .and_then(|n| n.text())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                && let Ok(t) = httpdate::parse_http_date(v)
                && let Ok(d) = t.duration_since(UNIX_EPOCH)
            {
                mtime = Some(d.as_secs() as i64);
            }

            break;
        }

        out.push(WebdavPropfindEntry {
            name: basename_from_href(&href),
            href,
            is_directory,
            size,
            mtime,
        });
    }

    Ok(out)
}

fn decode_href_path(href: &str) -> Option<String> {
    let raw = href.trim();
    if raw.is_empty() {
        return None;
    }

    let mut path_raw = if raw.starts_with("http://") || raw.starts_with("https://") {
        // Some servers return absolute-URL hrefs.
        Url::parse(raw).ok()?.path().to_string()
    } else {
        raw.to_string()
    };

    if !path_raw.starts_with('/') {
        path_raw = format!("/{path_raw}");
    }

    let trailing_slash = path_raw.ends_with('/');
    let parts = path_raw
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().to_string())
        .collect::<Vec<_>>();
    let mut out = format!("/{}", parts.join("/"));
    if trailing_slash && !out.ends_with('/') {
        out.push('/');
    }

    Some(out)
}

fn basename_from_href(href: &str) -> String {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multistatus_parses_dirs_files_and_sizes() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/docs/</D:href>
    <D:propstat>
      <D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/docs/a%20file.txt</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getcontentlength>42</D:getcontentlength>
        <D:getlastmodified>Wed, 01 Jan 2025 00:00:00 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

        let entries = parse_propfind_multistatus(xml).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory);
        assert_eq!(entries[0].href, "/dav/docs/");
        assert_eq!(entries[1].name, "a file.txt");
        assert_eq!(entries[1].size, Some(42));
        assert!(entries[1].mtime.is_some());
    }

    #[test]
    fn href_decoding_handles_absolute_urls() {
        assert_eq!(
            decode_href_path("https://dav.example.com/x/y%2Bz/").unwrap(),
            "/x/y+z/"
        );
        assert_eq!(decode_href_path("a/b").unwrap(), "/a/b");
        assert!(decode_href_path("  ").is_none());
    }

    #[test]
    fn url_for_encodes_segments() {
        let client = WebdavClient::new(
            Url::parse("https://dav.example.com/base").unwrap(),
            WebdavCredentials {
                username: "u".into(),
                password: "p".into(),
            },
        )
        .unwrap();
        let url = client.url_for("/dir with space/file#1.txt").unwrap();
        assert_eq!(
            url.as_str(),
            "https://dav.example.com/base/dir%20with%20space/file%231.txt"
        );
        let dir = client.url_for("/d/").unwrap();
        assert!(dir.as_str().ends_with("/d/"));
    }

    #[test]
    fn parent_collection_stops_at_root() {
        let url = Url::parse("https://h/a/b/").unwrap();
        let parent = parent_collection_url(&url).unwrap();
        assert_eq!(parent.path(), "/a/");
        assert!(parent_collection_url(&Url::parse("https://h/a/").unwrap()).is_none());
    }
}
