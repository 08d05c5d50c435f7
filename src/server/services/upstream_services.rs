use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, header};
use flate2::read::GzDecoder;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use mockall::automock;
use tracing::{debug, error, warn};

use crate::server::error::{AppResult, Error};

pub type DynUpstreamService = Arc<dyn UpstreamServiceTrait + Send + Sync>;

pub type UpstreamBody = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

pub struct UpstreamResponse {
    /// final url after redirects, relative manifest entries resolve against this
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> &str {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}

#[automock]
#[async_trait]
pub trait UpstreamServiceTrait {
    /// one upstream request, errors are already mapped to UpstreamUnavailable / UpstreamStatus /
    /// UpstreamTimeout
    async fn fetch(&self, request: UpstreamRequest) -> AppResult<UpstreamResponse>;
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

pub struct UpstreamService {
    http: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl UpstreamService {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        // redirects are followed here, the final url is handed back to the rewriters
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            timeout,
            retry,
        }
    }

    async fn fetch_once(&self, request: &UpstreamRequest) -> AppResult<UpstreamResponse> {
        let builder = self
            .http
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());

        // only the wait for headers is bounded, long segment bodies are allowed to keep streaming
        let response = match tokio::time::timeout(self.timeout, builder.send()).await {
            Err(_) => {
                error!("Upstream timed out after {:?}: {}", self.timeout, request.url);
                return Err(Error::UpstreamTimeout);
            }
            Ok(Err(e)) if e.is_timeout() => {
                error!("Upstream timed out: {}", e);
                return Err(Error::UpstreamTimeout);
            }
            Ok(Err(e)) => {
                error!("Request failed: {}", e);
                return Err(Error::UpstreamUnavailable(format!("request failed: {}", e)));
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        debug!("Received response with status: {}", status);

        // this line WILL get hit at some point.
        if status.is_client_error() || status.is_server_error() {
            error!("Response from target not successful: {}", status);
            return Err(Error::UpstreamStatus(status));
        }

        let url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(UpstreamResponse {
            url,
            status,
            headers,
            body,
        })
    }

    fn is_retryable(error: &Error) -> bool {
        match error {
            Error::UpstreamTimeout | Error::UpstreamUnavailable(_) => true,
            // 4xx won't get better by asking again
            Error::UpstreamStatus(status) => status.is_server_error(),
            _ => false,
        }
    }
}

#[async_trait]
impl UpstreamServiceTrait for UpstreamService {
    async fn fetch(&self, request: UpstreamRequest) -> AppResult<UpstreamResponse> {
        let attempts = self.retry.attempts.max(1);
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;

        loop {
            debug!("Fetching upstream (attempt {}/{}): {}", attempt, attempts, request.url);

            match self.fetch_once(&request).await {
                Err(e) if attempt < attempts && Self::is_retryable(&e) => {
                    warn!(
                        "Upstream attempt {} failed ({}), retrying in {:?}",
                        attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// largest manifest we're willing to read, before and after decompression
pub const MAX_MANIFEST_BYTES: usize = 16 * 1024 * 1024;

/// collects a manifest body, undoes gzip/zstd content encoding and decodes it as utf-8
pub async fn read_manifest(response: UpstreamResponse) -> AppResult<String> {
    read_manifest_limited(response, MAX_MANIFEST_BYTES).await
}

/// [`read_manifest`] with an explicit byte limit
pub async fn read_manifest_limited(response: UpstreamResponse, limit: usize) -> AppResult<String> {
    let content_encoding = response
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase());

    let bytes: Vec<u8> = response
        .body
        .map_err(|e| Error::UpstreamUnavailable(format!("failed to read response: {}", e)))
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            if acc.len() + chunk.len() > limit {
                return Err(Error::UpstreamUnavailable(format!(
                    "manifest larger than {} bytes",
                    limit
                )));
            }
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .inspect_err(|e| error!("Failed to read manifest: {}", e))?;

    debug!("Read {} manifest bytes", bytes.len());

    let decompressed: Vec<u8> = match content_encoding.as_deref() {
        Some("zstd") => {
            let decoder = zstd::stream::read::Decoder::new(&bytes[..]).map_err(|e| {
                error!("Failed to decompress zstd: {}", e);
                Error::UpstreamUnavailable("failed to decompress response".to_string())
            })?;
            read_decompressed(decoder, limit)?
        }
        Some("gzip") => read_decompressed(GzDecoder::new(&bytes[..]), limit)?,
        _ => bytes,
    };

    String::from_utf8(decompressed).map_err(|e| {
        error!("Failed to parse manifest as UTF-8: {}", e);
        Error::UpstreamUnavailable("manifest is not valid utf-8".to_string())
    })
}

fn read_decompressed(decoder: impl Read, limit: usize) -> AppResult<Vec<u8>> {
    let mut decomp: Vec<u8> = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut decomp)
        .map_err(|e| {
            error!("Failed to decompress response: {}", e);
            Error::UpstreamUnavailable("failed to decompress response".to_string())
        })?;

    if decomp.len() > limit {
        error!("Decompressed manifest over {} bytes", limit);
        return Err(Error::UpstreamUnavailable(format!(
            "manifest larger than {} bytes",
            limit
        )));
    }
    Ok(decomp)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{Compression, write::GzEncoder};
    use futures::stream;

    use super::*;

    fn response(chunks: Vec<&'static [u8]>, encoding: Option<&'static str>) -> UpstreamResponse {
        let mut headers = HeaderMap::new();
        if let Some(encoding) = encoding {
            headers.insert(header::CONTENT_ENCODING, encoding.parse().unwrap());
        }
        UpstreamResponse {
            url: "http://origin/index.m3u8".to_string(),
            status: StatusCode::OK,
            headers,
            body: stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed(),
        }
    }

    #[tokio::test]
    async fn reads_manifest_within_limit() {
        let text = read_manifest_limited(response(vec![b"#EXTM3U\n", b"seg.ts\n"], None), 16)
            .await
            .unwrap();
        assert_eq!(text, "#EXTM3U\nseg.ts\n");
    }

    #[tokio::test]
    async fn rejects_oversized_bodies() {
        let result = read_manifest_limited(response(vec![b"#EXTM3U\n", b"seg.ts\n"], None), 10).await;
        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn rejects_oversized_decompressed_bodies() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[b'#'; 4096]).unwrap();
        let compressed: &'static [u8] = Box::leak(encoder.finish().unwrap().into_boxed_slice());
        assert!(compressed.len() < 1024);

        let result = read_manifest_limited(response(vec![compressed], Some("gzip")), 1024).await;
        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
    }

    #[test]
    fn retries_only_transient_failures() {
        assert!(UpstreamService::is_retryable(&Error::UpstreamTimeout));
        assert!(UpstreamService::is_retryable(&Error::UpstreamUnavailable(
            "request failed".to_string()
        )));
        assert!(UpstreamService::is_retryable(&Error::UpstreamStatus(
            StatusCode::BAD_GATEWAY
        )));
        assert!(!UpstreamService::is_retryable(&Error::UpstreamStatus(
            StatusCode::NOT_FOUND
        )));
        assert!(!UpstreamService::is_retryable(&Error::BadRequest(
            "nope".to_string()
        )));
    }
}
