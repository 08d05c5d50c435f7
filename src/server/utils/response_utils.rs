use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error};

use crate::server::{
    error::{AppResult, Error},
    services::upstream_services::UpstreamResponse,
    utils::content_encoding::ContentEncoding,
};

/// headers a plain passthrough hands to the upstream
pub const PASSTHROUGH_REQUEST_HEADERS: [HeaderName; 9] = [
    header::RANGE,
    header::USER_AGENT,
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::ACCEPT_LANGUAGE,
    header::REFERER,
    header::ORIGIN,
    header::AUTHORIZATION,
    header::COOKIE,
];

/// registry segments may turn out to be playlists we have to read, so no accept-encoding here
pub const SEGMENT_REQUEST_HEADERS: [HeaderName; 4] = [
    header::RANGE,
    header::USER_AGENT,
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
];

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// media-ish responses get a short public cache unless upstream already said something
static MEDIA_CONTENT_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)video|audio|application/octet-stream|mp2t|mp4|dash|mssegment|mpegurl")
        .expect("media content type regex should compile")
});

const MEDIA_CACHE_CONTROL: &str = "public, max-age=60, stale-while-revalidate=30";

/// copies the allow-listed request headers that are actually present
pub fn forward_headers(request_headers: &HeaderMap, names: &[HeaderName]) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in names {
        if let Some(value) = request_headers.get(name) {
            forwarded.insert(name.clone(), value.clone());
        }
    }
    forwarded
}

/// headers used when we need the manifest text ourselves
pub fn manifest_request_headers(request_headers: &HeaderMap) -> HeaderMap {
    let mut headers = forward_headers(request_headers, &[header::USER_AGENT, header::ACCEPT]);
    // we decompress ourselves and respect the client's Accept-Encoding on the way back
    headers.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip, zstd"),
    );
    headers
}

/// rewritten manifest response with proper headers and optional compression
pub fn manifest_response(
    processed_body: &str,
    content_type: &'static str,
    request_headers: &HeaderMap,
) -> AppResult<Response> {
    // apple hls likes gzip, not zstd
    let encoding = ContentEncoding::from_accept_encoding(
        request_headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok()),
    );

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let response_body: Vec<u8> = if let Some(enc_header) = encoding.as_header_value() {
        let compressed_body = encoding.compress(processed_body.as_bytes()).map_err(|e| {
            error!("Failed to compress response with {:?}: {}", encoding, e);
            Error::InternalServerErrorWithContext("Failed to compress response".to_string())
        })?;
        debug!(
            "Compressed manifest with {:?} from {} to {} bytes",
            encoding,
            processed_body.len(),
            compressed_body.len()
        );
        response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(enc_header));
        response_headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        compressed_body
    } else {
        debug!(
            "Client doesn't accept compression, sending uncompressed manifest {} bytes",
            processed_body.len()
        );
        processed_body.as_bytes().to_vec()
    };

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response_body.len()));

    Ok((StatusCode::OK, response_headers, response_body).into_response())
}

/// mirrors upstream status and headers (minus hop-by-hop) and streams the body through
pub fn stream_response(upstream: UpstreamResponse, head_only: bool) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in &upstream.headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !headers.contains_key(header::CACHE_CONTROL)
        && MEDIA_CONTENT_TYPE.is_match(upstream.content_type())
    {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(MEDIA_CACHE_CONTROL),
        );
    }

    let body = if head_only {
        Body::empty()
    } else {
        Body::from_stream(upstream.body)
    };

    let mut response = Response::new(body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}
