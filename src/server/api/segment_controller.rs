use axum::{
    Router,
    extract::Path,
    http::{HeaderMap, Method, StatusCode},
    response::Response,
    routing::get,
};
use tracing::debug;
use url::Url;

use crate::manifest::{HLS_MIME, rewrite_hls};
use crate::server::{
    error::{AppResult, Error},
    extractors::RateLimitedClient,
    services::{
        SegmentLookup,
        upstream_services::{UpstreamRequest, UpstreamResponse, read_manifest},
    },
    utils::response_utils::{
        SEGMENT_REQUEST_HEADERS, forward_headers, manifest_response, stream_response,
    },
};

pub struct SegmentController;

impl SegmentController {
    pub fn app() -> Router {
        Router::new().route("/segment/{file}", get(Self::segment))
    }

    /// `/segment/<id>.ts`, resolves the id through the registry and streams the upstream resource
    async fn segment(
        RateLimitedClient(client_id, services): RateLimitedClient,
        Path(file): Path<String>,
        method: Method,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let id = file.strip_suffix(".ts").unwrap_or(&file);

        let target_url = match services.segments.lookup(id) {
            SegmentLookup::Found(url) => url,
            SegmentLookup::Expired => return Err(Error::SegmentExpired),
            SegmentLookup::NotFound => return Err(Error::SegmentNotFound),
        };
        debug!("client {} segment {} -> {}", client_id, id, target_url);

        let head_only = method == Method::HEAD;
        let request = UpstreamRequest {
            url: target_url,
            method: if head_only { Method::HEAD } else { Method::GET },
            headers: forward_headers(&headers, &SEGMENT_REQUEST_HEADERS),
        };

        let response = services.upstream.fetch(request).await?;

        // variant playlists point at media playlists, those come through here too and need the
        // same rewrite as the top level playlist
        if !head_only && Self::is_hls_playlist(&response) {
            let base_url = Url::parse(&response.url).map_err(|e| {
                Error::UpstreamUnavailable(format!("upstream returned an invalid url: {}", e))
            })?;
            let text = read_manifest(response).await?;
            let body = rewrite_hls(&text, &base_url, &services.segments);
            return manifest_response(&body, HLS_MIME, &headers);
        }

        Ok(stream_response(response, head_only))
    }

    fn is_hls_playlist(response: &UpstreamResponse) -> bool {
        if response.status != StatusCode::OK {
            return false;
        }

        let content_type = response.content_type().to_ascii_lowercase();
        content_type.contains("mpegurl")
            || Url::parse(&response.url)
                .map(|url| url.path().to_ascii_lowercase().ends_with(".m3u8"))
                .unwrap_or(false)
    }
}
