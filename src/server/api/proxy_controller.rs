use axum::{
    Router,
    extract::{Path, Query},
    http::{HeaderMap, Method},
    response::Response,
    routing::get,
};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::manifest::{HLS_MIME, ManifestKind, Mpd, mpd_to_hls, segment_path};
use crate::server::{
    error::{AppResult, Error},
    extractors::RateLimitedClient,
    services::{ProxyServices, upstream_services::UpstreamRequest},
    utils::{
        response_utils::{PASSTHROUGH_REQUEST_HEADERS, forward_headers, manifest_response, stream_response},
        url_utils::decode_target_url,
    },
};

#[derive(Deserialize)]
struct ProxyQuery {
    u: Option<String>,
}

#[derive(Deserialize)]
struct MpdPlaylistQuery {
    u: Option<String>,
    rep: Option<String>,
}

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new()
            .route("/proxy", get(Self::passthrough))
            .route("/segment", get(Self::passthrough))
            .route("/proxy.m3u8", get(Self::mpd_playlist))
            .route("/base/{*path}", get(Self::base_passthrough))
    }

    /// `?u=` carries the upstream url, plain, url encoded or base64. Status, headers and body come
    /// back as they are, no manifest rewriting on this path.
    async fn passthrough(
        RateLimitedClient(client_id, services): RateLimitedClient,
        Query(params): Query<ProxyQuery>,
        method: Method,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let raw = params
            .u
            .as_deref()
            .ok_or_else(|| Error::BadRequest("missing 'u' query parameter".to_string()))?;
        let target = decode_target_url(raw)?;

        debug!("client {} passthrough {} {}", client_id, method, target);
        Self::forward(&services, target, &method, &headers).await
    }

    /// relative references of the configured BASE_URL origin
    async fn base_passthrough(
        RateLimitedClient(client_id, services): RateLimitedClient,
        Path(path): Path<String>,
        method: Method,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let base = services
            .config
            .base_url
            .as_ref()
            .ok_or_else(|| Error::BadRequest("no BASE_URL configured".to_string()))?;

        let target = base
            .join(&path)
            .map_err(|e| Error::BadRequest(format!("invalid path '{}': {}", path, e)))?;

        debug!("client {} base passthrough {} {}", client_id, method, target);
        Self::forward(&services, target, &method, &headers).await
    }

    /// any DASH manifest as HLS, master playlist without `rep`, media playlist with it
    async fn mpd_playlist(
        RateLimitedClient(client_id, services): RateLimitedClient,
        Query(params): Query<MpdPlaylistQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let raw = params
            .u
            .as_deref()
            .ok_or_else(|| Error::BadRequest("missing 'u' query parameter".to_string()))?;
        let target = decode_target_url(raw)?;
        info!("client {} requested HLS view of {}", client_id, target);

        let manifest = services.fetch_manifest(&target, &headers).await?;
        if manifest.kind != ManifestKind::Dash {
            return Err(Error::BadRequest(format!("{} is not a DASH manifest", target)));
        }
        let mpd = Mpd::parse(&manifest.text)?;

        let body = match params.rep {
            Some(rep) => mpd_to_hls::media_playlist(&mpd, &manifest.url, &rep, |url| {
                segment_path(&services.segments.resolve_or_create(url))
            })?,
            None => {
                let encoded_target = urlencoding::encode(target.as_str()).into_owned();
                mpd_to_hls::master_playlist(&mpd, |rep| {
                    format!(
                        "/proxy.m3u8?u={}&rep={}",
                        encoded_target,
                        urlencoding::encode(rep)
                    )
                })
            }
        };

        manifest_response(&body, HLS_MIME, &headers)
    }

    async fn forward(
        services: &ProxyServices,
        target: Url,
        method: &Method,
        headers: &HeaderMap,
    ) -> AppResult<Response> {
        let head_only = *method == Method::HEAD;
        let request = UpstreamRequest {
            url: target.into(),
            method: if head_only { Method::HEAD } else { Method::GET },
            headers: forward_headers(headers, &PASSTHROUGH_REQUEST_HEADERS),
        };

        let response = services.upstream.fetch(request).await?;
        Ok(stream_response(response, head_only))
    }
}
