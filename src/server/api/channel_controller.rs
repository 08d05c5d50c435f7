use axum::{
    Router,
    extract::{Path, Query},
    http::HeaderMap,
    response::Response,
    routing::get,
};
use serde::Deserialize;
use tracing::debug;

use crate::manifest::{
    DASH_MIME, HLS_MIME, ManifestKind, Mpd, mpd_to_hls, rewrite_dash, rewrite_hls, segment_path,
};
use crate::server::{
    error::{AppResult, Error},
    extractors::RateLimitedClient,
    utils::response_utils::manifest_response,
};

#[derive(Deserialize)]
struct RepresentationQuery {
    rep: Option<String>,
}

pub struct ChannelController;

impl ChannelController {
    pub fn app() -> Router {
        Router::new()
            .route("/{channel}/playlist.m3u8", get(Self::playlist))
            .route("/{channel}/manifest.mpd", get(Self::manifest))
    }

    /// HLS channels are rewritten line by line, DASH channels are turned into HLS. `rep` picks
    /// the media playlist of one representation out of a DASH channel.
    async fn playlist(
        RateLimitedClient(client_id, services): RateLimitedClient,
        Path(channel): Path<String>,
        Query(params): Query<RepresentationQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let upstream_url = services.channel(&channel)?.clone();
        debug!(
            "client {} requested playlist for channel {}: {}",
            client_id, channel, upstream_url
        );

        let manifest = services.fetch_manifest(&upstream_url, &headers).await?;

        let body = match manifest.kind {
            ManifestKind::Hls => rewrite_hls(&manifest.text, &manifest.url, &services.segments),
            ManifestKind::Dash => {
                let mpd = Mpd::parse(&manifest.text)?;
                match params.rep {
                    Some(rep) => mpd_to_hls::media_playlist(&mpd, &manifest.url, &rep, |url| {
                        segment_path(&services.segments.resolve_or_create(url))
                    })?,
                    None => mpd_to_hls::master_playlist(&mpd, |rep| {
                        format!(
                            "/{}/playlist.m3u8?rep={}",
                            urlencoding::encode(&channel),
                            urlencoding::encode(rep)
                        )
                    }),
                }
            }
        };

        manifest_response(&body, HLS_MIME, &headers)
    }

    async fn manifest(
        RateLimitedClient(client_id, services): RateLimitedClient,
        Path(channel): Path<String>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let upstream_url = services.channel(&channel)?.clone();
        debug!(
            "client {} requested DASH manifest for channel {}: {}",
            client_id, channel, upstream_url
        );

        let manifest = services.fetch_manifest(&upstream_url, &headers).await?;
        if manifest.kind != ManifestKind::Dash {
            return Err(Error::BadRequest(format!(
                "channel '{}' is not a DASH channel",
                channel
            )));
        }

        let body = rewrite_dash(&manifest.text, &manifest.url);
        manifest_response(&body, DASH_MIME, &headers)
    }
}
