use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use url::Url;

use crate::{
    config::AppConfig,
    manifest::ManifestKind,
    server::{
        error::{AppResult, Error},
        utils::response_utils::manifest_request_headers,
    },
};

use super::{
    rate_limit_services::{DynRateLimitService, InMemoryRateLimitService, RateLimitConfig},
    segment_registry_services::{SegmentRegistry, SegmentRegistryConfig, start_sweep_task},
    upstream_services::{
        DynUpstreamService, RetryPolicy, UpstreamRequest, UpstreamService, read_manifest,
    },
};

/// a decoded manifest plus the url it finally came from, relative references resolve against
/// that url and not the one we asked for
#[derive(Debug)]
pub struct FetchedManifest {
    pub url: Url,
    pub text: String,
    pub kind: ManifestKind,
}

/// everything a handler needs, built once at startup and cloned into every request
#[derive(Clone)]
pub struct ProxyServices {
    pub segments: Arc<SegmentRegistry>,
    pub upstream: DynUpstreamService,
    pub rate_limit: DynRateLimitService,
    pub channels: Arc<HashMap<String, Url>>,
    pub config: Arc<AppConfig>,
}

impl ProxyServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let upstream = Arc::new(UpstreamService::new(
            Duration::from_secs(config.upstream_timeout_secs),
            RetryPolicy {
                attempts: config.upstream_attempts,
                initial_backoff: Duration::from_millis(config.upstream_backoff_ms),
            },
        )) as DynUpstreamService;

        Self::with_upstream(config, upstream)
    }

    /// same as `new` but with the upstream collaborator supplied, tests hand in a mock here
    pub fn with_upstream(config: Arc<AppConfig>, upstream: DynUpstreamService) -> Self {
        info!("starting proxy services...");

        let segments = Arc::new(SegmentRegistry::new(SegmentRegistryConfig {
            ttl: Duration::from_secs(config.segment_ttl_secs),
            max_entries: config.segment_max_entries,
            id_strategy: config.id_strategy,
        }));

        let rate_limit = Arc::new(InMemoryRateLimitService::new(RateLimitConfig {
            max_requests_per_window: config.rate_limit_per_minute,
            window: Duration::from_secs(60),
        })) as DynRateLimitService;

        let channels: HashMap<String, Url> = config
            .channels
            .iter()
            .map(|channel| (channel.key.clone(), channel.url.clone()))
            .collect();

        info!(
            "{} channels configured, segment ttl {}s, cap {}, ids {:?}",
            channels.len(),
            config.segment_ttl_secs,
            config.segment_max_entries,
            config.id_strategy
        );

        Self {
            segments,
            upstream,
            rate_limit,
            channels: Arc::new(channels),
            config,
        }
    }

    pub fn channel(&self, key: &str) -> AppResult<&Url> {
        self.channels
            .get(key)
            .ok_or_else(|| Error::ChannelNotFound(key.to_string()))
    }

    pub async fn fetch_manifest(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
    ) -> AppResult<FetchedManifest> {
        let request =
            UpstreamRequest::get(url.as_str()).with_headers(manifest_request_headers(request_headers));
        let response = self.upstream.fetch(request).await?;

        let final_url = Url::parse(&response.url).map_err(|e| {
            Error::UpstreamUnavailable(format!("upstream returned an invalid url: {}", e))
        })?;
        let content_type = response.content_type().to_string();
        let text = read_manifest(response).await?;

        let kind = ManifestKind::detect(&content_type, &text).ok_or_else(|| {
            Error::UpstreamUnavailable(format!(
                "{} is neither an HLS playlist nor a DASH manifest",
                final_url
            ))
        })?;

        debug!("fetched {:?} manifest from {} ({} bytes)", kind, final_url, text.len());
        Ok(FetchedManifest {
            url: final_url,
            text,
            kind,
        })
    }

    /// periodic registry and rate limit sweeps, both run until the process exits
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        let every = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        let registry_sweeper = start_sweep_task(self.segments.clone(), every);

        let rate_limit = self.rate_limit.clone();
        let rate_limit_sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let dropped = rate_limit.sweep();
                if dropped > 0 {
                    debug!("dropped {} closed rate limit windows", dropped);
                }
            }
        });

        vec![registry_sweeper, rate_limit_sweeper]
    }
}
