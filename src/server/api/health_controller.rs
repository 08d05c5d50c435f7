use axum::Extension;
use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::warn;

use crate::server::dtos::health_dto::{
    HealthResponse, HealthStatus, SegmentRegistryHealth, ServiceHealthDetails,
};
use crate::server::services::ProxyServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// health endpoint, not rate limited so probes never see a 429
pub async fn health_endpoint(
    Extension(services): Extension<ProxyServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let registry_health = check_segment_registry(&services);

    // a registry over its cap still serves, the sweeper just hasn't caught up yet
    let overall_status = registry_health.status;

    let response = HealthResponse {
        status: overall_status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
        services: ServiceHealthDetails {
            segment_registry: registry_health,
            channels: services.channels.len(),
        },
    };

    let http_status = match overall_status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(response))
}

fn check_segment_registry(services: &ProxyServices) -> SegmentRegistryHealth {
    let config = services.segments.config();
    let entries = services.segments.len();

    let status = if entries > config.max_entries {
        warn!(
            "segment registry over capacity: {} entries, cap {}",
            entries, config.max_entries
        );
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    SegmentRegistryHealth {
        status,
        entries,
        max_entries: config.max_entries,
        ttl_seconds: config.ttl.as_secs(),
    }
}
