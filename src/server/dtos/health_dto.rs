use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub environment: String,
    pub services: ServiceHealthDetails,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealthDetails {
    pub segment_registry: SegmentRegistryHealth,
    pub channels: usize,
}

#[derive(Debug, Serialize)]
pub struct SegmentRegistryHealth {
    pub status: HealthStatus,
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_seconds: u64,
}
