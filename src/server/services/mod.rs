pub mod proxy_services;
pub mod rate_limit_services;
pub mod segment_registry_services;
pub mod upstream_services;

pub use proxy_services::{FetchedManifest, ProxyServices};
pub use rate_limit_services::DynRateLimitService;
pub use segment_registry_services::{SegmentLookup, SegmentRegistry};
pub use upstream_services::DynUpstreamService;
