mod rate_limited_client_extractor;

pub use rate_limited_client_extractor::*;
