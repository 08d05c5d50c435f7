pub mod channel_controller;
pub mod health_controller;
pub mod proxy_controller;
pub mod segment_controller;

pub use channel_controller::ChannelController;
pub use health_controller::health_endpoint;
pub use proxy_controller::ProxyController;
pub use segment_controller::SegmentController;
