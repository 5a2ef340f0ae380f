//! Upstream clients, probes and service lifecycle

pub mod arr_client;
pub mod disk_space;
pub mod http_server;
pub mod logging;
pub mod manager;
pub mod media_manager;
pub mod rate_limiter;

pub use arr_client::ArrClient;
pub use disk_space::{DiskProbeError, DiskSpaceProbe, LocalDiskProbe, UpstreamDiskProbe};
pub use http_server::HttpServerService;
pub use manager::{HealthStatus, Service, ServiceHealth, ServicesManager};
pub use media_manager::{MediaManager, MediaManagerError, MissingItem, QueueItem};
pub use rate_limiter::{RateLimitConfig, RateLimitedClient, RetryConfig};
