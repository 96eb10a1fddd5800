pub mod context;
pub mod error;
pub mod route;
pub mod service;
pub mod telemetry;

pub use context::RequestContext;
pub use error::GatewayError;
pub use route::{FallbackConfig, RouteConfig, RouteMode, RouteTable, RoutingKeySource};
pub use service::{HealthCheckConfig, ServiceEntry, ServiceStatus};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, saturating at zero on clock skew.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
