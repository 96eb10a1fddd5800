pub mod breaker;
pub mod registry;
pub mod ring;
pub mod stateful;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use registry::{HealthResult, ServiceRegistry};
pub use ring::HashRing;
pub use stateful::StatefulRouter;
