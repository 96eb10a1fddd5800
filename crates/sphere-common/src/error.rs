use thiserror::Error;

/// Structured failures produced by the routing core.
///
/// The dispatcher is the only layer that turns these into responses or
/// fallbacks; nothing below it substitutes defaults.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("call to service '{service}' timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },

    #[error("connection to service '{service}' failed: {message}")]
    Connection { service: String, message: String },

    #[error("unknown service '{service}'")]
    UnknownService { service: String },

    #[error("request is missing routing key '{key}'")]
    MissingRoutingKey { key: String },

    #[error("hash ring '{ring}' has no live nodes")]
    EmptyRing { ring: String },
}

impl GatewayError {
    /// Stable machine-readable code carried in every gateway-generated error
    /// body, so consumers can distinguish an open circuit from a timeout from
    /// a connection failure.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::Connection { .. } => "CONNECTION_ERROR",
            GatewayError::UnknownService { .. } => "UNKNOWN_SERVICE",
            GatewayError::MissingRoutingKey { .. } => "MISSING_ROUTING_KEY",
            GatewayError::EmptyRing { .. } => "EMPTY_RING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = GatewayError::CircuitOpen {
            service: "jobs".into(),
        };
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert_eq!(err.to_string(), "circuit open for service 'jobs'");

        let err = GatewayError::Timeout {
            service: "jobs".into(),
            timeout_ms: 5000,
        };
        assert_eq!(err.code(), "TIMEOUT");
    }
}
