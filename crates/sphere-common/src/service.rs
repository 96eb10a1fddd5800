use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Probe succeeded; instance is serving normally.
    Healthy,
    /// Reachable but a proxied response carried a 5xx. Cleared by the next
    /// successful probe.
    Degraded,
    /// Health probe failed (non-2xx, timeout, connection refused).
    Unhealthy,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// Path probed on the instance, joined onto its base_url.
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Interval between probes for this service.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per-probe timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// When set, a 2xx probe response must also carry a JSON body whose
    /// top-level "status" field equals this value to count as healthy.
    #[serde(default)]
    pub expect_status: Option<String>,
}

fn default_health_path() -> String {
    "/health".to_string()
}
fn default_interval_ms() -> u64 {
    30_000
}
fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            expect_status: None,
        }
    }
}

/// One backend instance known to the gateway.
///
/// Multi-instance stateful services register one entry per instance, all
/// sharing a `group`; single-instance services leave `group == name`.
/// Entries are never deleted while the gateway runs — an instance that
/// disappears is simply marked Unhealthy by its prober.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntry {
    pub name: String,
    pub group: String,
    pub base_url: String,

    pub status: ServiceStatus,
    pub last_checked_ms: u64,
    pub last_latency_ms: u64,
    pub last_error: Option<String>,
}

impl ServiceEntry {
    /// Fresh entry, optimistically Healthy until its first probe reports.
    /// `last_checked_ms == 0` marks an entry that has never been probed.
    pub fn new(name: impl Into<String>, group: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            base_url: base_url.into(),
            status: ServiceStatus::Healthy,
            last_checked_ms: 0,
            last_latency_ms: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_check_defaults() {
        let cfg: HealthCheckConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.path, "/health");
        assert_eq!(cfg.interval_ms, 30_000);
        assert_eq!(cfg.timeout_ms, 5_000);
        assert!(cfg.expect_status.is_none());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ServiceStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn new_entry_is_optimistic_and_unprobed() {
        let entry = ServiceEntry::new("jobs", "jobs", "http://127.0.0.1:5001");
        assert_eq!(entry.status, ServiceStatus::Healthy);
        assert_eq!(entry.last_checked_ms, 0);
    }
}
