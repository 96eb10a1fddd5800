use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use sphere_common::{now_ms, HealthCheckConfig, ServiceEntry, ServiceStatus};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};

/// Outcome of a single health probe.
#[derive(Debug, Clone)]
pub struct HealthResult {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

struct ServiceState {
    entry: RwLock<ServiceEntry>,
    breaker: Arc<CircuitBreaker>,
    health: HealthCheckConfig,
}

/// Authoritative record of known backend instances and their health.
///
/// Entries are registered at startup and never removed; the per-service
/// prober and response observation are the only writers. Request handling
/// reads cloned snapshots, so a probe in progress never exposes a
/// half-updated entry.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceState>>,
    http: reqwest::Client,
    default_breaker: CircuitBreakerConfig,
}

impl ServiceRegistry {
    pub fn new(http: reqwest::Client, default_breaker: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            http,
            default_breaker,
        })
    }

    /// Register an instance. `group` ties multiple instances of one logical
    /// service together; pass the instance name for single-instance services.
    /// Registering an existing name keeps the original entry and its breaker —
    /// every caller for a service shares one breaker.
    pub fn register(
        &self,
        name: &str,
        group: &str,
        base_url: &str,
        health: HealthCheckConfig,
        breaker: Option<CircuitBreakerConfig>,
    ) {
        if self.services.contains_key(name) {
            tracing::warn!(service = name, "duplicate registration ignored");
            return;
        }
        // Entries start optimistically Healthy; the monitor's first tick
        // fires immediately on startup and corrects them.
        let entry = ServiceEntry::new(name, group, base_url.trim_end_matches('/'));
        let breaker_config = breaker.unwrap_or_else(|| self.default_breaker.clone());
        self.services.insert(
            name.to_string(),
            Arc::new(ServiceState {
                entry: RwLock::new(entry),
                breaker: Arc::new(CircuitBreaker::new(name, breaker_config)),
                health,
            }),
        );
        tracing::info!(service = name, group, base_url, "service registered");
    }

    pub fn get(&self, name: &str) -> Option<ServiceEntry> {
        self.services.get(name).map(|s| s.entry.read().clone())
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.services.get(name).map(|s| s.breaker.clone())
    }

    pub fn list(&self) -> Vec<ServiceEntry> {
        let mut entries: Vec<ServiceEntry> = self
            .services
            .iter()
            .map(|s| s.value().entry.read().clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn list_healthy(&self) -> Vec<ServiceEntry> {
        self.list()
            .into_iter()
            .filter(|e| e.status == ServiceStatus::Healthy)
            .collect()
    }

    pub fn group_entries(&self, group: &str) -> Vec<ServiceEntry> {
        self.list().into_iter().filter(|e| e.group == group).collect()
    }

    /// Addresses of the group's instances that are not Unhealthy, sorted for
    /// deterministic ring rebuilds. Degraded instances stay live — they are
    /// reachable, just noisy.
    pub fn live_addresses(&self, group: &str) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .group_entries(group)
            .into_iter()
            .filter(|e| e.status != ServiceStatus::Unhealthy)
            .map(|e| e.base_url)
            .collect();
        addrs.sort();
        addrs
    }

    /// Find the instance of `group` registered at `base_url`, with its breaker.
    pub fn find_by_address(
        &self,
        group: &str,
        base_url: &str,
    ) -> Option<(ServiceEntry, Arc<CircuitBreaker>)> {
        self.services.iter().find_map(|s| {
            let entry = s.value().entry.read().clone();
            if entry.group == group && entry.base_url == base_url {
                Some((entry, s.value().breaker.clone()))
            } else {
                None
            }
        })
    }

    /// Passive health hint from a proxied response. A 5xx downgrades a
    /// Healthy entry to Degraded without waiting for the next probe; the next
    /// successful probe clears it. Never touches the breaker.
    pub fn observe_response_status(&self, name: &str, status: u16) {
        if status < 500 {
            return;
        }
        if let Some(state) = self.services.get(name) {
            let mut entry = state.entry.write();
            if entry.status == ServiceStatus::Healthy {
                entry.status = ServiceStatus::Degraded;
                tracing::warn!(service = name, status, "service degraded by 5xx response");
            }
        }
    }

    /// Probe one service now and apply the result.
    pub async fn check_health(&self, name: &str) -> Option<HealthResult> {
        let state = self.services.get(name).map(|s| Arc::clone(s.value()))?;
        let result = probe(&self.http, &state).await;
        apply_probe(name, &state, &result);
        Some(result)
    }

    /// Spawn one monitor task per registered service, each on its own
    /// interval so a slow probe never delays the others.
    pub fn spawn_monitors(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.services
            .iter()
            .map(|s| {
                let registry = self.clone();
                let name = s.key().clone();
                tokio::spawn(async move { registry.monitor_loop(name).await })
            })
            .collect()
    }

    async fn monitor_loop(self: Arc<Self>, name: String) {
        let Some(state) = self.services.get(&name).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut interval =
            tokio::time::interval(Duration::from_millis(state.health.interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let result = probe(&self.http, &state).await;
            apply_probe(&name, &state, &result);
        }
    }
}

async fn probe(http: &reqwest::Client, state: &ServiceState) -> HealthResult {
    let (url, timeout_ms, expect_status) = {
        let entry = state.entry.read();
        (
            format!("{}{}", entry.base_url.trim_end_matches('/'), state.health.path),
            state.health.timeout_ms,
            state.health.expect_status.clone(),
        )
    };

    let started = Instant::now();
    let response = http
        .get(&url)
        .timeout(Duration::from_millis(timeout_ms))
        .send()
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match response {
        Ok(resp) if resp.status().is_success() => {
            if let Some(expected) = expect_status {
                match resp.json::<serde_json::Value>().await {
                    Ok(body)
                        if body.get("status").and_then(|v| v.as_str())
                            == Some(expected.as_str()) =>
                    {
                        healthy(latency_ms)
                    }
                    Ok(body) => unhealthy(
                        latency_ms,
                        format!("unexpected health payload: {body}"),
                    ),
                    Err(err) => {
                        unhealthy(latency_ms, format!("unreadable health payload: {err}"))
                    }
                }
            } else {
                healthy(latency_ms)
            }
        }
        Ok(resp) => unhealthy(latency_ms, format!("health probe returned {}", resp.status())),
        Err(err) => unhealthy(latency_ms, format!("health probe failed: {err}")),
    }
}

fn healthy(latency_ms: u64) -> HealthResult {
    HealthResult {
        healthy: true,
        latency_ms,
        error: None,
    }
}

fn unhealthy(latency_ms: u64, error: String) -> HealthResult {
    HealthResult {
        healthy: false,
        latency_ms,
        error: Some(error),
    }
}

fn apply_probe(name: &str, state: &ServiceState, result: &HealthResult) {
    let mut entry = state.entry.write();
    entry.last_checked_ms = now_ms();
    entry.last_latency_ms = result.latency_ms;
    if result.healthy {
        if entry.status != ServiceStatus::Healthy {
            tracing::info!(service = name, "service healthy");
        }
        entry.status = ServiceStatus::Healthy;
        entry.last_error = None;
    } else {
        if entry.status != ServiceStatus::Unhealthy {
            tracing::warn!(service = name, error = ?result.error, "service unhealthy");
        }
        entry.status = ServiceStatus::Unhealthy;
        entry.last_error = result.error.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_stub(path: &'static str, body: &'static str) -> String {
        let app = Router::new().route(path, get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn dead_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn registry() -> Arc<ServiceRegistry> {
        ServiceRegistry::new(reqwest::Client::new(), CircuitBreakerConfig::default())
    }

    #[tokio::test]
    async fn probe_marks_healthy_and_records_latency() {
        let base = spawn_stub("/health", "{\"status\":\"healthy\"}").await;
        let reg = registry();
        reg.register("jobs", "jobs", &base, HealthCheckConfig::default(), None);

        let result = reg.check_health("jobs").await.unwrap();
        assert!(result.healthy);

        let entry = reg.get("jobs").unwrap();
        assert_eq!(entry.status, ServiceStatus::Healthy);
        assert!(entry.last_checked_ms > 0);
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn probe_checks_expected_payload() {
        let base = spawn_stub("/health", "{\"status\":\"starting\"}").await;
        let reg = registry();
        let health = HealthCheckConfig {
            expect_status: Some("healthy".into()),
            ..HealthCheckConfig::default()
        };
        reg.register("courses", "courses", &base, health, None);

        let result = reg.check_health("courses").await.unwrap();
        assert!(!result.healthy);
        assert_eq!(reg.get("courses").unwrap().status, ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn probe_failure_marks_unhealthy_with_error() {
        let base = dead_port().await;
        let reg = registry();
        reg.register("jobs", "jobs", &base, HealthCheckConfig::default(), None);

        let result = reg.check_health("jobs").await.unwrap();
        assert!(!result.healthy);

        let entry = reg.get("jobs").unwrap();
        assert_eq!(entry.status, ServiceStatus::Unhealthy);
        assert!(entry.last_error.is_some());
    }

    #[tokio::test]
    async fn passive_5xx_degrades_until_next_good_probe() {
        let base = spawn_stub("/health", "ok").await;
        let reg = registry();
        reg.register("notifications", "notifications", &base, HealthCheckConfig::default(), None);
        reg.check_health("notifications").await.unwrap();
        assert_eq!(
            reg.get("notifications").unwrap().status,
            ServiceStatus::Healthy
        );

        reg.observe_response_status("notifications", 502);
        assert_eq!(
            reg.get("notifications").unwrap().status,
            ServiceStatus::Degraded
        );

        // 4xx and below never downgrade.
        reg.observe_response_status("notifications", 404);
        assert_eq!(
            reg.get("notifications").unwrap().status,
            ServiceStatus::Degraded
        );

        reg.check_health("notifications").await.unwrap();
        assert_eq!(
            reg.get("notifications").unwrap().status,
            ServiceStatus::Healthy
        );
    }

    #[tokio::test]
    async fn degraded_hint_does_not_revive_unhealthy() {
        let base = dead_port().await;
        let reg = registry();
        reg.register("jobs", "jobs", &base, HealthCheckConfig::default(), None);
        reg.check_health("jobs").await.unwrap();

        reg.observe_response_status("jobs", 500);
        assert_eq!(reg.get("jobs").unwrap().status, ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn one_breaker_per_service_name() {
        let reg = registry();
        reg.register("jobs", "jobs", "http://127.0.0.1:1", HealthCheckConfig::default(), None);
        reg.register("jobs", "jobs", "http://127.0.0.1:2", HealthCheckConfig::default(), None);

        let first = reg.breaker("jobs").unwrap();
        let second = reg.breaker("jobs").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // Duplicate registration kept the original address.
        assert_eq!(reg.get("jobs").unwrap().base_url, "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn live_addresses_exclude_unhealthy_only() {
        let up = spawn_stub("/health", "ok").await;
        let down = dead_port().await;
        let reg = registry();
        reg.register("collab-1", "collaboration", &up, HealthCheckConfig::default(), None);
        reg.register("collab-2", "collaboration", &down, HealthCheckConfig::default(), None);
        reg.check_health("collab-1").await.unwrap();
        reg.check_health("collab-2").await.unwrap();

        assert_eq!(reg.live_addresses("collaboration"), vec![up.clone()]);

        // Degraded stays live for routing, but is no longer listed healthy.
        reg.observe_response_status("collab-1", 503);
        assert_eq!(reg.live_addresses("collaboration"), vec![up]);
        assert!(reg.list_healthy().iter().all(|e| e.name != "collab-1"));
    }
}
