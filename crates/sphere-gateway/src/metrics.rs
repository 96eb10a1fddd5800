use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use serde_json::{json, Value};

use sphere_router::ServiceRegistry;

use crate::state::AppState;

/// Request/error/latency counters for one route or one service.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    latency_ms_sum: AtomicU64,
    latency_samples: AtomicU64,
}

impl EndpointCounters {
    pub fn record_latency(&self, ms: u64) {
        self.latency_ms_sum.fetch_add(ms, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            0.0
        } else {
            self.latency_ms_sum.load(Ordering::Relaxed) as f64 / samples as f64
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "errors_total": self.errors_total.load(Ordering::Relaxed),
            "avg_latency_ms": self.avg_latency_ms(),
        })
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub fallback_served_total: AtomicU64,
    per_service: DashMap<String, Arc<EndpointCounters>>,
    per_route: DashMap<String, Arc<EndpointCounters>>,
}

impl Metrics {
    pub fn service(&self, name: &str) -> Arc<EndpointCounters> {
        self.per_service
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn route(&self, prefix: &str) -> Arc<EndpointCounters> {
        self.per_route.entry(prefix.to_string()).or_default().clone()
    }

    /// Full snapshot served by `/api/metrics`: gateway totals, per-route and
    /// per-service counters, and each service's breaker state. Built from
    /// atomics and clones only — never blocks the request path.
    pub fn snapshot(&self, registry: &ServiceRegistry) -> Value {
        let mut services = serde_json::Map::new();
        for entry in registry.list() {
            let counters = self.service(&entry.name);
            let mut obj = counters.to_json();
            obj["status"] = json!(entry.status);
            obj["circuit"] = registry
                .breaker(&entry.name)
                .map(|b| serde_json::to_value(b.snapshot()).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            services.insert(entry.name, obj);
        }

        let mut routes = serde_json::Map::new();
        for r in self.per_route.iter() {
            routes.insert(r.key().clone(), r.value().to_json());
        }

        json!({
            "gateway": {
                "requests_total": self.requests_total.load(Ordering::Relaxed),
                "requests_inflight": self.requests_inflight.load(Ordering::Relaxed),
                "responses_2xx": self.status_2xx.load(Ordering::Relaxed),
                "responses_4xx": self.status_4xx.load(Ordering::Relaxed),
                "responses_5xx": self.status_5xx.load(Ordering::Relaxed),
                "fallback_served_total": self.fallback_served_total.load(Ordering::Relaxed),
            },
            "routes": routes,
            "services": services,
        })
    }
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.metrics.snapshot(&st.registry))
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_over_samples() {
        let counters = EndpointCounters::default();
        assert_eq!(counters.avg_latency_ms(), 0.0);
        counters.record_latency(10);
        counters.record_latency(30);
        assert_eq!(counters.avg_latency_ms(), 20.0);
    }

    #[test]
    fn same_counters_shared_per_name() {
        let metrics = Metrics::default();
        metrics.service("jobs").requests_total.fetch_add(1, Ordering::Relaxed);
        assert_eq!(metrics.service("jobs").requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.service("courses").requests_total.load(Ordering::Relaxed), 0);
    }
}
