use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use sphere_common::{RequestContext, ServiceStatus};

use crate::dispatch::dispatch_route;
use crate::state::AppState;

/// Fallback handler for everything the fixed endpoints don't claim: match
/// the route table and hand off to the dispatcher.
pub async fn dispatch(State(st): State<AppState>, req: Request<Body>) -> Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    let ctx = RequestContext::from_headers(req.headers(), client_addr);

    let path = req.uri().path().to_string();
    let Some(route) = st.routes.resolve(&path).cloned() else {
        let body = json!({
            "error": {
                "message": format!("no route matches '{path}'"),
                "request_id": ctx.request_id,
            }
        });
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    };

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, st.max_request_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        }
    };

    dispatch_route(&st, &ctx, &route, parts.method, parts.uri, parts.headers, body).await
}

/// Aggregate health: 200 only when every known service is Healthy.
pub async fn health_all(State(st): State<AppState>) -> Response {
    let services = st.registry.list();
    let all_healthy = services.iter().all(|e| e.status == ServiceStatus::Healthy);
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if all_healthy { "healthy" } else { "degraded" },
        "services": services,
    });
    (status, Json(body)).into_response()
}

pub async fn health_service(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match st.registry.get(&name) {
        Some(entry) => {
            let status = if entry.status == ServiceStatus::Healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(json!(entry))).into_response()
        }
        None => {
            let body = json!({"error": {"message": format!("unknown service '{name}'")}});
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use sphere_common::{HealthCheckConfig, RouteTable};
    use sphere_router::{CircuitBreakerConfig, ServiceRegistry};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn test_state(registry: Arc<ServiceRegistry>) -> AppState {
        AppState {
            registry,
            routes: Arc::new(RouteTable::new(Vec::new())),
            stateful: Arc::new(HashMap::new()),
            http: reqwest::Client::new(),
            metrics: Arc::new(Metrics::default()),
            max_request_body_bytes: 1024,
        }
    }

    async fn read_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_service_health_is_404() {
        let registry =
            ServiceRegistry::new(reqwest::Client::new(), CircuitBreakerConfig::default());
        let st = test_state(registry);
        let response = health_service(State(st), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn aggregate_health_reflects_worst_entry() {
        let registry =
            ServiceRegistry::new(reqwest::Client::new(), CircuitBreakerConfig::default());
        registry.register(
            "jobs",
            "jobs",
            "http://127.0.0.1:5001",
            HealthCheckConfig::default(),
            None,
        );
        let st = test_state(registry.clone());

        // Optimistic start: everything registered counts as healthy.
        let response = health_all(State(st.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        registry.observe_response_status("jobs", 500);
        let response = health_all(State(st)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = read_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"][0]["status"], "degraded");
    }

    #[tokio::test]
    async fn unmatched_path_is_404_with_request_id() {
        let registry =
            ServiceRegistry::new(reqwest::Client::new(), CircuitBreakerConfig::default());
        let st = test_state(registry);
        let req = Request::builder()
            .uri("/nowhere")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(st), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert!(body["error"]["request_id"]
            .as_str()
            .unwrap()
            .starts_with("req_"));
    }
}
