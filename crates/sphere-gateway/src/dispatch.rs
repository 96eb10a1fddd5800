use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;

use sphere_common::context::{
    FORWARDED_FOR_HEADER, FORWARDED_PROTO_HEADER, REQUEST_ID_HEADER,
};
use sphere_common::{
    FallbackConfig, GatewayError, RequestContext, RouteConfig, RouteMode, RouteTable,
    ServiceEntry, ServiceStatus,
};
use sphere_router::{stateful, CircuitBreaker};

use crate::state::AppState;

/// Buffered upstream reply, ready to forward verbatim.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Dispatch one request that already matched `route`.
pub async fn dispatch_route(
    st: &AppState,
    ctx: &RequestContext,
    route: &RouteConfig,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let counters = st.metrics.route(&route.path_prefix);
    counters.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let response = match route.mode {
        RouteMode::Stateful => {
            dispatch_stateful(st, ctx, route, method, uri, headers, body).await
        }
        RouteMode::Stateless => {
            dispatch_stateless(st, ctx, route, method, uri, headers, body).await
        }
    };

    counters.record_latency(started.elapsed().as_millis() as u64);
    if response.status().is_server_error() {
        counters.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    response
}

async fn dispatch_stateful(
    st: &AppState,
    ctx: &RequestContext,
    route: &RouteConfig,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ring_name = route.ring.as_deref().unwrap_or_default();
    let Some(router) = st.stateful.get(ring_name) else {
        return error_response(
            ctx,
            &GatewayError::EmptyRing {
                ring: ring_name.to_string(),
            },
        );
    };
    let Some(rule) = route.routing_key.as_ref() else {
        return error_response(
            ctx,
            &GatewayError::MissingRoutingKey {
                key: format!("route '{}'", route.path_prefix),
            },
        );
    };

    let tail = RouteTable::tail_segments(route, uri.path());
    let key = match stateful::extract_key(rule, &uri, &headers, &tail) {
        Ok(key) => key,
        Err(err) => return error_response(ctx, &err),
    };
    let addr = match router.resolve(&key) {
        Ok(addr) => addr,
        Err(err) => return error_response(ctx, &err),
    };
    let Some((entry, breaker)) = st.registry.find_by_address(router.group(), &addr) else {
        return error_response(
            ctx,
            &GatewayError::UnknownService {
                service: addr.clone(),
            },
        );
    };
    tracing::debug!(
        key = %key,
        instance = %entry.name,
        request_id = %ctx.request_id,
        "stateful route resolved"
    );

    match proxy_via_breaker(st, ctx, &entry, &breaker, method, &uri, &headers, body).await {
        Ok(upstream) => forward_response(upstream),
        // No fallback and no rerouting for stateful routes: sending the key
        // to a different instance would break session affinity.
        Err(err) => error_response(ctx, &err),
    }
}

async fn dispatch_stateless(
    st: &AppState,
    ctx: &RequestContext,
    route: &RouteConfig,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let service = route.service.as_deref().unwrap_or_default();
    let Some(entry) = pick_instance(st.registry.group_entries(service)) else {
        return error_response(
            ctx,
            &GatewayError::UnknownService {
                service: service.to_string(),
            },
        );
    };

    if entry.status == ServiceStatus::Unhealthy {
        if let Some(fallback) = &route.fallback {
            // Known-dead target: answer from the static fallback without
            // attempting the call, so the client never waits out a timeout.
            st.metrics.fallback_served_total.fetch_add(1, Ordering::Relaxed);
            let err = GatewayError::Connection {
                service: entry.name.clone(),
                message: "service is unhealthy".to_string(),
            };
            return fallback_response(ctx, fallback, &err);
        }
    }

    let Some(breaker) = st.registry.breaker(&entry.name) else {
        return error_response(
            ctx,
            &GatewayError::UnknownService {
                service: entry.name.clone(),
            },
        );
    };

    match proxy_via_breaker(st, ctx, &entry, &breaker, method, &uri, &headers, body).await {
        Ok(upstream) => forward_response(upstream),
        Err(err) => match (&err, &route.fallback) {
            (
                GatewayError::CircuitOpen { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::Connection { .. },
                Some(fallback),
            ) => {
                st.metrics.fallback_served_total.fetch_add(1, Ordering::Relaxed);
                fallback_response(ctx, fallback, &err)
            }
            _ => error_response(ctx, &err),
        },
    }
}

/// Prefer a Healthy instance, then a Degraded one; an Unhealthy entry is
/// returned last so the caller can short-circuit to a fallback.
fn pick_instance(entries: Vec<ServiceEntry>) -> Option<ServiceEntry> {
    entries
        .iter()
        .find(|e| e.status == ServiceStatus::Healthy)
        .cloned()
        .or_else(|| {
            entries
                .iter()
                .find(|e| e.status == ServiceStatus::Degraded)
                .cloned()
        })
        .or_else(|| entries.into_iter().next())
}

/// Proxy the request to `entry` through its breaker, recording per-service
/// metrics and the passive 5xx health hint.
#[allow(clippy::too_many_arguments)]
async fn proxy_via_breaker(
    st: &AppState,
    ctx: &RequestContext,
    entry: &ServiceEntry,
    breaker: &CircuitBreaker,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<UpstreamResponse, GatewayError> {
    let counters = st.metrics.service(&entry.name);
    counters.requests_total.fetch_add(1, Ordering::Relaxed);

    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let url = format!(
        "{}{}{}",
        entry.base_url.trim_end_matches('/'),
        uri.path(),
        query
    );
    let out_headers = forwarded_headers(ctx, headers);

    let client = st.http.clone();
    let service = entry.name.clone();
    let timeout_ms = breaker.config().call_timeout_ms;
    let started = Instant::now();

    let result = breaker
        .execute(async move {
            let response = client
                .request(method, &url)
                .headers(out_headers)
                .body(body)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(&service, timeout_ms, &err))?;
            let status = response.status();
            let resp_headers = response.headers().clone();
            let bytes = response.bytes().await.map_err(|err| GatewayError::Connection {
                service: service.clone(),
                message: format!("reading upstream body: {err}"),
            })?;
            Ok(UpstreamResponse {
                status,
                headers: resp_headers,
                body: bytes,
            })
        })
        .await;

    match &result {
        Ok(upstream) => {
            counters.record_latency(started.elapsed().as_millis() as u64);
            if upstream.status.is_server_error() {
                counters.errors_total.fetch_add(1, Ordering::Relaxed);
                // Reachable but erroring: degrade the entry right away. The
                // breaker itself only counts transport failures.
                st.registry
                    .observe_response_status(&entry.name, upstream.status.as_u16());
            }
        }
        Err(err) => {
            counters.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                service = %entry.name,
                error = %err,
                request_id = %ctx.request_id,
                "proxy call failed"
            );
        }
    }
    result
}

fn classify_reqwest_error(service: &str, timeout_ms: u64, error: &reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        return GatewayError::Timeout {
            service: service.to_string(),
            timeout_ms,
        };
    }
    GatewayError::Connection {
        service: service.to_string(),
        message: error.to_string(),
    }
}

/// Copy request headers for forwarding and attach the tracing contract:
/// request id, client chain, protocol.
fn forwarded_headers(ctx: &RequestContext, headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (k, v) in headers.iter() {
        if k.as_str().eq_ignore_ascii_case("host")
            || k.as_str().eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        out.insert(k, v.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        out.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    if let Some(addr) = &ctx.client_addr {
        let chain = match headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {addr}"),
            None => addr.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            out.insert(HeaderName::from_static(FORWARDED_FOR_HEADER), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.proto) {
        out.insert(HeaderName::from_static(FORWARDED_PROTO_HEADER), value);
    }
    out
}

pub fn forward_response(upstream: UpstreamResponse) -> Response {
    let mut out = Response::builder()
        .status(upstream.status)
        .body(Body::from(upstream.body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    copy_response_headers(&upstream.headers, &mut out);
    out
}

fn copy_response_headers(src: &HeaderMap, dst: &mut Response) {
    for (k, v) in src.iter() {
        if k.as_str().eq_ignore_ascii_case("transfer-encoding")
            || k.as_str().eq_ignore_ascii_case("connection")
            || k.as_str().eq_ignore_ascii_case("keep-alive")
            || k.as_str().eq_ignore_ascii_case("proxy-authenticate")
            || k.as_str().eq_ignore_ascii_case("proxy-authorization")
            || k.as_str().eq_ignore_ascii_case("te")
            || k.as_str().eq_ignore_ascii_case("trailer")
            || k.as_str().eq_ignore_ascii_case("upgrade")
        {
            continue;
        }
        dst.headers_mut().insert(k, v.clone());
    }
}

/// Gateway-generated failure: 503 with the machine-readable code.
pub fn error_response(ctx: &RequestContext, err: &GatewayError) -> Response {
    let body = json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "request_id": ctx.request_id,
        }
    });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

/// Static degraded payload, flagged so consumers can tell it from live data.
pub fn fallback_response(
    ctx: &RequestContext,
    fallback: &FallbackConfig,
    err: &GatewayError,
) -> Response {
    let status = StatusCode::from_u16(fallback.status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    let body = json!({
        "degraded": true,
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "request_id": ctx.request_id,
        },
        "data": fallback.body,
    });
    (status, Json(body)).into_response()
}
