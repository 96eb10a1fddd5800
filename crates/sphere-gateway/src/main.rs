mod args;
mod config;
mod dispatch;
mod handlers;
mod metrics;
mod state;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use clap::Parser;

use sphere_common::RouteTable;
use sphere_router::stateful::{refresh_from_registry, refresh_loop};
use sphere_router::{CircuitBreakerConfig, HashRing, ServiceRegistry, StatefulRouter};

use crate::args::Args;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _otel_guard = sphere_common::telemetry::init_tracing(
        "sphere-gateway",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    let cfg = config::load(&args.config)?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(300))
        .build()?;

    let registry = ServiceRegistry::new(http.clone(), CircuitBreakerConfig::default());
    for svc in &cfg.services {
        registry.register(
            &svc.name,
            svc.group(),
            &svc.base_url,
            svc.health.clone(),
            svc.breaker.clone(),
        );
    }
    let _monitors = registry.spawn_monitors();

    let mut stateful: HashMap<String, Arc<StatefulRouter>> = HashMap::new();
    for rc in &cfg.rings {
        let ring = Arc::new(HashRing::new(rc.name.clone(), rc.virtual_nodes));
        // Seed right away so stateful routes resolve before the first tick.
        refresh_from_registry(&registry, &ring, &rc.service);
        tokio::spawn(refresh_loop(
            registry.clone(),
            ring.clone(),
            rc.service.clone(),
            Duration::from_millis(rc.refresh_interval_ms),
        ));
        stateful.insert(
            rc.name.clone(),
            Arc::new(StatefulRouter::new(ring, rc.service.clone())),
        );
    }

    let st = AppState {
        registry,
        routes: Arc::new(RouteTable::new(cfg.routes)),
        stateful: Arc::new(stateful),
        http,
        metrics: Arc::new(metrics::Metrics::default()),
        max_request_body_bytes: args.max_request_body_bytes,
    };

    let app = Router::new()
        .route("/health", get(handlers::health_all))
        .route("/health/:service", get(handlers::health_service))
        .route("/api/metrics", get(metrics::metrics_handler))
        .fallback(handlers::dispatch)
        .layer(middleware::from_fn_with_state(st.clone(), metrics::track_requests))
        .with_state(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(addr = %args.listen_addr, "sphere gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
