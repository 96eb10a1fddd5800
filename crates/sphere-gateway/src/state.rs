use std::collections::HashMap;
use std::sync::Arc;

use sphere_common::RouteTable;
use sphere_router::{ServiceRegistry, StatefulRouter};

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub routes: Arc<RouteTable>,
    pub stateful: Arc<HashMap<String, Arc<StatefulRouter>>>,
    pub http: reqwest::Client,
    pub metrics: Arc<Metrics>,
    pub max_request_body_bytes: usize,
}
