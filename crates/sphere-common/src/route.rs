use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    /// Resolve a target through the service registry.
    Stateless,
    /// Resolve a target through a named hash ring plus a routing-key rule.
    Stateful,
}

/// Where the stateful routing key is read from on the inbound request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "in", content = "name")]
pub enum RoutingKeySource {
    /// A query parameter, e.g. `?roomId=abc123`.
    Query(String),
    /// A request header.
    Header(String),
    /// A zero-based path segment index under the route prefix.
    PathSegment(usize),
}

impl RoutingKeySource {
    /// Label used in MissingRoutingKey errors.
    pub fn describe(&self) -> String {
        match self {
            RoutingKeySource::Query(name) => format!("query parameter '{name}'"),
            RoutingKeySource::Header(name) => format!("header '{name}'"),
            RoutingKeySource::PathSegment(idx) => format!("path segment {idx}"),
        }
    }
}

/// Static degraded response served when the live target is unavailable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_status")]
    pub status: u16,
    pub body: Value,
}

fn default_fallback_status() -> u16 {
    503
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub mode: RouteMode,

    /// Stateless target: logical service group in the registry.
    #[serde(default)]
    pub service: Option<String>,

    /// Stateful target: named hash ring.
    #[serde(default)]
    pub ring: Option<String>,

    #[serde(default)]
    pub routing_key: Option<RoutingKeySource>,

    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

/// Canonical prefix form: exactly one leading '/', no trailing '/'.
///
/// Lookup keys are normalized the same way, so `api/v1/notifications` and
/// `/api/v1/notifications` address the same route. (The source system carried
/// both spellings for the notifications fallback and one of them never
/// matched.)
pub fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Ordered route table matched by longest normalized prefix.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<RouteConfig>,
}

impl RouteTable {
    /// Build from configuration, normalizing every prefix and sorting longest
    /// first so nested prefixes win.
    pub fn new(mut routes: Vec<RouteConfig>) -> Self {
        for route in &mut routes {
            route.path_prefix = normalize_prefix(&route.path_prefix);
        }
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self { routes }
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    /// Resolve a request path to its route. Prefixes match on segment
    /// boundaries: `/api/jobs` matches `/api/jobs` and `/api/jobs/123` but
    /// not `/api/jobsearch`.
    pub fn resolve(&self, path: &str) -> Option<&RouteConfig> {
        let path = normalize_prefix(path);
        self.routes.iter().find(|r| {
            let prefix = r.path_prefix.as_str();
            if prefix == "/" {
                return true;
            }
            path == prefix
                || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }

    /// Remainder of `path` under the matched route prefix, split on '/'.
    pub fn tail_segments<'a>(route: &RouteConfig, path: &'a str) -> Vec<&'a str> {
        let path = path.trim_matches('/');
        let prefix = route.path_prefix.trim_matches('/');
        let tail = if prefix.is_empty() {
            path
        } else {
            path.strip_prefix(prefix).unwrap_or("").trim_matches('/')
        };
        if tail.is_empty() {
            Vec::new()
        } else {
            tail.split('/').collect()
        }
    }
}
