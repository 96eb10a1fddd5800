use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Uri};

use sphere_common::{GatewayError, RoutingKeySource};

use crate::registry::ServiceRegistry;
use crate::ring::HashRing;

/// Session-affine router: extracts a routing key from the request and
/// resolves it through a hash ring so every request for one logical session
/// (room, board, document) reaches the same instance.
pub struct StatefulRouter {
    ring: Arc<HashRing>,
    group: String,
}

impl StatefulRouter {
    pub fn new(ring: Arc<HashRing>, group: impl Into<String>) -> Self {
        Self {
            ring,
            group: group.into(),
        }
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    /// Logical service group whose instances back the ring.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Resolve a routing key to an instance address. The caller decides what
    /// to do when the resolved instance is unreachable — rerouting the key to
    /// a different node here would silently break session affinity.
    pub fn resolve(&self, key: &str) -> Result<String, GatewayError> {
        self.ring.resolve(key).ok_or_else(|| GatewayError::EmptyRing {
            ring: self.ring.name().to_string(),
        })
    }
}

/// Pull the routing key out of the request per the route's configured rule.
/// Fails with MissingRoutingKey when absent — never defaults to a node.
pub fn extract_key(
    rule: &RoutingKeySource,
    uri: &Uri,
    headers: &HeaderMap,
    tail_segments: &[&str],
) -> Result<String, GatewayError> {
    let missing = || GatewayError::MissingRoutingKey {
        key: rule.describe(),
    };

    match rule {
        RoutingKeySource::Query(name) => uri
            .query()
            .and_then(|q| {
                q.split('&').find_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    (k == name.as_str() && !v.is_empty()).then(|| v.to_string())
                })
            })
            .ok_or_else(missing),
        RoutingKeySource::Header(name) => headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .ok_or_else(missing),
        RoutingKeySource::PathSegment(index) => tail_segments
            .get(*index)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(missing),
    }
}

/// One refresh pass: repopulate the ring with the group's live instances.
/// Returns whether the ring changed.
pub fn refresh_from_registry(registry: &ServiceRegistry, ring: &HashRing, group: &str) -> bool {
    ring.set_nodes(registry.live_addresses(group))
}

/// Periodic ring refresh. Each ring gets its own task, so one registry scan
/// can never delay another ring's refresh.
pub async fn refresh_loop(
    registry: Arc<ServiceRegistry>,
    ring: Arc<HashRing>,
    group: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        refresh_from_registry(&registry, &ring, &group);
    }
}
