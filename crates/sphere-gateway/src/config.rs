use std::collections::HashSet;

use anyhow::{bail, Context};
use serde::Deserialize;

use sphere_common::{HealthCheckConfig, RouteConfig, RouteMode};
use sphere_router::ring::DEFAULT_VIRTUAL_NODES;
use sphere_router::CircuitBreakerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Logical group for multi-instance services; defaults to `name`.
    #[serde(default)]
    pub group: Option<String>,

    pub base_url: String,

    #[serde(default)]
    pub health: HealthCheckConfig,

    /// Per-service breaker tuning; gateway defaults apply when absent.
    #[serde(default)]
    pub breaker: Option<CircuitBreakerConfig>,
}

impl ServiceConfig {
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    pub name: String,

    /// Service group whose live instances populate the ring.
    pub service: String,

    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,

    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_virtual_nodes() -> u32 {
    DEFAULT_VIRTUAL_NODES
}
fn default_refresh_interval_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub rings: Vec<RingConfig>,

    pub routes: Vec<RouteConfig>,
}

pub fn load(path: &str) -> anyhow::Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading gateway config '{path}'"))?;
    let config: GatewayConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing gateway config '{path}'"))?;
    validate(&config)?;
    Ok(config)
}

/// Reject mis-wired tables at startup rather than at request time.
pub fn validate(config: &GatewayConfig) -> anyhow::Result<()> {
    let mut names = HashSet::new();
    let mut groups = HashSet::new();
    for svc in &config.services {
        if !names.insert(svc.name.as_str()) {
            bail!("duplicate service name '{}'", svc.name);
        }
        groups.insert(svc.group().to_string());
    }

    let mut ring_names = HashSet::new();
    for ring in &config.rings {
        if !ring_names.insert(ring.name.as_str()) {
            bail!("duplicate ring name '{}'", ring.name);
        }
        if !groups.contains(&ring.service) {
            bail!(
                "ring '{}' references unknown service group '{}'",
                ring.name,
                ring.service
            );
        }
    }

    for route in &config.routes {
        match route.mode {
            RouteMode::Stateless => {
                let Some(service) = &route.service else {
                    bail!("stateless route '{}' has no target service", route.path_prefix);
                };
                if !groups.contains(service) {
                    bail!(
                        "route '{}' references unknown service '{}'",
                        route.path_prefix,
                        service
                    );
                }
            }
            RouteMode::Stateful => {
                let Some(ring) = &route.ring else {
                    bail!("stateful route '{}' has no ring", route.path_prefix);
                };
                if !ring_names.contains(ring.as_str()) {
                    bail!(
                        "route '{}' references unknown ring '{}'",
                        route.path_prefix,
                        ring
                    );
                }
                if route.routing_key.is_none() {
                    bail!("stateful route '{}' has no routing_key", route.path_prefix);
                }
                if route.fallback.is_some() {
                    bail!(
                        "stateful route '{}' cannot have a fallback (rerouting breaks session affinity)",
                        route.path_prefix
                    );
                }
            }
        }
    }
    Ok(())
}
