use std::collections::BTreeMap;

use parking_lot::RwLock;

pub const DEFAULT_VIRTUAL_NODES: u32 = 150;

/// FNV-1a, 64-bit. Stable across processes, so a given key lands on the same
/// instance after a gateway restart as long as the node set is unchanged.
pub fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

struct RingInner {
    ring: BTreeMap<u64, String>,
    nodes: Vec<String>,
}

/// Consistent hash ring mapping routing keys to physical node addresses.
///
/// Each node contributes `virtual_nodes` positions (hash of `"{addr}:{i}"`),
/// so membership changes remap only the keys whose nearest position belonged
/// to the changed node. Lookups are a pure function of (ring contents, key).
pub struct HashRing {
    name: String,
    virtual_nodes: u32,
    inner: RwLock<RingInner>,
}

impl HashRing {
    pub fn new(name: impl Into<String>, virtual_nodes: u32) -> Self {
        Self {
            name: name.into(),
            virtual_nodes: virtual_nodes.max(1),
            inner: RwLock::new(RingInner {
                ring: BTreeMap::new(),
                nodes: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> Vec<String> {
        self.inner.read().nodes.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().ring.is_empty()
    }

    /// Replace the node set, rebuilding the ring from scratch. Returns false
    /// when the set is unchanged and the ring was left untouched.
    pub fn set_nodes(&self, mut nodes: Vec<String>) -> bool {
        nodes.sort();
        nodes.dedup();

        let mut inner = self.inner.write();
        if inner.nodes == nodes {
            return false;
        }

        let mut ring = BTreeMap::new();
        for node in &nodes {
            for i in 0..self.virtual_nodes {
                ring.insert(fnv1a64(format!("{node}:{i}").as_bytes()), node.clone());
            }
        }
        tracing::info!(
            ring = %self.name,
            nodes = nodes.len(),
            positions = ring.len(),
            "hash ring rebuilt"
        );
        inner.ring = ring;
        inner.nodes = nodes;
        true
    }

    /// Deterministically resolve `key` to a node: the smallest ring position
    /// at or above the key's hash, wrapping to the first position.
    pub fn resolve(&self, key: &str) -> Option<String> {
        let inner = self.inner.read();
        if inner.ring.is_empty() {
            return None;
        }
        let hash = fnv1a64(key.as_bytes());
        inner
            .ring
            .range(hash..)
            .next()
            .or_else(|| inner.ring.iter().next())
            .map(|(_, node)| node.clone())
    }
}
