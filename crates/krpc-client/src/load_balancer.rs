use krpc_common::{KrpcError, Result};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// Ring positions contributed by each real node.
pub const VIRTUAL_NUM: usize = 5;

/// 32-bit FNV-1 hash with avalanche mixing, computed over UTF-16 code units.
///
/// Arithmetic wraps like a signed 32-bit integer and the result is made
/// non-negative by taking the absolute value.
pub fn fnv1_32_hash(key: &str) -> u32 {
    const PRIME: i32 = 16_777_619;
    let mut hash = 2_166_136_261u32 as i32;
    for unit in key.encode_utf16() {
        hash = (hash ^ i32::from(unit)).wrapping_mul(PRIME);
    }
    hash = hash.wrapping_add(hash << 13);
    hash ^= hash >> 7;
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 17;
    hash = hash.wrapping_add(hash << 5);
    hash.unsigned_abs()
}

fn virtual_label(node: &str, index: usize) -> String {
    format!("{}#{}", node, index)
}

fn real_label(virtual_label: &str) -> &str {
    virtual_label
        .rsplit_once('#')
        .map(|(node, _)| node)
        .unwrap_or(virtual_label)
}

#[derive(Debug, Default)]
struct HashRing {
    entries: BTreeMap<u32, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    fn rebuild(&mut self, nodes: &BTreeSet<String>) {
        self.entries.clear();
        self.nodes.clear();
        for node in nodes {
            self.insert(node);
        }
    }

    fn insert(&mut self, node: &str) {
        for i in 0..VIRTUAL_NUM {
            let label = virtual_label(node, i);
            self.entries.insert(fnv1_32_hash(&label), label);
        }
        self.nodes.insert(node.to_string());
    }

    fn remove(&mut self, node: &str) -> bool {
        for i in 0..VIRTUAL_NUM {
            let label = virtual_label(node, i);
            let hash = fnv1_32_hash(&label);
            // A colliding label from another node keeps its slot
            if self.entries.get(&hash) == Some(&label) {
                self.entries.remove(&hash);
            }
        }
        self.nodes.remove(node)
    }

    fn matches(&self, nodes: &BTreeSet<String>) -> bool {
        &self.nodes == nodes
    }

    /// Walks clockwise from `hash`, skipping excluded real nodes.
    fn lookup(&self, hash: u32, excluded: &HashSet<String>) -> Option<String> {
        let clockwise = self
            .entries
            .range(hash..)
            .chain(self.entries.range(..hash))
            .map(|(_, label)| real_label(label));

        let mut first = None;
        for node in clockwise {
            if first.is_none() {
                first = Some(node);
            }
            if !excluded.contains(node) {
                return Some(node.to_string());
            }
        }
        // Every candidate excluded: fall back to the plain ring answer
        first.map(str::to_string)
    }
}

/// Consistent-hash load balancer over real node labels (`host:port`).
///
/// Each real node occupies [`VIRTUAL_NUM`] positions on the ring. Every call
/// hashes a fresh random key, so repeated calls to one service spread across
/// replicas instead of sticking to one.
///
/// Ring rebuilds take the write lock; selections share the read lock.
#[derive(Debug, Default)]
pub struct ConsistentHashBalancer {
    ring: RwLock<HashRing>,
}

impl ConsistentHashBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a balancer whose ring already holds `nodes`.
    pub fn with_nodes(nodes: &[String]) -> Self {
        let balancer = Self::new();
        balancer.init(nodes);
        balancer
    }

    /// Clears the ring and rebuilds it from `nodes`.
    pub fn init(&self, nodes: &[String]) {
        let nodes: BTreeSet<String> = nodes.iter().cloned().collect();
        self.ring.write().rebuild(&nodes);
        tracing::debug!("Hash ring built from {} nodes", nodes.len());
    }

    /// Selects one of `candidates` using a random per-call key.
    pub fn select(&self, candidates: &[String]) -> Result<String> {
        self.select_with_key(&Uuid::new_v4().to_string(), candidates, &HashSet::new())
    }

    /// Selects one of `candidates` for `key`, avoiding `excluded` nodes
    /// while any other candidate remains.
    ///
    /// The ring is rebuilt first if its membership differs from `candidates`.
    pub fn select_with_key(
        &self,
        key: &str,
        candidates: &[String],
        excluded: &HashSet<String>,
    ) -> Result<String> {
        if candidates.is_empty() {
            return Err(KrpcError::InvalidArgument(
                "cannot balance over an empty candidate list".to_string(),
            ));
        }

        let wanted: BTreeSet<String> = candidates.iter().cloned().collect();
        let hash = fnv1_32_hash(key);

        {
            let ring = self.ring.read();
            if ring.matches(&wanted) {
                return ring.lookup(hash, excluded).ok_or_else(empty_ring);
            }
        }

        let mut ring = self.ring.write();
        if !ring.matches(&wanted) {
            tracing::debug!(
                "Hash ring membership changed ({} -> {} nodes), rebuilding",
                ring.nodes.len(),
                wanted.len()
            );
            ring.rebuild(&wanted);
        }
        let ring = RwLockWriteGuard::downgrade(ring);
        ring.lookup(hash, excluded).ok_or_else(empty_ring)
    }

    /// Adds one real node's virtual entries without a full rebuild.
    pub fn add_node(&self, node: &str) {
        let mut ring = self.ring.write();
        if ring.nodes.contains(node) {
            return;
        }
        ring.insert(node);
        tracing::debug!("Added {} to hash ring", node);
    }

    /// Removes one real node's virtual entries without a full rebuild.
    pub fn remove_node(&self, node: &str) {
        if self.ring.write().remove(node) {
            tracing::debug!("Removed {} from hash ring", node);
        }
    }

    /// Real nodes currently on the ring, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.ring.read().nodes.iter().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.ring.read().nodes.len()
    }

    pub fn virtual_node_count(&self) -> usize {
        self.ring.read().entries.len()
    }
}

fn empty_ring() -> KrpcError {
    KrpcError::ServiceUnavailable("hash ring is empty".to_string())
}
