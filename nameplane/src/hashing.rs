//! Placement of names on replica controllers.
//!
//! Names are hashed with 64-bit FNV-1a: the mapping must be identical on
//! every node and across builds.

use crate::types::{NodeId, NodeSet};

/// Maps a name to the fixed set of nodes that control it.
pub trait ReplicaControllerSet {
    /// Controllers of `name`. Must be deterministic for a given node table.
    fn controllers_for(&self, name: &str) -> NodeSet;
}

/// Ring over the sorted node ids: a name hashes to a start position and
/// is controlled by the next `replication` nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    ring: Vec<NodeId>,
    replication: usize,
}

impl HashRing {
    /// Ring over `nodes`, `replication` controllers per name.
    pub fn new(nodes: &NodeSet, replication: usize) -> Self {
        Self {
            ring: nodes.iter().copied().collect(),
            replication: replication.min(nodes.len()),
        }
    }
}

impl ReplicaControllerSet for HashRing {
    fn controllers_for(&self, name: &str) -> NodeSet {
        if self.ring.is_empty() {
            return NodeSet::new();
        }
        let start = (fnv1a(name.as_bytes()) % self.ring.len() as u64) as usize;
        (0..self.replication)
            .map(|i| self.ring[(start + i) % self.ring.len()])
            .collect()
    }
}

/// 64-bit FNV-1a.
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Every name is controlled by the same nodes.
#[derive(Debug, Clone)]
pub struct FixedControllers(pub NodeSet);

impl ReplicaControllerSet for FixedControllers {
    fn controllers_for(&self, _name: &str) -> NodeSet {
        self.0.clone()
    }
}
