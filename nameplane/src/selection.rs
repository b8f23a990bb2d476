//! Replica selection policy.
//!
//! A controller sizes the next active group from the name's read and write
//! moving averages, then fills it with the highest-voted nodes:
//!
//! ```text
//! avg lookups < threshold        → keep the current group
//! avg updates == 0               → min(max_replica, node count)
//! otherwise                      → round(lookups / (updates · normalizing constant))
//!                                  clamped to [min_replica, min(max_replica, node count)]
//! ```

use std::collections::BTreeMap;

use crate::config::{NodeConfig, ReconfigConfig};
use crate::record::ControllerRecord;
use crate::types::{NodeId, NodeSet};

/// Greedy selection of the `k` highest-voted nodes.
///
/// Nodes without a known ping latency are skipped. Equal votes are broken
/// by lowest node id. Fewer than `k` nodes are returned when not enough
/// candidates exist.
pub fn highest_voted(votes: &BTreeMap<NodeId, u32>, k: usize, nodes: &NodeConfig) -> NodeSet {
    let mut ranked: Vec<(NodeId, u32)> = votes
        .iter()
        .filter(|(id, _)| nodes.ping_latency(**id).is_some())
        .map(|(id, vote)| (*id, *vote))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(k).map(|(id, _)| id).collect()
}

/// Size of the next active group, or `None` to keep the current one.
pub fn replica_count(
    avg_lookups: f64,
    avg_updates: f64,
    node_count: usize,
    config: &ReconfigConfig,
) -> Option<usize> {
    if avg_lookups < config.min_lookup_threshold {
        return None;
    }
    let upper = config.max_replica.min(node_count);
    if avg_updates == 0.0 {
        return Some(upper);
    }
    let wanted = (avg_lookups / (avg_updates * config.normalizing_constant)).round() as usize;
    Some(wanted.clamp(config.min_replica.min(upper), upper))
}

/// Whether `proposed` differs from `current`.
pub fn active_set_modified(current: &NodeSet, proposed: &NodeSet) -> bool {
    current != proposed
}

/// Next active group for `record`, or `None` when it should not change.
pub fn compute_new_actives(
    record: &ControllerRecord,
    config: &ReconfigConfig,
    nodes: &NodeConfig,
) -> Option<NodeSet> {
    let count = replica_count(
        record.moving_avg_reads.average(),
        record.moving_avg_writes.average(),
        nodes.len(),
        config,
    )?;
    let proposed = record.highest_voted_replicas(count, nodes);
    if proposed.len() < config.min_replica {
        return None;
    }
    active_set_modified(&record.active_replicas, &proposed).then_some(proposed)
}
