//! Workload helpers shared by the scenarios.

use std::collections::BTreeMap;

use nameplane::sim::{SimCluster, SimError};
use nameplane::{NodeId, ValuesMap, Version};

use super::invariants::Committed;

/// Step budget of one quiet run.
pub const MAX_STEPS: usize = 50_000;

/// Values of a test name: one `A` entry.
pub fn values(address: &str) -> ValuesMap {
    let mut map = ValuesMap::new();
    map.insert("A".to_string(), vec![address.to_string()]);
    map
}

/// Register `names`, each with its own address, and return what was
/// registered.
pub async fn register_names(
    cluster: &mut SimCluster,
    names: &[&str],
) -> Result<BTreeMap<String, ValuesMap>, SimError> {
    let mut registered = BTreeMap::new();
    for (i, name) in names.iter().enumerate() {
        let values = values(&format!("192.0.2.{}", i + 1));
        cluster.register(name, values.clone(), 30).await?;
        registered.insert(name.to_string(), values);
    }
    Ok(registered)
}

/// Deliver every queued decision and packet twice, batch by batch, until
/// nothing is queued. Returns the number of batches.
///
/// Bypasses the scheduler so every handler sees each input exactly twice.
pub async fn deliver_everything_twice(cluster: &SimCluster) -> Result<usize, SimError> {
    let now = cluster.now();
    let mut batches = 0;
    loop {
        let decisions = cluster.consensus().drain();
        let envelopes = cluster.bus().drain();
        if decisions.is_empty() && envelopes.is_empty() {
            return Ok(batches);
        }
        batches += 1;
        for decision in &decisions {
            let server = cluster
                .server(decision.member)
                .ok_or(SimError::NodeDown(decision.member))?;
            for _ in 0..2 {
                server.handle_decision(decision, now).await?;
            }
        }
        for envelope in &envelopes {
            let server = cluster
                .server(envelope.to)
                .ok_or(SimError::NodeDown(envelope.to))?;
            for _ in 0..2 {
                server.handle_frame(&envelope.frame, now).await?;
            }
        }
    }
}

/// Apply a client update to every member of the running generation of
/// `name`, then record it as committed. Returns the generation written.
pub async fn commit_update(
    cluster: &SimCluster,
    committed: &Committed,
    name: &str,
    values: ValuesMap,
) -> Result<Version, SimError> {
    let record = cluster.assert_converged(name)?;
    for id in &record.active_replicas {
        let server = cluster.server(*id).ok_or(SimError::NodeDown(*id))?;
        let transition = server
            .active()
            .update_values(name, record.active_version, values.clone())
            .await?;
        if !transition.is_applied() {
            return Err(SimError::NotConverged {
                name: name.to_string(),
                reason: format!("update not applied on {}", id),
            });
        }
    }
    committed.borrow_mut().insert(name.to_string(), values);
    Ok(record.active_version)
}

/// Nodes of `name` whose record serves a generation.
pub fn serving(cluster: &SimCluster, name: &str) -> Vec<NodeId> {
    cluster
        .node_ids()
        .into_iter()
        .filter(|id| {
            cluster
                .name_record(*id, name)
                .is_some_and(|r| !r.active_version.is_zero())
        })
        .collect()
}
