//! Safety checkers run against a [`SimCluster`] between steps.
//!
//! All of them read records synchronously from the nodes' stores, crashed
//! nodes included, and must hold after every single step regardless of
//! reordering, loss, crashes or ambiguous writes:
//!
//! 1. **Version monotonicity**: a node's controller record never moves to a
//!    lower generation, and a node never serves a lower generation than one
//!    it served before.
//! 2. **Single authority**: per name, at most one generation is both
//!    served by some node and not yet stopped in its consensus group.
//! 3. **Controller agreement**: two controller records of a name at the same
//!    generation name the same active set.

use std::collections::{BTreeMap, BTreeSet};

use super::SimCluster;
use crate::types::{GroupId, NodeId, NodeSet, Version};

/// A property checked between simulation steps.
pub trait Invariant {
    /// Checker name, for reports.
    fn name(&self) -> &str;

    /// Inspect `cluster`; `Err` describes the violation.
    fn check(&mut self, cluster: &SimCluster) -> Result<(), String>;
}

/// The standard checkers.
pub fn all() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(VersionMonotonicity::default()),
        Box::new(SingleAuthority),
        Box::new(ControllerAgreement),
    ]
}

/// Generations only move forward.
#[derive(Debug, Default)]
pub struct VersionMonotonicity {
    controller_versions: BTreeMap<(NodeId, String), Version>,
    served_versions: BTreeMap<(NodeId, String), Version>,
}

impl Invariant for VersionMonotonicity {
    fn name(&self) -> &str {
        "version_monotonicity"
    }

    fn check(&mut self, cluster: &SimCluster) -> Result<(), String> {
        for id in cluster.node_ids() {
            for record in cluster.controller_records(id) {
                let key = (id, record.name.clone());
                let seen = self.controller_versions.entry(key).or_default();
                if record.active_version < *seen {
                    return Err(format!(
                        "controller record {} on {} went from {} to {}",
                        record.name, id, seen, record.active_version
                    ));
                }
                *seen = record.active_version;
            }
            for record in cluster.name_records(id) {
                if record.active_version.is_zero() {
                    continue;
                }
                let key = (id, record.name.clone());
                let seen = self.served_versions.entry(key).or_default();
                if record.active_version < *seen {
                    return Err(format!(
                        "{} on {} served {} after {}",
                        record.name, id, record.active_version, seen
                    ));
                }
                *seen = record.active_version;
            }
        }
        Ok(())
    }
}

/// At most one live generation per name.
#[derive(Debug, Default)]
pub struct SingleAuthority;

impl Invariant for SingleAuthority {
    fn name(&self) -> &str {
        "single_authority"
    }

    fn check(&mut self, cluster: &SimCluster) -> Result<(), String> {
        let mut live: BTreeMap<String, BTreeSet<Version>> = BTreeMap::new();
        for id in cluster.node_ids() {
            for record in cluster.name_records(id) {
                if record.active_version.is_zero() {
                    continue;
                }
                let group = GroupId::for_actives(&record.name, record.active_version);
                if !cluster.consensus().is_stopped(&group) {
                    live.entry(record.name.clone())
                        .or_default()
                        .insert(record.active_version);
                }
            }
        }
        match live.iter().find(|(_, versions)| versions.len() > 1) {
            Some((name, versions)) => Err(format!(
                "{} has live generations {:?}",
                name, versions
            )),
            None => Ok(()),
        }
    }
}

/// Controllers agree on the active set of each generation.
#[derive(Debug, Default)]
pub struct ControllerAgreement;

impl Invariant for ControllerAgreement {
    fn name(&self) -> &str {
        "controller_agreement"
    }

    fn check(&mut self, cluster: &SimCluster) -> Result<(), String> {
        let mut seen: BTreeMap<(String, Version), (NodeId, NodeSet)> = BTreeMap::new();
        for id in cluster.node_ids() {
            for record in cluster.controller_records(id) {
                let key = (record.name.clone(), record.active_version);
                match seen.get(&key) {
                    Some((other, actives)) if *actives != record.active_replicas => {
                        return Err(format!(
                            "{} at {}: {} has {:?}, {} has {:?}",
                            record.name,
                            record.active_version,
                            other,
                            actives,
                            id,
                            record.active_replicas
                        ));
                    }
                    Some(_) => {}
                    None => {
                        seen.insert(key, (id, record.active_replicas));
                    }
                }
            }
        }
        Ok(())
    }
}
