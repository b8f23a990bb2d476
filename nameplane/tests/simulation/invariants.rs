//! Checkers specific to the simulation workloads.
//!
//! The crate ships the protocol-level checkers (version monotonicity,
//! single authority, controller agreement). Workloads add one more:
//!
//! - **No loss**: every node serving a generation of a name serves exactly
//!   the values last committed for that name, through registration or
//!   through an update applied by the whole active group.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use nameplane::sim::invariants::{self, Invariant};
use nameplane::sim::SimCluster;
use nameplane::ValuesMap;

/// Last committed values per name, shared by the workload that commits
/// them and the checker that expects them.
pub type Committed = Rc<RefCell<BTreeMap<String, ValuesMap>>>;

/// Committed values are carried unchanged from generation to generation.
pub struct NoLossChecker {
    committed: Committed,
}

impl NoLossChecker {
    pub fn new(committed: Committed) -> Self {
        Self { committed }
    }
}

impl Invariant for NoLossChecker {
    fn name(&self) -> &str {
        "no_loss"
    }

    fn check(&mut self, cluster: &SimCluster) -> Result<(), String> {
        let committed = self.committed.borrow();
        for id in cluster.node_ids() {
            for record in cluster.name_records(id) {
                if record.active_version.is_zero() {
                    continue;
                }
                let Some(expected) = committed.get(&record.name) else {
                    continue;
                };
                if &record.values != expected {
                    return Err(format!(
                        "{} on {} serves {:?} at {}, last committed {:?}",
                        record.name, id, record.values, record.active_version, expected
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Protocol checkers plus [`NoLossChecker`] over fixed registered values.
pub fn all_with_values(registered: BTreeMap<String, ValuesMap>) -> Vec<Box<dyn Invariant>> {
    all_with_committed(Rc::new(RefCell::new(registered)))
}

/// Protocol checkers plus [`NoLossChecker`] following `committed`.
pub fn all_with_committed(committed: Committed) -> Vec<Box<dyn Invariant>> {
    let mut checkers = invariants::all();
    checkers.push(Box::new(NoLossChecker::new(committed)));
    checkers
}
