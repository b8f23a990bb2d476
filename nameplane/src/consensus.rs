//! Per-group consensus interface.
//!
//! Controllers of a name form one consensus group; each active generation
//! forms another. The protocol only needs three primitives:
//!
//! - `start`: create a group with a fixed membership
//! - `propose`: totally order a packet; every member executes the decision
//! - `stop`: like `propose`, but the group accepts nothing afterwards
//!
//! Decisions come back to each member as a [`Decision`], which the node
//! hands to its controller or active role.
//!
//! [`LocalConsensus`] is a deterministic single-process implementation:
//! every accepted proposal is queued once per member, in proposal order.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::error::ConsensusError;
use crate::packet::ReconfigPacket;
use crate::types::{GroupId, NodeId, NodeSet};

/// A decided packet, to be executed by `member`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Group that decided.
    pub group: GroupId,
    /// Member that must execute the decision.
    pub member: NodeId,
    /// Decided packet.
    pub packet: ReconfigPacket,
}

/// Group consensus primitives.
pub trait GroupConsensus {
    /// Create `group` with `members`. Starting an existing group with the
    /// same members is a no-op.
    fn start(&self, group: &GroupId, members: &NodeSet) -> Result<(), ConsensusError>;

    /// Order `packet` in `group`.
    fn propose(&self, group: &GroupId, packet: ReconfigPacket) -> Result<(), ConsensusError>;

    /// Order `packet` as the last decision of `group`.
    fn stop(&self, group: &GroupId, packet: ReconfigPacket) -> Result<(), ConsensusError>;
}

#[derive(Debug)]
struct GroupState {
    members: NodeSet,
    stopped: bool,
}

/// In-process consensus with a shared decision queue.
#[derive(Debug, Default)]
pub struct LocalConsensus {
    groups: RefCell<BTreeMap<GroupId, GroupState>>,
    decisions: RefCell<VecDeque<Decision>>,
}

impl LocalConsensus {
    /// Create an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued decision.
    pub fn drain(&self) -> Vec<Decision> {
        self.decisions.borrow_mut().drain(..).collect()
    }

    /// Take the oldest queued decision.
    pub fn pop(&self) -> Option<Decision> {
        self.decisions.borrow_mut().pop_front()
    }

    /// Number of queued decisions.
    pub fn pending(&self) -> usize {
        self.decisions.borrow().len()
    }

    /// Whether `group` accepted its stop.
    pub fn is_stopped(&self, group: &GroupId) -> bool {
        self.groups
            .borrow()
            .get(group)
            .is_some_and(|state| state.stopped)
    }

    /// Members of `group`, if started.
    pub fn members(&self, group: &GroupId) -> Option<NodeSet> {
        self.groups
            .borrow()
            .get(group)
            .map(|state| state.members.clone())
    }

    fn decide(
        &self,
        group: &GroupId,
        packet: ReconfigPacket,
        stop: bool,
    ) -> Result<(), ConsensusError> {
        let mut groups = self.groups.borrow_mut();
        let state = groups
            .get_mut(group)
            .ok_or_else(|| ConsensusError::UnknownGroup(group.clone()))?;
        if state.stopped {
            return Err(ConsensusError::GroupStopped(group.clone()));
        }
        state.stopped = stop;
        debug!(group = %group, packet = %packet, stop, "decided");
        let mut decisions = self.decisions.borrow_mut();
        for member in &state.members {
            decisions.push_back(Decision {
                group: group.clone(),
                member: *member,
                packet: packet.clone(),
            });
        }
        Ok(())
    }
}

impl GroupConsensus for LocalConsensus {
    fn start(&self, group: &GroupId, members: &NodeSet) -> Result<(), ConsensusError> {
        let mut groups = self.groups.borrow_mut();
        match groups.get(group) {
            Some(state) if &state.members == members => Ok(()),
            Some(_) => Err(ConsensusError::MembershipConflict {
                group: group.clone(),
            }),
            None => {
                debug!(group = %group, members = ?members, "group started");
                groups.insert(
                    group.clone(),
                    GroupState {
                        members: members.clone(),
                        stopped: false,
                    },
                );
                Ok(())
            }
        }
    }

    fn propose(&self, group: &GroupId, packet: ReconfigPacket) -> Result<(), ConsensusError> {
        self.decide(group, packet, false)
    }

    fn stop(&self, group: &GroupId, packet: ReconfigPacket) -> Result<(), ConsensusError> {
        self.decide(group, packet, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::GroupChange;
    use crate::types::{node_set, RequestId, Version};

    fn packet() -> ReconfigPacket {
        ReconfigPacket::GroupChangeComplete(GroupChange {
            name: "n1".into(),
            request_id: RequestId(1),
            proposer: NodeId(1),
            version: Version::new(2),
        })
    }

    #[test]
    fn test_decision_delivered_to_every_member() {
        let consensus = LocalConsensus::new();
        let group = GroupId::for_controllers("n1");
        consensus.start(&group, &node_set([1, 2, 3])).expect("start");
        consensus.propose(&group, packet()).expect("propose");

        let decisions = consensus.drain();
        let members: Vec<u32> = decisions.iter().map(|d| d.member.0).collect();
        assert_eq!(members, vec![1, 2, 3]);
        assert!(decisions.iter().all(|d| d.packet == packet()));
    }

    #[test]
    fn test_stopped_group_rejects_proposals() {
        let consensus = LocalConsensus::new();
        let group = GroupId::for_actives("n1", Version::new(1));
        consensus.start(&group, &node_set([1, 2])).expect("start");
        consensus.stop(&group, packet()).expect("stop");
        assert!(consensus.is_stopped(&group));

        assert_eq!(
            consensus.propose(&group, packet()),
            Err(ConsensusError::GroupStopped(group.clone()))
        );
        assert_eq!(
            consensus.stop(&group, packet()),
            Err(ConsensusError::GroupStopped(group.clone()))
        );
        assert_eq!(consensus.pending(), 2);
    }

    #[test]
    fn test_start_is_idempotent_but_membership_is_fixed() {
        let consensus = LocalConsensus::new();
        let group = GroupId::for_actives("n1", Version::new(2));
        consensus.start(&group, &node_set([4, 5])).expect("start");
        consensus.start(&group, &node_set([4, 5])).expect("restart");
        assert!(matches!(
            consensus.start(&group, &node_set([4, 6])),
            Err(ConsensusError::MembershipConflict { .. })
        ));
        assert!(matches!(
            consensus.propose(&GroupId::for_controllers("zz"), packet()),
            Err(ConsensusError::UnknownGroup(_))
        ));
    }
}
