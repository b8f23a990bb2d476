//! Controller record: which generation of which node set serves a name.
//!
//! ## Decision points
//!
//! | Transition | Condition | Updates |
//! |---|---|---|
//! | begin group change | `active_running == true` | running=false, old=actives, actives=new, old_version=v, version=v+1 |
//! | group change complete | `active_version == v+1` | running=true |
//! | mark for removal | `active_running == true` | marked=Marked, running=false |
//! | actives removed | `marked_for_removal == Marked` | marked=ActivesRemoved |
//!
//! `active_running == false` therefore means a reconfiguration or a removal
//! is in progress, and at most one of them can win the race to start.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use super::{applied_or, write_resolved, MovingAverage, SkipReason, Transition};
use crate::config::NodeConfig;
use crate::error::StoreError;
use crate::selection;
use crate::store::{Condition, FieldValue, Record, RecordStore};
use crate::types::{GroupId, NodeId, NodeSet, Version};

/// Removal progress of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RemovalMark {
    /// Not being removed.
    #[default]
    Unmarked,
    /// Removal accepted; the active group is being stopped.
    Marked,
    /// The active group removed its records; the controller record may go.
    ActivesRemoved,
}

impl From<RemovalMark> for u8 {
    fn from(mark: RemovalMark) -> Self {
        match mark {
            RemovalMark::Unmarked => 0,
            RemovalMark::Marked => 1,
            RemovalMark::ActivesRemoved => 2,
        }
    }
}

impl TryFrom<u8> for RemovalMark {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Unmarked),
            1 => Ok(Self::Marked),
            2 => Ok(Self::ActivesRemoved),
            other => Err(format!("invalid removal mark {}", other)),
        }
    }
}

impl From<RemovalMark> for FieldValue {
    fn from(mark: RemovalMark) -> Self {
        FieldValue::Int(u8::from(mark).into())
    }
}

/// Read and write frequency reported by a name server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Reads in the last report window.
    pub read: u64,
    /// Writes in the last report window.
    pub write: u64,
}

/// Per-name record held by replica controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerRecord {
    /// Registered name, the primary key.
    #[serde(rename = "rcr_name")]
    pub name: String,

    /// Controllers of this name.
    #[serde(rename = "rcr_primary")]
    pub primary_replicas: NodeSet,

    /// Node set of the current generation.
    #[serde(rename = "rcr_active")]
    pub active_replicas: NodeSet,

    /// Node set of the previous generation.
    #[serde(rename = "rcr_oldactive")]
    pub old_active_replicas: NodeSet,

    /// Whether the current generation confirmed it is serving.
    #[serde(rename = "rcr_activeRunning")]
    pub active_running: bool,

    /// Current generation.
    #[serde(rename = "rcr_activeVersion")]
    pub active_version: Version,

    /// Previous generation.
    #[serde(rename = "rcr_oldActiveVersion")]
    pub old_active_version: Version,

    /// Removal progress.
    #[serde(rename = "rcr_markedForRemoval")]
    pub marked_for_removal: RemovalMark,

    /// Replica-selection votes per node.
    #[serde(rename = "rcr_votesMap")]
    pub votes: BTreeMap<NodeId, u32>,

    /// Last reported load per node.
    #[serde(rename = "rcr_statsMap")]
    pub stats: BTreeMap<NodeId, NodeStats>,

    /// Reads counted since the last load recomputation.
    #[serde(rename = "rcr_prevTotalRead")]
    pub prev_total_reads: u64,

    /// Writes counted since the last load recomputation.
    #[serde(rename = "rcr_prevTotalWrite")]
    pub prev_total_writes: u64,

    /// Moving average of reads per window.
    #[serde(rename = "rcr_movAvgRead")]
    pub moving_avg_reads: MovingAverage,

    /// Moving average of writes per window.
    #[serde(rename = "rcr_movAvgWrite")]
    pub moving_avg_writes: MovingAverage,

    /// Time of the last keep-alive from the active group, in milliseconds.
    #[serde(rename = "rcr_keepAlive")]
    pub keep_alive_ms: u64,
}

impl ControllerRecord {
    /// Record of a freshly registered name: the controllers themselves form
    /// the first active group, already running at [`Version::INITIAL`].
    pub fn new(name: &str, primaries: NodeSet) -> Self {
        Self {
            name: name.to_string(),
            active_replicas: primaries.clone(),
            old_active_replicas: primaries.clone(),
            primary_replicas: primaries,
            active_running: true,
            active_version: Version::INITIAL,
            old_active_version: Version::ZERO,
            marked_for_removal: RemovalMark::Unmarked,
            votes: BTreeMap::new(),
            stats: BTreeMap::new(),
            prev_total_reads: 0,
            prev_total_writes: 0,
            moving_avg_reads: MovingAverage::new(),
            moving_avg_writes: MovingAverage::new(),
            keep_alive_ms: 0,
        }
    }

    /// Consensus group of the current generation.
    pub fn active_group(&self) -> GroupId {
        GroupId::for_actives(&self.name, self.active_version)
    }

    /// The `k` highest-voted nodes with a known ping latency.
    pub fn highest_voted_replicas(&self, k: usize, nodes: &NodeConfig) -> NodeSet {
        selection::highest_voted(&self.votes, k, nodes)
    }
}

/// Fields of a [`ControllerRecord`], with their persisted names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerField {
    /// `rcr_name`
    Name,
    /// `rcr_primary`
    PrimaryReplicas,
    /// `rcr_active`
    ActiveReplicas,
    /// `rcr_oldactive`
    OldActiveReplicas,
    /// `rcr_activeRunning`
    ActiveRunning,
    /// `rcr_activeVersion`
    ActiveVersion,
    /// `rcr_oldActiveVersion`
    OldActiveVersion,
    /// `rcr_markedForRemoval`
    MarkedForRemoval,
    /// `rcr_votesMap`
    Votes,
    /// `rcr_statsMap`
    Stats,
    /// `rcr_prevTotalRead`
    PrevTotalReads,
    /// `rcr_prevTotalWrite`
    PrevTotalWrites,
    /// `rcr_movAvgRead`
    MovingAvgReads,
    /// `rcr_movAvgWrite`
    MovingAvgWrites,
    /// `rcr_keepAlive`
    KeepAlive,
}

impl ControllerField {
    /// Every field, in declaration order.
    pub const ALL: [ControllerField; 15] = [
        Self::Name,
        Self::PrimaryReplicas,
        Self::ActiveReplicas,
        Self::OldActiveReplicas,
        Self::ActiveRunning,
        Self::ActiveVersion,
        Self::OldActiveVersion,
        Self::MarkedForRemoval,
        Self::Votes,
        Self::Stats,
        Self::PrevTotalReads,
        Self::PrevTotalWrites,
        Self::MovingAvgReads,
        Self::MovingAvgWrites,
        Self::KeepAlive,
    ];

    /// Persisted field name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "rcr_name",
            Self::PrimaryReplicas => "rcr_primary",
            Self::ActiveReplicas => "rcr_active",
            Self::OldActiveReplicas => "rcr_oldactive",
            Self::ActiveRunning => "rcr_activeRunning",
            Self::ActiveVersion => "rcr_activeVersion",
            Self::OldActiveVersion => "rcr_oldActiveVersion",
            Self::MarkedForRemoval => "rcr_markedForRemoval",
            Self::Votes => "rcr_votesMap",
            Self::Stats => "rcr_statsMap",
            Self::PrevTotalReads => "rcr_prevTotalRead",
            Self::PrevTotalWrites => "rcr_prevTotalWrite",
            Self::MovingAvgReads => "rcr_movAvgRead",
            Self::MovingAvgWrites => "rcr_movAvgWrite",
            Self::KeepAlive => "rcr_keepAlive",
        }
    }
}

impl std::fmt::Display for ControllerField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single update of a [`ControllerRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerUpdate {
    /// Demote the current generation and install `new_actives` at
    /// `new_version`, not yet running.
    BeginGroupChange {
        /// Node set of the new generation.
        new_actives: NodeSet,
        /// The new generation.
        new_version: Version,
    },
    /// Set the running flag.
    SetActiveRunning(bool),
    /// Set the removal progress.
    SetMarkedForRemoval(RemovalMark),
    /// Add a replica-selection vote and count the request behind it.
    AddVote {
        /// Voted node.
        node: NodeId,
        /// Vote weight.
        vote: u32,
        /// Whether the request was an update (else a lookup).
        update: bool,
    },
    /// Replace the load reported by a node.
    SetStats {
        /// Reporting node.
        node: NodeId,
        /// Reported load.
        stats: NodeStats,
    },
    /// Push the counted totals into the moving averages and reset them.
    RecomputeLoad {
        /// Moving-average window.
        window: usize,
    },
    /// Record a keep-alive time.
    SetKeepAlive(u64),
}

impl Record for ControllerRecord {
    type Field = ControllerField;
    type Update = ControllerUpdate;

    fn key(&self) -> &str {
        &self.name
    }

    fn field_value(&self, field: ControllerField) -> Option<FieldValue> {
        match field {
            ControllerField::ActiveRunning => Some(self.active_running.into()),
            ControllerField::ActiveVersion => Some(self.active_version.into()),
            ControllerField::OldActiveVersion => Some(self.old_active_version.into()),
            ControllerField::MarkedForRemoval => Some(self.marked_for_removal.into()),
            ControllerField::PrevTotalReads => Some(FieldValue::Int(self.prev_total_reads as i64)),
            ControllerField::PrevTotalWrites => {
                Some(FieldValue::Int(self.prev_total_writes as i64))
            }
            ControllerField::KeepAlive => Some(FieldValue::Int(self.keep_alive_ms as i64)),
            ControllerField::Name
            | ControllerField::PrimaryReplicas
            | ControllerField::ActiveReplicas
            | ControllerField::OldActiveReplicas
            | ControllerField::Votes
            | ControllerField::Stats
            | ControllerField::MovingAvgReads
            | ControllerField::MovingAvgWrites => None,
        }
    }

    fn apply(&mut self, update: &ControllerUpdate) {
        match update {
            ControllerUpdate::BeginGroupChange {
                new_actives,
                new_version,
            } => {
                self.active_running = false;
                self.old_active_replicas =
                    std::mem::replace(&mut self.active_replicas, new_actives.clone());
                self.old_active_version = self.active_version;
                self.active_version = *new_version;
            }
            ControllerUpdate::SetActiveRunning(running) => self.active_running = *running,
            ControllerUpdate::SetMarkedForRemoval(mark) => self.marked_for_removal = *mark,
            ControllerUpdate::AddVote { node, vote, update } => {
                *self.votes.entry(*node).or_default() += vote;
                if *update {
                    self.prev_total_writes += 1;
                } else {
                    self.prev_total_reads += 1;
                }
            }
            ControllerUpdate::SetStats { node, stats } => {
                self.stats.insert(*node, *stats);
            }
            ControllerUpdate::RecomputeLoad { window } => {
                self.moving_avg_reads.push(self.prev_total_reads, *window);
                self.moving_avg_writes.push(self.prev_total_writes, *window);
                self.prev_total_reads = 0;
                self.prev_total_writes = 0;
            }
            ControllerUpdate::SetKeepAlive(ms) => self.keep_alive_ms = *ms,
        }
    }
}

/// Controller record operations on top of a [`RecordStore`].
///
/// Like [`NameRecords`](super::NameRecords), ambiguous writes are resolved
/// by re-reading the record.
#[derive(Clone)]
pub struct ControllerRecords {
    store: Rc<dyn RecordStore<ControllerRecord>>,
}

impl ControllerRecords {
    /// Wrap a store.
    pub fn new(store: Rc<dyn RecordStore<ControllerRecord>>) -> Self {
        Self { store }
    }

    /// Register a name owned by `primaries`.
    pub async fn create(&self, name: &str, primaries: NodeSet) -> Result<(), StoreError> {
        self.store.put(ControllerRecord::new(name, primaries)).await
    }

    /// Read a record.
    pub async fn get(&self, name: &str) -> Result<ControllerRecord, StoreError> {
        self.store.get(name).await
    }

    /// Every record held.
    pub async fn scan(&self) -> Result<Vec<ControllerRecord>, StoreError> {
        self.store.scan().await
    }

    /// Names with a reconfiguration or removal in progress.
    pub async fn in_progress(&self) -> Result<Vec<ControllerRecord>, StoreError> {
        self.store.select(&|r: &ControllerRecord| !r.active_running).await
    }

    /// Move `STEADY(v)` to `STOPPING(v, new_version)`.
    ///
    /// The conditional write on `active_running == true` is the sole
    /// decision point: of several concurrent proposals at most one applies.
    pub async fn begin_group_change(
        &self,
        name: &str,
        new_actives: &NodeSet,
        new_version: Version,
    ) -> Result<Transition, StoreError> {
        let record = self.get(name).await?;
        if record.marked_for_removal != RemovalMark::Unmarked {
            return Ok(Transition::NotApplied(SkipReason::MarkedForRemoval));
        }
        if record.active_version >= new_version {
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        if new_version != record.active_version.next() {
            return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                current: record.active_version,
                requested: new_version,
            }));
        }
        if !record.active_running {
            return Ok(Transition::NotApplied(SkipReason::InProgress));
        }
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(ControllerField::ActiveRunning, true),
            &[ControllerUpdate::BeginGroupChange {
                new_actives: new_actives.clone(),
                new_version,
            }],
            |r| r.active_version == new_version && &r.active_replicas == new_actives,
        )
        .await?;
        Ok(applied_or(applied, SkipReason::ConditionFailed))
    }

    /// Move `TRANSFERRING(v-1, version)` to `STEADY(version)`.
    pub async fn set_active_running(
        &self,
        name: &str,
        version: Version,
    ) -> Result<Transition, StoreError> {
        let record = self.get(name).await?;
        if record.active_version != version {
            return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                current: record.active_version,
                requested: version,
            }));
        }
        if record.marked_for_removal != RemovalMark::Unmarked {
            return Ok(Transition::NotApplied(SkipReason::MarkedForRemoval));
        }
        if record.active_running {
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(ControllerField::ActiveVersion, version),
            &[ControllerUpdate::SetActiveRunning(true)],
            |r| r.active_version == version && r.active_running,
        )
        .await?;
        Ok(applied_or(applied, SkipReason::ConditionFailed))
    }

    /// Accept removal of `name`. Only a running name can be marked, and
    /// marking stops it from running so no reconfiguration can start.
    pub async fn mark_for_removal(&self, name: &str) -> Result<Transition, StoreError> {
        let record = self.get(name).await?;
        if record.marked_for_removal != RemovalMark::Unmarked {
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        if !record.active_running {
            return Ok(Transition::NotApplied(SkipReason::InProgress));
        }
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(ControllerField::ActiveRunning, true),
            &[
                ControllerUpdate::SetMarkedForRemoval(RemovalMark::Marked),
                ControllerUpdate::SetActiveRunning(false),
            ],
            |r| r.marked_for_removal != RemovalMark::Unmarked,
        )
        .await?;
        Ok(applied_or(applied, SkipReason::ConditionFailed))
    }

    /// Record that the active group dropped its records.
    pub async fn mark_actives_removed(&self, name: &str) -> Result<Transition, StoreError> {
        let applied = write_resolved(
            &*self.store,
            name,
            &Condition::new(ControllerField::MarkedForRemoval, RemovalMark::Marked),
            &[ControllerUpdate::SetMarkedForRemoval(
                RemovalMark::ActivesRemoved,
            )],
            |r| r.marked_for_removal == RemovalMark::ActivesRemoved,
        )
        .await?;
        Ok(applied_or(applied, SkipReason::Duplicate))
    }

    /// Delete the record once its actives are removed.
    pub async fn remove(&self, name: &str) -> Result<Transition, StoreError> {
        let record = match self.get(name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Ok(Transition::NotApplied(SkipReason::Duplicate))
            }
            Err(err) => return Err(err),
        };
        if record.marked_for_removal != RemovalMark::ActivesRemoved {
            return Ok(Transition::NotApplied(SkipReason::ConditionFailed));
        }
        match self.store.remove(name).await {
            Ok(()) => Ok(Transition::Applied),
            Err(StoreError::NotFound(_)) => Ok(Transition::NotApplied(SkipReason::Duplicate)),
            Err(err) => Err(err),
        }
    }

    /// Count a replica-selection vote for `node`.
    pub async fn add_vote(
        &self,
        name: &str,
        node: NodeId,
        vote: u32,
        update: bool,
    ) -> Result<(), StoreError> {
        self.store
            .write(name, &[ControllerUpdate::AddVote { node, vote, update }])
            .await
    }

    /// Store the load reported by `node`.
    pub async fn add_stats(
        &self,
        name: &str,
        node: NodeId,
        read: u64,
        write: u64,
    ) -> Result<(), StoreError> {
        self.store
            .write(
                name,
                &[ControllerUpdate::SetStats {
                    node,
                    stats: NodeStats { read, write },
                }],
            )
            .await
    }

    /// Close the current load window.
    pub async fn recompute_average_read_write_rate(
        &self,
        name: &str,
        window: usize,
    ) -> Result<(), StoreError> {
        self.store
            .write(name, &[ControllerUpdate::RecomputeLoad { window }])
            .await
    }

    /// Store the time of the last keep-alive.
    pub async fn set_keep_alive(&self, name: &str, at_ms: u64) -> Result<(), StoreError> {
        self.store
            .write(name, &[ControllerUpdate::SetKeepAlive(at_ms)])
            .await
    }
}
