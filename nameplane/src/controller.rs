//! Replica controller: drives reconfiguration of the names it controls.
//!
//! The controller never blocks on a peer. Each public handler runs to
//! completion on one incoming packet, consensus decision or timer tick,
//! reads the controller record, applies at most one conditional write and
//! enqueues packets. Steps that wait for a reply register a retry task
//! which [`ReplicaController::tick`] resends, to the next member of the
//! target group each time, until the reply arrives or the retry budget is
//! spent.
//!
//! ## Group change, controller side
//!
//! ```text
//! propose_new_actives ─> [controller consensus] ─> execute_new_actives_proposed
//!                                                   (every controller: STEADY(v) → STOPPING)
//!                                                   proposer: Stop task ─> old group
//! handle_stop_confirm  (proposer)                   Start task ─> new group
//! handle_start_confirm (proposer)                   DeleteOldActiveState ─> old group
//!                                                   Commit task ─> [controller consensus]
//! execute_group_change_complete                     (every controller: → STEADY(v+1))
//! ```
//!
//! ## Restart
//!
//! Retry tasks live in memory only. After a restart, [`ReplicaController::recover`]
//! scans the records and re-arms the first step of every unfinished change:
//! every step is idempotent, so replaying from the stop is safe.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{NodeConfig, ReconfigConfig};
use crate::consensus::GroupConsensus;
use crate::error::{ReconfigError, StoreError};
use crate::heartbeat::KeepAliveTracker;
use crate::node::{Collaborators, TickReport};
use crate::packet::{
    GroupChange, KeepAlive, NewActiveProposal, ReconfigPacket, RemovalRequest, Role,
    StartupRequest, StopRequest,
};
use crate::record::{
    ControllerRecord, ControllerRecords, RemovalMark, SkipReason, Transition,
};
use crate::selection;
use crate::store::RecordStore;
use crate::transport::PacketSink;
use crate::types::{GroupId, NodeId, NodeSet, RequestId, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    Stop,
    Start,
    Commit,
    RemoveActives,
}

#[derive(Debug, Clone)]
enum Pending {
    Stop(StopRequest),
    Start(StartupRequest),
    Commit(GroupChange),
    RemoveActives(RemovalRequest),
}

impl Pending {
    fn step(&self) -> Step {
        match self {
            Self::Stop(_) => Step::Stop,
            Self::Start(_) => Step::Start,
            Self::Commit(_) => Step::Commit,
            Self::RemoveActives(_) => Step::RemoveActives,
        }
    }

    fn request_id(&self) -> RequestId {
        match self {
            Self::Stop(p) => p.request_id,
            Self::Start(p) => p.request_id,
            Self::Commit(p) => p.request_id,
            Self::RemoveActives(p) => p.request_id,
        }
    }
}

#[derive(Debug, Clone)]
struct Task {
    name: String,
    pending: Pending,
    targets: Vec<NodeId>,
    attempt: u32,
    next_retry: Duration,
}

impl Task {
    fn target(&self) -> Option<NodeId> {
        if self.targets.is_empty() {
            return None;
        }
        Some(self.targets[self.attempt as usize % self.targets.len()])
    }
}

/// Controller role of a name server.
pub struct ReplicaController {
    id: NodeId,
    config: ReconfigConfig,
    nodes: Rc<NodeConfig>,
    records: ControllerRecords,
    consensus: Rc<dyn GroupConsensus>,
    sink: Rc<dyn PacketSink>,
    tasks: RefCell<BTreeMap<(String, Step), Task>>,
    /// Names whose task ran out of retries, re-armed on the next tick.
    stalled: RefCell<BTreeSet<String>>,
    keep_alive: RefCell<KeepAliveTracker>,
    last_keep_alive_sent: Cell<Option<Duration>>,
    next_seq: Cell<u32>,
}

impl ReplicaController {
    /// Create the controller role of node `id` over `store`.
    pub fn new(
        id: NodeId,
        config: ReconfigConfig,
        collaborators: &Collaborators,
        store: Rc<dyn RecordStore<ControllerRecord>>,
    ) -> Self {
        Self {
            id,
            keep_alive: RefCell::new(KeepAliveTracker::new(config.keep_alive.clone())),
            config,
            nodes: collaborators.nodes.clone(),
            records: ControllerRecords::new(store),
            consensus: collaborators.consensus.clone(),
            sink: collaborators.sink.clone(),
            tasks: RefCell::new(BTreeMap::new()),
            stalled: RefCell::new(BTreeSet::new()),
            last_keep_alive_sent: Cell::new(None),
            next_seq: Cell::new(0),
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Controller records of this node.
    pub fn records(&self) -> &ControllerRecords {
        &self.records
    }

    /// Number of steps waiting for a reply.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Register `name`, controlled by `primaries`.
    pub async fn create_record(
        &self,
        name: &str,
        primaries: &NodeSet,
        now: Duration,
    ) -> Result<(), ReconfigError> {
        self.records.create(name, primaries.clone()).await?;
        self.consensus
            .start(&GroupId::for_controllers(name), primaries)?;
        self.keep_alive.borrow_mut().watch(
            name,
            GroupId::for_actives(name, Version::INITIAL),
            now,
        );
        info!(node = %self.id, name = %name, primaries = ?primaries, "controller record created");
        Ok(())
    }

    /// Count a replica-selection vote sent by a name server.
    pub async fn record_vote(
        &self,
        name: &str,
        node: NodeId,
        vote: u32,
        update: bool,
    ) -> Result<(), ReconfigError> {
        Ok(self.records.add_vote(name, node, vote, update).await?)
    }

    /// Store the load reported by a name server.
    pub async fn record_stats(
        &self,
        name: &str,
        node: NodeId,
        read: u64,
        write: u64,
    ) -> Result<(), ReconfigError> {
        Ok(self.records.add_stats(name, node, read, write).await?)
    }

    /// Propose `new_actives` as the next generation of `name` to the
    /// controller group.
    pub async fn propose_new_actives(
        &self,
        name: &str,
        new_actives: NodeSet,
    ) -> Result<Transition, ReconfigError> {
        let record = self.records.get(name).await?;
        if record.marked_for_removal != RemovalMark::Unmarked {
            return Ok(Transition::NotApplied(SkipReason::MarkedForRemoval));
        }
        if !record.active_running {
            debug!(node = %self.id, name = %name, "proposal skipped, change in progress");
            return Ok(Transition::NotApplied(SkipReason::InProgress));
        }
        let proposal = NewActiveProposal {
            name: name.to_string(),
            request_id: self.next_request(),
            proposer: self.id,
            new_actives,
            version: record.active_version.next(),
        };
        info!(
            node = %self.id,
            name = %name,
            version = %proposal.version,
            new_actives = ?proposal.new_actives,
            "proposing new actives"
        );
        self.consensus.propose(
            &GroupId::for_controllers(name),
            ReconfigPacket::NewActivePropose(proposal),
        )?;
        Ok(Transition::Applied)
    }

    /// Periodic placement decision: close the load window of `name` and
    /// propose a new active set if the selection policy asks for one.
    ///
    /// Only the lowest-id controller of a name runs the policy.
    pub async fn compute_new_actives(&self, name: &str) -> Result<Transition, ReconfigError> {
        let record = self.records.get(name).await?;
        if record.primary_replicas.iter().next() != Some(&self.id) {
            return Ok(Transition::NotApplied(SkipReason::NotMember));
        }
        if record.marked_for_removal != RemovalMark::Unmarked {
            return Ok(Transition::NotApplied(SkipReason::MarkedForRemoval));
        }
        if !record.active_running {
            return Ok(Transition::NotApplied(SkipReason::InProgress));
        }
        self.records
            .recompute_average_read_write_rate(name, self.config.moving_average_window)
            .await?;
        let record = self.records.get(name).await?;
        match selection::compute_new_actives(&record, &self.config, &self.nodes) {
            Some(new_actives) => self.propose_new_actives(name, new_actives).await,
            None => Ok(Transition::NotApplied(SkipReason::Unchanged)),
        }
    }

    /// Execute a decided new-actives proposal: `STEADY(v)` → `STOPPING`.
    ///
    /// Runs on every controller of the name. The proposer then starts
    /// stopping the old group.
    pub async fn execute_new_actives_proposed(
        &self,
        proposal: &NewActiveProposal,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        let name = proposal.name.as_str();
        let transition = self
            .records
            .begin_group_change(name, &proposal.new_actives, proposal.version)
            .await?;
        if let Transition::NotApplied(reason) = transition {
            debug!(node = %self.id, name = %name, version = %proposal.version, %reason, "proposal not applied");
            return Ok(transition);
        }
        info!(node = %self.id, name = %name, version = %proposal.version, "group change started");
        self.keep_alive.borrow_mut().unwatch(name);

        if proposal.proposer == self.id {
            let record = self.records.get(name).await?;
            self.arm_stop(&record, now)?;
        }
        Ok(transition)
    }

    /// The old group stopped: start the new group.
    pub async fn handle_stop_confirm(
        &self,
        stop: &StopRequest,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        let name = stop.name.as_str();
        if !self.take_task(name, Step::Stop, stop.request_id) {
            debug!(node = %self.id, name = %name, request = %stop.request_id, "stop confirm received previously or excessively delayed");
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        let record = self.records.get(name).await?;
        if record.active_running
            || record.old_active_version != stop.version
            || record.active_version != stop.version.next()
        {
            warn!(node = %self.id, name = %name, version = %stop.version, "stop confirm does not match record");
            return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                current: record.active_version,
                requested: stop.version.next(),
            }));
        }
        info!(node = %self.id, name = %name, version = %stop.version, "old actives stopped");
        self.arm_start(&record, now)?;
        Ok(Transition::Applied)
    }

    /// A majority of the new group started: drop old state and commit.
    pub async fn handle_start_confirm(
        &self,
        startup: &StartupRequest,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        let name = startup.name.as_str();
        if !self.take_task(name, Step::Start, startup.request_id) {
            debug!(node = %self.id, name = %name, request = %startup.request_id, "start confirm received previously or excessively delayed");
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        let record = self.records.get(name).await?;
        if record.active_version != startup.new_version {
            warn!(node = %self.id, name = %name, version = %startup.new_version, "start confirm does not match record");
            return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                current: record.active_version,
                requested: startup.new_version,
            }));
        }
        info!(node = %self.id, name = %name, version = %startup.new_version, "new actives started");

        for old in &record.old_active_replicas {
            let delete = StopRequest {
                name: name.to_string(),
                request_id: startup.request_id,
                primary_sender: self.id,
                active_receiver: *old,
                version: record.old_active_version,
            };
            self.send(*old, &ReconfigPacket::DeleteOldActiveState(delete));
        }

        let change = GroupChange {
            name: name.to_string(),
            request_id: self.next_request(),
            proposer: self.id,
            version: record.active_version,
        };
        self.arm(Task {
            name: name.to_string(),
            pending: Pending::Commit(change),
            targets: Vec::new(),
            attempt: 0,
            next_retry: now + self.config.retry_timeout,
        })?;
        Ok(Transition::Applied)
    }

    /// Execute a decided completion: `TRANSFERRING` → `STEADY(v+1)`.
    pub async fn execute_group_change_complete(
        &self,
        change: &GroupChange,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        let name = change.name.as_str();
        let transition = self
            .records
            .set_active_running(name, change.version)
            .await?;
        if change.proposer == self.id
            && transition != Transition::NotApplied(SkipReason::ConditionFailed)
        {
            self.take_task(name, Step::Commit, change.request_id);
        }
        match transition {
            Transition::Applied => {
                info!(node = %self.id, name = %name, version = %change.version, "group change complete");
                self.keep_alive.borrow_mut().watch(
                    name,
                    GroupId::for_actives(name, change.version),
                    now,
                );
            }
            Transition::NotApplied(reason) => {
                debug!(node = %self.id, name = %name, version = %change.version, %reason, "completion not applied");
            }
        }
        Ok(transition)
    }

    /// Propose removal of `name` to the controller group.
    pub async fn request_removal(&self, name: &str) -> Result<Transition, ReconfigError> {
        let record = self.records.get(name).await?;
        if record.marked_for_removal != RemovalMark::Unmarked {
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        if !record.active_running {
            return Ok(Transition::NotApplied(SkipReason::InProgress));
        }
        let removal = RemovalRequest {
            name: name.to_string(),
            request_id: self.next_request(),
            primary_sender: self.id,
            active_receiver: self.id,
            version: record.active_version,
        };
        info!(node = %self.id, name = %name, "proposing removal");
        self.consensus.propose(
            &GroupId::for_controllers(name),
            ReconfigPacket::RemoveRecord(removal),
        )?;
        Ok(Transition::Applied)
    }

    /// Execute a decided removal: mark the record, and on the proposer ask
    /// the active group to drop the name.
    pub async fn execute_mark_for_removal(
        &self,
        removal: &RemovalRequest,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        let name = removal.name.as_str();
        let transition = self.records.mark_for_removal(name).await?;
        if let Transition::NotApplied(reason) = transition {
            debug!(node = %self.id, name = %name, %reason, "removal not applied");
            return Ok(transition);
        }
        info!(node = %self.id, name = %name, "marked for removal");
        self.keep_alive.borrow_mut().unwatch(name);
        if removal.primary_sender == self.id {
            let record = self.records.get(name).await?;
            self.arm_remove_actives(&record, removal.request_id, now)?;
        }
        Ok(transition)
    }

    /// The active group dropped the name: propose deleting the controller
    /// record.
    pub async fn handle_active_remove_confirm(
        &self,
        removal: &RemovalRequest,
    ) -> Result<Transition, ReconfigError> {
        let name = removal.name.as_str();
        if !self.take_task(name, Step::RemoveActives, removal.request_id) {
            debug!(node = %self.id, name = %name, "active remove confirm received previously or excessively delayed");
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }
        info!(node = %self.id, name = %name, "actives removed");
        self.consensus.propose(
            &GroupId::for_controllers(name),
            removal.clone().into_controller_remove(),
        )?;
        Ok(Transition::Applied)
    }

    /// Execute a decided controller-record deletion.
    pub async fn execute_controller_remove(
        &self,
        removal: &RemovalRequest,
    ) -> Result<Transition, ReconfigError> {
        let name = removal.name.as_str();
        match self.records.mark_actives_removed(name).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        let transition = self.records.remove(name).await?;
        match transition {
            Transition::Applied => info!(node = %self.id, name = %name, "controller record removed"),
            Transition::NotApplied(reason) => {
                debug!(node = %self.id, name = %name, %reason, "controller remove not applied")
            }
        }
        Ok(transition)
    }

    /// Record a keep-alive from an active group.
    ///
    /// Returns `false` for keep-alives from a group that is not the current
    /// running generation.
    pub async fn handle_keep_alive(
        &self,
        keep_alive: &KeepAlive,
        now: Duration,
    ) -> Result<bool, ReconfigError> {
        let accepted =
            self.keep_alive
                .borrow_mut()
                .record(&keep_alive.name, &keep_alive.group_id, now);
        if !accepted {
            debug!(node = %self.id, name = %keep_alive.name, group = %keep_alive.group_id, "stale keep-alive discarded");
            return Ok(false);
        }
        self.records
            .set_keep_alive(&keep_alive.name, now.as_millis() as u64)
            .await?;
        Ok(true)
    }

    /// Resend unconfirmed steps, send keep-alives and report silent names.
    ///
    /// A change whose step ran out of retries is re-armed from its record
    /// on the following tick, as [`recover`](Self::recover) would.
    pub async fn tick(&self, now: Duration) -> Result<TickReport, ReconfigError> {
        let mut report = TickReport::default();
        let stalled = std::mem::take(&mut *self.stalled.borrow_mut());
        for name in stalled {
            let record = match self.records.get(&name).await {
                Ok(record) => record,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            if record.active_running
                || !record.primary_replicas.contains(&self.id)
                || self.has_task(&name)
            {
                continue;
            }
            self.rearm(&record, now)?;
            info!(node = %self.id, name = %name, version = %record.active_version, "re-armed stalled change");
            report.rearmed += 1;
        }

        let mut due = Vec::new();
        {
            let mut tasks = self.tasks.borrow_mut();
            let max_retries = self.config.max_retries;
            let timeout = self.config.retry_timeout;
            tasks.retain(|_, task| {
                if task.next_retry > now {
                    return true;
                }
                if task.attempt >= max_retries {
                    warn!(node = %self.id, name = %task.name, step = ?task.pending.step(), "retries exhausted, abandoning");
                    report.abandoned.push(task.name.clone());
                    self.stalled.borrow_mut().insert(task.name.clone());
                    return false;
                }
                task.attempt += 1;
                task.next_retry = now + timeout;
                due.push(task.clone());
                true
            });
        }
        for task in &due {
            debug!(node = %self.id, name = %task.name, step = ?task.pending.step(), attempt = task.attempt, "retrying");
            self.transmit(task);
            report.retried += 1;
        }

        let interval = self.config.keep_alive.interval;
        let keep_alive_due = match self.last_keep_alive_sent.get() {
            Some(last) => now.saturating_sub(last) >= interval,
            None => true,
        };
        if keep_alive_due {
            self.last_keep_alive_sent.set(Some(now));
            self.send_keep_alives().await?;
        }

        let mut tracker = self.keep_alive.borrow_mut();
        for name in tracker.timed_out(now) {
            warn!(node = %self.id, name = %name, "active group silent");
            if let Some(group) = tracker.watched_group(&name).cloned() {
                tracker.watch(&name, group, now);
            }
            report.suspected.push(name);
        }
        Ok(report)
    }

    /// Rebuild in-memory state from the records after a restart.
    ///
    /// Returns the number of re-armed steps.
    pub async fn recover(&self, now: Duration) -> Result<usize, ReconfigError> {
        let mut rearmed = 0;
        for record in self.records.scan().await? {
            if !record.primary_replicas.contains(&self.id) {
                continue;
            }
            if record.active_running {
                self.keep_alive
                    .borrow_mut()
                    .watch(&record.name, record.active_group(), now);
                continue;
            }
            self.rearm(&record, now)?;
            info!(node = %self.id, name = %record.name, version = %record.active_version, "re-armed unfinished change");
            rearmed += 1;
        }
        Ok(rearmed)
    }

    /// Arm the first unfinished step of a name that is not running.
    fn rearm(&self, record: &ControllerRecord, now: Duration) -> Result<(), ReconfigError> {
        match record.marked_for_removal {
            RemovalMark::Unmarked => self.arm_stop(record, now),
            RemovalMark::Marked => {
                let request_id = self.next_request();
                self.arm_remove_actives(record, request_id, now)
            }
            RemovalMark::ActivesRemoved => {
                let removal = RemovalRequest {
                    name: record.name.clone(),
                    request_id: self.next_request(),
                    primary_sender: self.id,
                    active_receiver: self.id,
                    version: record.active_version,
                };
                self.consensus.propose(
                    &GroupId::for_controllers(&record.name),
                    removal.into_controller_remove(),
                )?;
                Ok(())
            }
        }
    }

    fn arm_stop(&self, record: &ControllerRecord, now: Duration) -> Result<(), ReconfigError> {
        let stop = StopRequest {
            name: record.name.clone(),
            request_id: self.next_request(),
            primary_sender: self.id,
            active_receiver: self.id,
            version: record.old_active_version,
        };
        self.arm(Task {
            name: record.name.clone(),
            pending: Pending::Stop(stop),
            targets: record.old_active_replicas.iter().copied().collect(),
            attempt: 0,
            next_retry: now + self.config.retry_timeout,
        })
    }

    fn arm_start(&self, record: &ControllerRecord, now: Duration) -> Result<(), ReconfigError> {
        let targets: Vec<NodeId> = record.active_replicas.iter().copied().collect();
        let startup = StartupRequest::new(
            &record.name,
            self.next_request(),
            self.id,
            targets.first().copied().unwrap_or(self.id),
            record.active_replicas.clone(),
            record.old_active_replicas.clone(),
            record.old_active_version,
            record.active_version,
        );
        self.arm(Task {
            name: record.name.clone(),
            pending: Pending::Start(startup),
            targets,
            attempt: 0,
            next_retry: now + self.config.retry_timeout,
        })
    }

    fn arm_remove_actives(
        &self,
        record: &ControllerRecord,
        request_id: RequestId,
        now: Duration,
    ) -> Result<(), ReconfigError> {
        let removal = RemovalRequest {
            name: record.name.clone(),
            request_id,
            primary_sender: self.id,
            active_receiver: self.id,
            version: record.active_version,
        };
        self.arm(Task {
            name: record.name.clone(),
            pending: Pending::RemoveActives(removal),
            targets: record.active_replicas.iter().copied().collect(),
            attempt: 0,
            next_retry: now + self.config.retry_timeout,
        })
    }

    /// Register `task` and send its first attempt.
    fn arm(&self, task: Task) -> Result<(), ReconfigError> {
        if let Pending::Commit(change) = &task.pending {
            self.consensus.propose(
                &GroupId::for_controllers(&task.name),
                ReconfigPacket::GroupChangeComplete(change.clone()),
            )?;
        } else {
            self.transmit(&task);
        }
        let key = (task.name.clone(), task.pending.step());
        self.tasks.borrow_mut().insert(key, task);
        Ok(())
    }

    fn has_task(&self, name: &str) -> bool {
        self.tasks.borrow().keys().any(|(task_name, _)| task_name == name)
    }

    /// Remove the task for `(name, step)` if it carries `request_id`.
    fn take_task(&self, name: &str, step: Step, request_id: RequestId) -> bool {
        let mut tasks = self.tasks.borrow_mut();
        let key = (name.to_string(), step);
        match tasks.get(&key) {
            Some(task) if task.pending.request_id() == request_id => {
                tasks.remove(&key);
                true
            }
            _ => false,
        }
    }

    fn transmit(&self, task: &Task) {
        match &task.pending {
            Pending::Stop(stop) => {
                if let Some(target) = task.target() {
                    self.send(target, &ReconfigPacket::OldActiveStop(stop.redirect(target)));
                }
            }
            Pending::Start(startup) => {
                if let Some(target) = task.target() {
                    self.send(
                        target,
                        &ReconfigPacket::NewActiveStart(startup.redirect(target)),
                    );
                }
            }
            Pending::RemoveActives(removal) => {
                if let Some(target) = task.target() {
                    self.send(target, &removal.to_active(target));
                }
            }
            Pending::Commit(change) => {
                if let Err(err) = self.consensus.propose(
                    &GroupId::for_controllers(&task.name),
                    ReconfigPacket::GroupChangeComplete(change.clone()),
                ) {
                    warn!(node = %self.id, name = %task.name, error = %err, "commit proposal failed");
                }
            }
        }
    }

    async fn send_keep_alives(&self) -> Result<(), ReconfigError> {
        let owned = self
            .records
            .scan()
            .await?
            .into_iter()
            .filter(|r| r.active_running && r.primary_replicas.iter().next() == Some(&self.id));
        for record in owned {
            let packet = ReconfigPacket::KeepAlive(KeepAlive {
                name: record.name.clone(),
                group_id: GroupId::for_controllers(&record.name),
                sender: self.id,
                role: Role::Controller,
            });
            for active in &record.active_replicas {
                self.send(*active, &packet);
            }
        }
        Ok(())
    }

    fn send(&self, to: NodeId, packet: &ReconfigPacket) {
        if let Err(err) = self.sink.send(to, packet) {
            warn!(node = %self.id, to = %to, packet = %packet, error = %err, "send failed");
        }
    }

    fn next_request(&self) -> RequestId {
        let seq = self.next_seq.get();
        self.next_seq.set(seq.wrapping_add(1));
        RequestId::compose(self.id, seq)
    }
}
