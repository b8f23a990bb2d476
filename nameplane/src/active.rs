//! Active replica: the side of a name server that serves a generation.
//!
//! Stopping a generation goes through the group's own consensus, so every
//! member retires the same values at the same point of its decision log.
//! Starting a generation is coordinated by the new member that received
//! the start from the controller: it forwards the start to its peers, each
//! member fetches the retired values from an old member, and the
//! coordinator confirms once a majority answered.
//!
//! ```text
//! handle_stop ──> [group consensus, stop] ──> execute_stop_decision
//!                                             (retire values; receiver confirms)
//! handle_start (coordinator) ──forward──> handle_start_forward (peers)
//!      └──────────────┬──────────────────────────┘
//!                 start_copy ──PrevValueRequest──> old member
//!      handle_prev_value_response: install, start group, respond
//! handle_start_response (coordinator): majority ──> confirm to controller
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ReconfigConfig;
use crate::consensus::GroupConsensus;
use crate::error::{ConsensusError, ReconfigError, StoreError};
use crate::hashing::ReplicaControllerSet;
use crate::heartbeat::KeepAliveTracker;
use crate::node::{Collaborators, TickReport};
use crate::packet::{KeepAlive, ReconfigPacket, RemovalRequest, Role, StartupRequest, StopRequest};
use crate::record::{NameRecord, NameRecords, SkipReason, Transition};
use crate::store::RecordStore;
use crate::transport::PacketSink;
use crate::types::{GroupId, NodeId, ValuesMap, Version};

#[derive(Debug)]
struct StartProgress {
    request: StartupRequest,
    responded: BTreeSet<NodeId>,
    confirmed: bool,
}

#[derive(Debug, Clone)]
struct CopyTask {
    request: StartupRequest,
    sources: Vec<NodeId>,
    attempt: u32,
    next_retry: Duration,
}

impl CopyTask {
    fn source(&self) -> Option<NodeId> {
        if self.sources.is_empty() {
            return None;
        }
        Some(self.sources[self.attempt as usize % self.sources.len()])
    }
}

/// Active-replica role of a name server.
pub struct ActiveReplica {
    id: NodeId,
    config: ReconfigConfig,
    names: NameRecords,
    controllers: Rc<dyn ReplicaControllerSet>,
    consensus: Rc<dyn GroupConsensus>,
    sink: Rc<dyn PacketSink>,
    starts: RefCell<BTreeMap<(String, Version), StartProgress>>,
    copies: RefCell<BTreeMap<(String, Version), CopyTask>>,
    keep_alive: RefCell<KeepAliveTracker>,
    last_keep_alive_sent: Cell<Option<Duration>>,
}

impl ActiveReplica {
    /// Create the active role of node `id` over `store`.
    pub fn new(
        id: NodeId,
        config: ReconfigConfig,
        collaborators: &Collaborators,
        store: Rc<dyn RecordStore<NameRecord>>,
    ) -> Self {
        Self {
            id,
            keep_alive: RefCell::new(KeepAliveTracker::new(config.keep_alive.clone())),
            config,
            names: NameRecords::new(store),
            controllers: collaborators.controllers.clone(),
            consensus: collaborators.consensus.clone(),
            sink: collaborators.sink.clone(),
            starts: RefCell::new(BTreeMap::new()),
            copies: RefCell::new(BTreeMap::new()),
            last_keep_alive_sent: Cell::new(None),
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Name records of this node.
    pub fn records(&self) -> &NameRecords {
        &self.names
    }

    /// Number of value copies in flight.
    pub fn pending_copies(&self) -> usize {
        self.copies.borrow().len()
    }

    /// Serve a freshly registered name as a member of the first generation.
    pub async fn create_record(
        &self,
        name: &str,
        values: ValuesMap,
        ttl: u32,
        now: Duration,
    ) -> Result<(), ReconfigError> {
        let primaries = self.controllers.controllers_for(name);
        self.names
            .create(NameRecord::new(name, primaries.clone(), values, ttl))
            .await?;
        self.consensus
            .start(&GroupId::for_actives(name, Version::INITIAL), &primaries)?;
        self.keep_alive
            .borrow_mut()
            .watch(name, GroupId::for_controllers(name), now);
        info!(node = %self.id, name = %name, "name record created");
        Ok(())
    }

    /// Serve a lookup.
    pub async fn lookup(&self, name: &str) -> Result<ValuesMap, ReconfigError> {
        let record = self.names.get(name).await?;
        if record.active_version.is_zero() {
            return Err(ReconfigError::StaleGroupReference {
                name: name.to_string(),
                version: record.old_active_version,
            });
        }
        self.names.record_lookup(name).await?;
        Ok(record.values)
    }

    /// Apply a client update written by generation `version`.
    pub async fn update_values(
        &self,
        name: &str,
        version: Version,
        values: ValuesMap,
    ) -> Result<Transition, ReconfigError> {
        let transition = self.names.update_values(name, version, values).await?;
        if let Transition::NotApplied(reason) = transition {
            debug!(node = %self.id, name = %name, version = %version, %reason, "update rejected");
        }
        Ok(transition)
    }

    /// Stop request from a controller.
    pub async fn handle_stop(&self, stop: &StopRequest) -> Result<Transition, ReconfigError> {
        let name = stop.name.as_str();
        let record = match self.names.get(name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Err(ReconfigError::StaleGroupReference {
                    name: name.to_string(),
                    version: stop.version,
                })
            }
            Err(err) => return Err(err.into()),
        };

        if record.active_version == stop.version {
            let group = GroupId::for_actives(name, stop.version);
            return match self
                .consensus
                .stop(&group, ReconfigPacket::OldActiveStop(stop.clone()))
            {
                Ok(()) => {
                    debug!(node = %self.id, name = %name, group = %group, "stop proposed");
                    Ok(Transition::Applied)
                }
                Err(ConsensusError::GroupStopped(_)) => {
                    debug!(node = %self.id, name = %name, group = %group, "stop already decided");
                    Ok(Transition::NotApplied(SkipReason::Duplicate))
                }
                Err(err) => Err(err.into()),
            };
        }

        let already_stopped = record.active_version > stop.version
            || record.old_active_version >= stop.version
            || record.active_version.is_zero();
        if already_stopped {
            debug!(node = %self.id, name = %name, version = %stop.version, "generation already stopped, confirming");
            self.send(stop.primary_sender, &stop.clone().into_confirm());
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        }

        warn!(node = %self.id, name = %name, version = %stop.version, current = %record.active_version, "stop for unknown generation");
        Ok(Transition::NotApplied(SkipReason::StaleVersion {
            current: record.active_version,
            requested: stop.version,
        }))
    }

    /// Execute a decided stop: retire the generation's values.
    ///
    /// Runs on every member of the stopped group; the member the controller
    /// addressed sends the confirmation.
    pub async fn execute_stop_decision(
        &self,
        stop: &StopRequest,
    ) -> Result<Transition, ReconfigError> {
        let name = stop.name.as_str();
        let transition = self.names.retire_active(name, stop.version).await?;
        match transition {
            Transition::Applied => {
                info!(node = %self.id, name = %name, version = %stop.version, "generation retired");
                self.keep_alive.borrow_mut().unwatch(name);
            }
            Transition::NotApplied(reason) => {
                debug!(node = %self.id, name = %name, version = %stop.version, %reason, "retire not applied");
            }
        }
        if stop.active_receiver == self.id
            && matches!(
                transition,
                Transition::Applied | Transition::NotApplied(SkipReason::Duplicate)
            )
        {
            self.send(stop.primary_sender, &stop.clone().into_confirm());
        }
        Ok(transition)
    }

    /// Answer a new member asking for the values retired from
    /// `old_version`.
    pub async fn handle_prev_value_request(
        &self,
        request: &StartupRequest,
    ) -> Result<(), ReconfigError> {
        let retired = match self.names.get(&request.name).await {
            Ok(record) => {
                if let Some(values) = record.old_values_on_version_match(request.old_version) {
                    Some((values.clone(), record.time_to_live))
                } else if record.active_version == request.new_version {
                    Some((record.values.clone(), record.time_to_live))
                } else {
                    None
                }
            }
            Err(StoreError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        debug!(
            node = %self.id,
            name = %request.name,
            old_version = %request.old_version,
            to = %request.sender,
            found = retired.is_some(),
            "previous value requested"
        );
        self.send(
            request.sender,
            &request.clone().into_prev_value_response(self.id, retired),
        );
        Ok(())
    }

    /// Start request from the controller; this node coordinates the start.
    pub async fn handle_start(
        &self,
        startup: &StartupRequest,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        if !startup.new_actives.contains(&self.id) {
            warn!(node = %self.id, name = %startup.name, "start for a group this node is not in");
            return Ok(Transition::NotApplied(SkipReason::NotMember));
        }
        let key = (startup.name.clone(), startup.new_version);
        {
            let mut starts = self.starts.borrow_mut();
            if let Some(progress) = starts.get_mut(&key) {
                progress.request = startup.clone();
                if progress.confirmed {
                    debug!(node = %self.id, name = %startup.name, "start already confirmed, resending");
                    self.send(startup.primary_sender, &startup.clone().into_confirm());
                    return Ok(Transition::NotApplied(SkipReason::Duplicate));
                }
            } else {
                starts.insert(
                    key,
                    StartProgress {
                        request: startup.clone(),
                        responded: BTreeSet::new(),
                        confirmed: false,
                    },
                );
            }
        }
        info!(node = %self.id, name = %startup.name, version = %startup.new_version, "coordinating start");
        let forward = startup.forward();
        for peer in startup.new_actives.iter().filter(|n| **n != self.id) {
            self.send(*peer, &forward);
        }
        self.start_copy(startup, now).await
    }

    /// Start forwarded by the coordinator.
    pub async fn handle_start_forward(
        &self,
        startup: &StartupRequest,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        if !startup.new_actives.contains(&self.id) {
            return Ok(Transition::NotApplied(SkipReason::NotMember));
        }
        self.start_copy(startup, now).await
    }

    async fn start_copy(
        &self,
        startup: &StartupRequest,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        let name = startup.name.as_str();
        match self.names.get(name).await {
            Ok(record) if record.active_version == startup.new_version => {
                self.send(startup.coordinator, &startup.clone().into_response(self.id));
                return Ok(Transition::NotApplied(SkipReason::Duplicate));
            }
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let key = (name.to_string(), startup.new_version);
        let mut copies = self.copies.borrow_mut();
        if let Some(task) = copies.get_mut(&key) {
            task.request = startup.clone();
            return Ok(Transition::NotApplied(SkipReason::InProgress));
        }
        let mut sources: Vec<NodeId> = startup.old_actives.iter().copied().collect();
        sources.extend(
            startup
                .new_actives
                .iter()
                .filter(|n| **n != self.id && !startup.old_actives.contains(n)),
        );
        let task = CopyTask {
            request: startup.clone(),
            sources,
            attempt: 0,
            next_retry: now + self.config.retry_timeout,
        };
        if let Some(source) = task.source() {
            self.send(source, &startup.prev_value_request(self.id));
        }
        copies.insert(key, task);
        Ok(Transition::Applied)
    }

    /// Retired values arrived: install the new generation.
    pub async fn handle_prev_value_response(
        &self,
        response: &StartupRequest,
        now: Duration,
    ) -> Result<Transition, ReconfigError> {
        let name = response.name.as_str();
        let key = (name.to_string(), response.new_version);
        let Some(task) = self.copies.borrow().get(&key).cloned() else {
            debug!(node = %self.id, name = %name, from = %response.sender, "previous value no longer needed");
            return Ok(Transition::NotApplied(SkipReason::Duplicate));
        };
        let Some(values) = response
            .previous_value
            .clone()
            .filter(|_| response.previous_value_correct)
        else {
            debug!(node = %self.id, name = %name, from = %response.sender, "source does not hold previous value");
            return Ok(Transition::NotApplied(SkipReason::Unchanged));
        };

        let primaries = self.controllers.controllers_for(name);
        let transition = self
            .names
            .install_generation(name, &primaries, response.new_version, values, response.ttl)
            .await?;
        match transition {
            Transition::Applied | Transition::NotApplied(SkipReason::Duplicate) => {}
            Transition::NotApplied(reason) => {
                debug!(node = %self.id, name = %name, version = %response.new_version, %reason, "install deferred");
                return Ok(transition);
            }
        }

        self.consensus
            .start(&response.new_group(), &response.new_actives)?;
        self.copies.borrow_mut().remove(&key);
        self.keep_alive
            .borrow_mut()
            .watch(name, GroupId::for_controllers(name), now);
        info!(node = %self.id, name = %name, version = %response.new_version, from = %response.sender, "generation installed");
        self.send(
            task.request.coordinator,
            &task.request.clone().into_response(self.id),
        );
        Ok(transition)
    }

    /// A new member reports it started. Confirms to the controller once a
    /// majority of the new group responded.
    pub fn handle_start_response(&self, response: &StartupRequest) -> Transition {
        let key = (response.name.clone(), response.new_version);
        let mut starts = self.starts.borrow_mut();
        let Some(progress) = starts.get_mut(&key) else {
            debug!(node = %self.id, name = %response.name, from = %response.sender, "start response without coordination");
            return Transition::NotApplied(SkipReason::Duplicate);
        };
        progress.responded.insert(response.sender);
        if progress.confirmed {
            return Transition::NotApplied(SkipReason::Duplicate);
        }
        let majority = response.new_actives.len() / 2 + 1;
        if progress.responded.len() < majority {
            return Transition::NotApplied(SkipReason::InProgress);
        }
        progress.confirmed = true;
        info!(
            node = %self.id,
            name = %response.name,
            version = %response.new_version,
            responded = progress.responded.len(),
            "new group started"
        );
        self.send(
            progress.request.primary_sender,
            &progress.request.clone().into_confirm(),
        );
        Transition::Applied
    }

    /// Drop the values retired from `delete.version`.
    pub async fn handle_delete_old_state(
        &self,
        delete: &StopRequest,
    ) -> Result<Transition, ReconfigError> {
        let name = delete.name.as_str();
        self.starts
            .borrow_mut()
            .retain(|(n, v), _| n != name || *v > delete.version.next());
        let transition = match self.names.delete_old_state(name, delete.version).await {
            Ok(transition) => transition,
            Err(StoreError::NotFound(_)) => Transition::NotApplied(SkipReason::Duplicate),
            Err(err) => return Err(err.into()),
        };
        if transition.is_applied() {
            info!(node = %self.id, name = %name, version = %delete.version, "old state deleted");
        }
        Ok(transition)
    }

    /// Removal request from a controller.
    pub async fn handle_active_remove(
        &self,
        removal: &RemovalRequest,
    ) -> Result<Transition, ReconfigError> {
        let name = removal.name.as_str();
        let record = match self.names.get(name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                debug!(node = %self.id, name = %name, "already removed, confirming");
                self.send(removal.primary_sender, &removal.clone().into_confirm());
                return Ok(Transition::NotApplied(SkipReason::Duplicate));
            }
            Err(err) => return Err(err.into()),
        };
        if record.active_version != removal.version {
            return Ok(Transition::NotApplied(SkipReason::StaleVersion {
                current: record.active_version,
                requested: removal.version,
            }));
        }
        let group = GroupId::for_actives(name, removal.version);
        match self
            .consensus
            .stop(&group, ReconfigPacket::ActiveRemove(removal.clone()))
        {
            Ok(()) => Ok(Transition::Applied),
            Err(ConsensusError::GroupStopped(_)) => {
                debug!(node = %self.id, name = %name, group = %group, "removal already decided");
                Ok(Transition::NotApplied(SkipReason::Duplicate))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Execute a decided removal: drop the record.
    pub async fn execute_active_remove(
        &self,
        removal: &RemovalRequest,
    ) -> Result<Transition, ReconfigError> {
        let name = removal.name.as_str();
        let transition = self.names.remove_generation(name, removal.version).await?;
        if transition.is_applied() {
            info!(node = %self.id, name = %name, "name record removed");
            self.keep_alive.borrow_mut().unwatch(name);
        }
        if removal.active_receiver == self.id {
            self.send(removal.primary_sender, &removal.clone().into_confirm());
        }
        Ok(transition)
    }

    /// Record a keep-alive from the controllers.
    pub fn handle_keep_alive(&self, keep_alive: &KeepAlive, now: Duration) -> bool {
        let accepted =
            self.keep_alive
                .borrow_mut()
                .record(&keep_alive.name, &keep_alive.group_id, now);
        if !accepted {
            debug!(node = %self.id, name = %keep_alive.name, group = %keep_alive.group_id, "unexpected keep-alive discarded");
        }
        accepted
    }

    /// Retry value copies, send keep-alives and report silent controllers.
    pub async fn tick(&self, now: Duration) -> Result<TickReport, ReconfigError> {
        let mut report = TickReport::default();
        let mut due = Vec::new();
        {
            let mut copies = self.copies.borrow_mut();
            let max_retries = self.config.max_retries;
            let timeout = self.config.retry_timeout;
            copies.retain(|(name, _), task| {
                if task.next_retry > now {
                    return true;
                }
                if task.attempt >= max_retries {
                    warn!(node = %self.id, name = %name, "previous value unavailable, giving up");
                    report.abandoned.push(name.clone());
                    return false;
                }
                task.attempt += 1;
                task.next_retry = now + timeout;
                due.push(task.clone());
                true
            });
        }
        for task in &due {
            if let Some(source) = task.source() {
                debug!(node = %self.id, name = %task.request.name, source = %source, attempt = task.attempt, "retrying previous value request");
                self.send(source, &task.request.prev_value_request(self.id));
                report.retried += 1;
            }
        }

        let keep_alive_due = match self.last_keep_alive_sent.get() {
            Some(last) => now.saturating_sub(last) >= self.config.keep_alive.interval,
            None => true,
        };
        if keep_alive_due {
            self.last_keep_alive_sent.set(Some(now));
            for record in self.names.scan().await? {
                if record.active_version.is_zero() {
                    continue;
                }
                let packet = ReconfigPacket::KeepAlive(KeepAlive {
                    name: record.name.clone(),
                    group_id: GroupId::for_actives(&record.name, record.active_version),
                    sender: self.id,
                    role: Role::Active,
                });
                for primary in &record.primary_replicas {
                    self.send(*primary, &packet);
                }
            }
        }

        let mut tracker = self.keep_alive.borrow_mut();
        for name in tracker.timed_out(now) {
            warn!(node = %self.id, name = %name, "controllers silent");
            tracker.watch(&name, GroupId::for_controllers(&name), now);
            report.suspected.push(name);
        }
        Ok(report)
    }

    /// Rebuild in-memory state from the records after a restart.
    ///
    /// Returns the number of names this node serves.
    pub async fn recover(&self, now: Duration) -> Result<usize, ReconfigError> {
        let records = self.names.scan().await?;
        let mut serving = 0;
        let mut tracker = self.keep_alive.borrow_mut();
        for record in records {
            if record.active_version.is_zero() {
                continue;
            }
            tracker.watch(&record.name, GroupId::for_controllers(&record.name), now);
            serving += 1;
        }
        info!(node = %self.id, serving, "active replica recovered");
        Ok(serving)
    }

    fn send(&self, to: NodeId, packet: &ReconfigPacket) {
        if let Err(err) = self.sink.send(to, packet) {
            warn!(node = %self.id, to = %to, packet = %packet, error = %err, "send failed");
        }
    }
}
