//! Name server: one node running both the controller and the active role.
//!
//! [`NameServer`] is the single entry point for everything a node
//! receives: raw frames from peers, decisions from its consensus groups
//! and timer ticks. It routes each packet type to the role that owns it.

use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::active::ActiveReplica;
use crate::config::{NodeConfig, ReconfigConfig};
use crate::consensus::{Decision, GroupConsensus};
use crate::controller::ReplicaController;
use crate::error::ReconfigError;
use crate::hashing::ReplicaControllerSet;
use crate::packet::{ReconfigPacket, Role};
use crate::record::{ControllerRecord, NameRecord, Transition};
use crate::store::RecordStore;
use crate::transport::PacketSink;
use crate::types::{NodeId, NodeSet, ValuesMap};
use crate::wire;

/// Shared services a name server is wired to.
#[derive(Clone)]
pub struct Collaborators {
    /// Node table.
    pub nodes: Rc<NodeConfig>,
    /// Placement of names on controllers.
    pub controllers: Rc<dyn ReplicaControllerSet>,
    /// Group consensus.
    pub consensus: Rc<dyn GroupConsensus>,
    /// Outgoing packets.
    pub sink: Rc<dyn PacketSink>,
}

/// What a timer tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Requests resent.
    pub retried: usize,
    /// Names whose pending step ran out of retries.
    pub abandoned: Vec<String>,
    /// Abandoned changes re-armed from the records.
    pub rearmed: usize,
    /// Names whose peer group went silent.
    pub suspected: Vec<String>,
}

impl TickReport {
    /// Fold `other` into this report.
    pub fn merge(&mut self, other: TickReport) {
        self.retried += other.retried;
        self.abandoned.extend(other.abandoned);
        self.rearmed += other.rearmed;
        self.suspected.extend(other.suspected);
    }
}

/// A node of the directory.
pub struct NameServer {
    id: NodeId,
    controllers: Rc<dyn ReplicaControllerSet>,
    controller: ReplicaController,
    active: ActiveReplica,
}

impl NameServer {
    /// Wire node `id` to its stores and collaborators.
    pub fn new(
        id: NodeId,
        config: ReconfigConfig,
        collaborators: Collaborators,
        controller_store: Rc<dyn RecordStore<ControllerRecord>>,
        name_store: Rc<dyn RecordStore<NameRecord>>,
    ) -> Self {
        Self {
            id,
            controllers: collaborators.controllers.clone(),
            controller: ReplicaController::new(
                id,
                config.clone(),
                &collaborators,
                controller_store,
            ),
            active: ActiveReplica::new(id, config, &collaborators, name_store),
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Controller role.
    pub fn controller(&self) -> &ReplicaController {
        &self.controller
    }

    /// Active role.
    pub fn active(&self) -> &ActiveReplica {
        &self.active
    }

    /// Controllers of `name`.
    pub fn controllers_for(&self, name: &str) -> NodeSet {
        self.controllers.controllers_for(name)
    }

    /// Register `name` on this node if it is one of the name's controllers.
    ///
    /// Every controller of the name must be registered; together they form
    /// the first active generation. Returns whether this node took part.
    pub async fn register(
        &self,
        name: &str,
        values: ValuesMap,
        ttl: u32,
        now: Duration,
    ) -> Result<bool, ReconfigError> {
        let primaries = self.controllers_for(name);
        if !primaries.contains(&self.id) {
            return Ok(false);
        }
        self.controller.create_record(name, &primaries, now).await?;
        self.active.create_record(name, values, ttl, now).await?;
        Ok(true)
    }

    /// Decode and handle one frame received from the network.
    ///
    /// Malformed frames are logged and dropped.
    pub async fn handle_frame(&self, frame: &[u8], now: Duration) -> Result<(), ReconfigError> {
        let packet = match wire::decode_packet(frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(node = %self.id, error = %err, "malformed frame dropped");
                return Ok(());
            }
        };
        self.handle_packet(packet, now).await
    }

    /// Handle one packet received from a peer.
    pub async fn handle_packet(
        &self,
        packet: ReconfigPacket,
        now: Duration,
    ) -> Result<(), ReconfigError> {
        let result = match &packet {
            ReconfigPacket::OldActiveStop(p) => self.active.handle_stop(p).await.map(drop),
            ReconfigPacket::OldActiveStopConfirm(p) => {
                self.controller.handle_stop_confirm(p, now).await.map(drop)
            }
            ReconfigPacket::DeleteOldActiveState(p) => {
                self.active.handle_delete_old_state(p).await.map(drop)
            }
            ReconfigPacket::NewActiveStart(p) => self.active.handle_start(p, now).await.map(drop),
            ReconfigPacket::NewActiveStartForward(p) => {
                self.active.handle_start_forward(p, now).await.map(drop)
            }
            ReconfigPacket::NewActiveStartResponse(p) => {
                self.active.handle_start_response(p);
                Ok(())
            }
            ReconfigPacket::NewActiveStartConfirm(p) => {
                self.controller.handle_start_confirm(p, now).await.map(drop)
            }
            ReconfigPacket::PrevValueRequest(p) => self.active.handle_prev_value_request(p).await,
            ReconfigPacket::PrevValueResponse(p) => {
                self.active.handle_prev_value_response(p, now).await.map(drop)
            }
            ReconfigPacket::ActiveRemove(p) => self.active.handle_active_remove(p).await.map(drop),
            ReconfigPacket::ActiveRemoveConfirm(p) => {
                self.controller.handle_active_remove_confirm(p).await.map(drop)
            }
            ReconfigPacket::KeepAlive(p) => match p.role {
                Role::Active => self.controller.handle_keep_alive(p, now).await.map(drop),
                Role::Controller => {
                    self.active.handle_keep_alive(p, now);
                    Ok(())
                }
            },
            ReconfigPacket::NewActivePropose(_)
            | ReconfigPacket::GroupChangeComplete(_)
            | ReconfigPacket::RemoveRecord(_)
            | ReconfigPacket::ControllerRemove(_) => {
                warn!(node = %self.id, packet = %packet, "consensus-only packet received directly, dropped");
                Ok(())
            }
        };
        self.discard_stale(&packet, result)
    }

    /// Execute a decision of one of this node's consensus groups.
    pub async fn handle_decision(
        &self,
        decision: &Decision,
        now: Duration,
    ) -> Result<(), ReconfigError> {
        debug!(node = %self.id, group = %decision.group, packet = %decision.packet, "executing decision");
        let result = match &decision.packet {
            ReconfigPacket::NewActivePropose(p) => self
                .controller
                .execute_new_actives_proposed(p, now)
                .await
                .map(drop),
            ReconfigPacket::GroupChangeComplete(p) => self
                .controller
                .execute_group_change_complete(p, now)
                .await
                .map(drop),
            ReconfigPacket::RemoveRecord(p) => self
                .controller
                .execute_mark_for_removal(p, now)
                .await
                .map(drop),
            ReconfigPacket::ControllerRemove(p) => {
                self.controller.execute_controller_remove(p).await.map(drop)
            }
            ReconfigPacket::OldActiveStop(p) => self.active.execute_stop_decision(p).await.map(drop),
            ReconfigPacket::ActiveRemove(p) => self.active.execute_active_remove(p).await.map(drop),
            other => {
                warn!(node = %self.id, packet = %other, "unexpected decision dropped");
                Ok(())
            }
        };
        self.discard_stale(&decision.packet, result)
    }

    /// Propose a new active set for `name` (this node must control it).
    pub async fn propose_new_actives(
        &self,
        name: &str,
        new_actives: NodeSet,
    ) -> Result<Transition, ReconfigError> {
        self.controller.propose_new_actives(name, new_actives).await
    }

    /// Propose removal of `name` (this node must control it).
    pub async fn request_removal(&self, name: &str) -> Result<Transition, ReconfigError> {
        self.controller.request_removal(name).await
    }

    /// Timer tick for both roles.
    pub async fn tick(&self, now: Duration) -> Result<TickReport, ReconfigError> {
        let mut report = self.controller.tick(now).await?;
        report.merge(self.active.tick(now).await?);
        Ok(report)
    }

    /// Rebuild in-memory state after a restart.
    pub async fn recover(&self, now: Duration) -> Result<(), ReconfigError> {
        let rearmed = self.controller.recover(now).await?;
        let serving = self.active.recover(now).await?;
        debug!(node = %self.id, rearmed, serving, "recovered");
        Ok(())
    }

    fn discard_stale(
        &self,
        packet: &ReconfigPacket,
        result: Result<(), ReconfigError>,
    ) -> Result<(), ReconfigError> {
        match result {
            Err(ReconfigError::StaleGroupReference { name, version }) => {
                warn!(node = %self.id, name = %name, version = %version, packet = %packet, "stale group reference, dropped");
                Ok(())
            }
            Err(ReconfigError::RecordNotFound(name)) => {
                warn!(node = %self.id, name = %name, packet = %packet, "no record, dropped");
                Ok(())
            }
            other => other,
        }
    }
}
