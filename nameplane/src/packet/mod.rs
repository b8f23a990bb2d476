//! Reconfiguration packets.
//!
//! Each protocol phase is a distinct [`ReconfigPacket`] variant. Phases that
//! carry the same fields share a payload type, and moving a request to its
//! next phase goes through an explicit conversion on the payload (for
//! example [`StopRequest::into_confirm`]) rather than by mutating a type
//! tag in place.
//!
//! ## Group change
//!
//! ```text
//! Controller (proposer)        Old actives                 New actives
//!   │ NewActivePropose ─> controller consensus
//!   │── OldActiveStop ──────────>│ stop in own group
//!   │<─ OldActiveStopConfirm ────│
//!   │── NewActiveStart ───────────────────────────────────────>│ coordinator
//!   │                            │        NewActiveStartForward │──> peers
//!   │                            │<── PrevValueRequest ─────────│ every member
//!   │                            │─── PrevValueResponse ───────>│
//!   │                            │        NewActiveStartResponse│──> coordinator
//!   │<─ NewActiveStartConfirm ────────────────────────────────── │ majority
//!   │── DeleteOldActiveState ───>│
//!   │ GroupChangeComplete ─> controller consensus
//! ```
//!
//! ## Removal
//!
//! ```text
//! Controller                   Actives
//!   │ RemoveRecord ─> controller consensus (mark)
//!   │── ActiveRemove ───────────>│ stop in own group, drop record
//!   │<─ ActiveRemoveConfirm ─────│
//!   │ ControllerRemove ─> controller consensus (drop record)
//! ```

mod codec;

pub use codec::{decode, encode};

use serde::{Deserialize, Serialize};

use crate::types::{colon_set, GroupId, NodeId, NodeSet, RequestId, ValuesMap, Version};

/// Integer `type` discriminator of every packet on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Removal proposal in the controller group.
    RemoveRecord,
    /// Controller asks the active group to drop the name.
    ActiveRemove,
    /// Active group dropped the name.
    ActiveRemoveConfirm,
    /// Controller record deletion in the controller group.
    ControllerRemove,
    /// New active set proposal in the controller group.
    NewActivePropose,
    /// Controller asks the old group to stop.
    OldActiveStop,
    /// Old group stopped.
    OldActiveStopConfirm,
    /// Controller lets the old group drop retired values.
    DeleteOldActiveState,
    /// Controller asks the new group to start.
    NewActiveStart,
    /// New group coordinator forwards the start to its peers.
    NewActiveStartForward,
    /// A new member started.
    NewActiveStartResponse,
    /// A majority of the new group started.
    NewActiveStartConfirm,
    /// New member asks an old member for the retired values.
    PrevValueRequest,
    /// Old member answers with the retired values.
    PrevValueResponse,
    /// Completion commit in the controller group.
    GroupChangeComplete,
    /// Liveness signal.
    KeepAlive,
}

impl PacketType {
    /// Wire code.
    pub const fn code(self) -> i64 {
        match self {
            Self::RemoveRecord => 10,
            Self::ActiveRemove => 12,
            Self::ActiveRemoveConfirm => 13,
            Self::ControllerRemove => 14,
            Self::NewActivePropose => 100,
            Self::OldActiveStop => 101,
            Self::OldActiveStopConfirm => 102,
            Self::DeleteOldActiveState => 103,
            Self::NewActiveStart => 104,
            Self::NewActiveStartForward => 105,
            Self::NewActiveStartResponse => 106,
            Self::NewActiveStartConfirm => 107,
            Self::PrevValueRequest => 108,
            Self::PrevValueResponse => 109,
            Self::GroupChangeComplete => 110,
            Self::KeepAlive => 130,
        }
    }

    /// Packet type of a wire code.
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            10 => Self::RemoveRecord,
            12 => Self::ActiveRemove,
            13 => Self::ActiveRemoveConfirm,
            14 => Self::ControllerRemove,
            100 => Self::NewActivePropose,
            101 => Self::OldActiveStop,
            102 => Self::OldActiveStopConfirm,
            103 => Self::DeleteOldActiveState,
            104 => Self::NewActiveStart,
            105 => Self::NewActiveStartForward,
            106 => Self::NewActiveStartResponse,
            107 => Self::NewActiveStartConfirm,
            108 => Self::PrevValueRequest,
            109 => Self::PrevValueResponse,
            110 => Self::GroupChangeComplete,
            130 => Self::KeepAlive,
            _ => return None,
        })
    }
}

/// Proposal of a new active set, decided by the controller group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActiveProposal {
    /// Name being reconfigured.
    pub name: String,
    /// Correlation id.
    pub request_id: RequestId,
    /// Controller that proposed and drives the change.
    pub proposer: NodeId,
    /// Node set of the new generation.
    #[serde(with = "colon_set")]
    pub new_actives: NodeSet,
    /// The new generation.
    pub version: Version,
}

/// Stop (and delete-old-state) request addressed to one active group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    /// Name being reconfigured.
    pub name: String,
    /// Correlation id.
    pub request_id: RequestId,
    /// Controller expecting the confirmation.
    pub primary_sender: NodeId,
    /// Group member the request was sent to.
    pub active_receiver: NodeId,
    /// Generation to stop (or whose retired state to delete).
    pub version: Version,
}

impl StopRequest {
    /// Relabel a processed stop as its confirmation to the controller.
    pub fn into_confirm(self) -> ReconfigPacket {
        ReconfigPacket::OldActiveStopConfirm(self)
    }

    /// The same request addressed to another group member.
    pub fn redirect(&self, receiver: NodeId) -> Self {
        Self {
            active_receiver: receiver,
            ..self.clone()
        }
    }
}

/// Start request for the new generation, in all of its phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupRequest {
    /// Name being reconfigured.
    pub name: String,
    /// Correlation id.
    pub request_id: RequestId,
    /// Controller expecting the confirmation.
    pub primary_sender: NodeId,
    /// New member that received the start from the controller and collects
    /// responses.
    pub coordinator: NodeId,
    /// Node that sent this packet.
    pub sender: NodeId,
    /// Node set of the new generation.
    #[serde(with = "colon_set")]
    pub new_actives: NodeSet,
    /// Node set of the retired generation.
    #[serde(with = "colon_set")]
    pub old_actives: NodeSet,
    /// Retired generation.
    pub old_version: Version,
    /// New generation.
    pub new_version: Version,
    /// Retired values, in a previous-value response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<ValuesMap>,
    /// Time to live carried with the retired values.
    #[serde(default)]
    pub ttl: u32,
    /// Whether the responder held the retired values.
    #[serde(default)]
    pub previous_value_correct: bool,
}

impl StartupRequest {
    /// The start as sent by the controller to `coordinator`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        request_id: RequestId,
        primary_sender: NodeId,
        coordinator: NodeId,
        new_actives: NodeSet,
        old_actives: NodeSet,
        old_version: Version,
        new_version: Version,
    ) -> Self {
        Self {
            name: name.to_string(),
            request_id,
            primary_sender,
            coordinator,
            sender: primary_sender,
            new_actives,
            old_actives,
            old_version,
            new_version,
            previous_value: None,
            ttl: 0,
            previous_value_correct: false,
        }
    }

    /// The same start addressed to another coordinator.
    pub fn redirect(&self, coordinator: NodeId) -> Self {
        Self {
            coordinator,
            ..self.clone()
        }
    }

    /// Forward from the coordinator to a peer of the new group.
    pub fn forward(&self) -> ReconfigPacket {
        ReconfigPacket::NewActiveStartForward(Self {
            sender: self.coordinator,
            ..self.clone()
        })
    }

    /// Ask an old member for the retired values.
    pub fn prev_value_request(&self, requester: NodeId) -> ReconfigPacket {
        ReconfigPacket::PrevValueRequest(Self {
            sender: requester,
            previous_value: None,
            previous_value_correct: false,
            ..self.clone()
        })
    }

    /// Answer a previous-value request. `None` means this node does not
    /// hold the retired values of `old_version`.
    pub fn into_prev_value_response(
        self,
        responder: NodeId,
        retired: Option<(ValuesMap, u32)>,
    ) -> ReconfigPacket {
        let correct = retired.is_some();
        let (value, ttl) = match retired {
            Some((value, ttl)) => (Some(value), ttl),
            None => (None, 0),
        };
        ReconfigPacket::PrevValueResponse(Self {
            sender: responder,
            previous_value: value,
            ttl,
            previous_value_correct: correct,
            ..self
        })
    }

    /// Tell the coordinator this member started.
    pub fn into_response(self, member: NodeId) -> ReconfigPacket {
        ReconfigPacket::NewActiveStartResponse(Self {
            sender: member,
            previous_value: None,
            previous_value_correct: false,
            ..self
        })
    }

    /// Relabel as the coordinator's confirmation to the controller.
    pub fn into_confirm(self) -> ReconfigPacket {
        ReconfigPacket::NewActiveStartConfirm(Self {
            sender: self.coordinator,
            previous_value: None,
            previous_value_correct: false,
            ..self
        })
    }

    /// Consensus group of the new generation.
    pub fn new_group(&self) -> GroupId {
        GroupId::for_actives(&self.name, self.new_version)
    }
}

/// Commit of a completed group change, decided by the controller group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChange {
    /// Name being reconfigured.
    pub name: String,
    /// Correlation id.
    pub request_id: RequestId,
    /// Controller driving the change.
    pub proposer: NodeId,
    /// Generation now serving.
    pub version: Version,
}

/// Removal request, in all of its phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalRequest {
    /// Name being removed.
    pub name: String,
    /// Correlation id.
    pub request_id: RequestId,
    /// Controller driving the removal.
    pub primary_sender: NodeId,
    /// Active member the request was sent to.
    pub active_receiver: NodeId,
    /// Generation serving when removal was accepted.
    pub version: Version,
}

impl RemovalRequest {
    /// Ask `receiver` to drop the name in its group.
    pub fn to_active(&self, receiver: NodeId) -> ReconfigPacket {
        ReconfigPacket::ActiveRemove(Self {
            active_receiver: receiver,
            ..self.clone()
        })
    }

    /// Relabel a processed active removal as its confirmation.
    pub fn into_confirm(self) -> ReconfigPacket {
        ReconfigPacket::ActiveRemoveConfirm(self)
    }

    /// Proposal to drop the controller record.
    pub fn into_controller_remove(self) -> ReconfigPacket {
        ReconfigPacket::ControllerRemove(self)
    }
}

/// Role of a keep-alive sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sent by an active replica to the controllers.
    Active,
    /// Sent by a controller to the active group.
    Controller,
}

/// Liveness signal for one name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAlive {
    /// Name served.
    pub name: String,
    /// Group of the sender.
    pub group_id: GroupId,
    /// Sending node.
    pub sender: NodeId,
    /// Role of the sender.
    pub role: Role,
}

/// Every reconfiguration packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconfigPacket {
    /// See [`PacketType::RemoveRecord`].
    RemoveRecord(RemovalRequest),
    /// See [`PacketType::ActiveRemove`].
    ActiveRemove(RemovalRequest),
    /// See [`PacketType::ActiveRemoveConfirm`].
    ActiveRemoveConfirm(RemovalRequest),
    /// See [`PacketType::ControllerRemove`].
    ControllerRemove(RemovalRequest),
    /// See [`PacketType::NewActivePropose`].
    NewActivePropose(NewActiveProposal),
    /// See [`PacketType::OldActiveStop`].
    OldActiveStop(StopRequest),
    /// See [`PacketType::OldActiveStopConfirm`].
    OldActiveStopConfirm(StopRequest),
    /// See [`PacketType::DeleteOldActiveState`].
    DeleteOldActiveState(StopRequest),
    /// See [`PacketType::NewActiveStart`].
    NewActiveStart(StartupRequest),
    /// See [`PacketType::NewActiveStartForward`].
    NewActiveStartForward(StartupRequest),
    /// See [`PacketType::NewActiveStartResponse`].
    NewActiveStartResponse(StartupRequest),
    /// See [`PacketType::NewActiveStartConfirm`].
    NewActiveStartConfirm(StartupRequest),
    /// See [`PacketType::PrevValueRequest`].
    PrevValueRequest(StartupRequest),
    /// See [`PacketType::PrevValueResponse`].
    PrevValueResponse(StartupRequest),
    /// See [`PacketType::GroupChangeComplete`].
    GroupChangeComplete(GroupChange),
    /// See [`PacketType::KeepAlive`].
    KeepAlive(KeepAlive),
}

impl ReconfigPacket {
    /// Wire discriminator of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::RemoveRecord(_) => PacketType::RemoveRecord,
            Self::ActiveRemove(_) => PacketType::ActiveRemove,
            Self::ActiveRemoveConfirm(_) => PacketType::ActiveRemoveConfirm,
            Self::ControllerRemove(_) => PacketType::ControllerRemove,
            Self::NewActivePropose(_) => PacketType::NewActivePropose,
            Self::OldActiveStop(_) => PacketType::OldActiveStop,
            Self::OldActiveStopConfirm(_) => PacketType::OldActiveStopConfirm,
            Self::DeleteOldActiveState(_) => PacketType::DeleteOldActiveState,
            Self::NewActiveStart(_) => PacketType::NewActiveStart,
            Self::NewActiveStartForward(_) => PacketType::NewActiveStartForward,
            Self::NewActiveStartResponse(_) => PacketType::NewActiveStartResponse,
            Self::NewActiveStartConfirm(_) => PacketType::NewActiveStartConfirm,
            Self::PrevValueRequest(_) => PacketType::PrevValueRequest,
            Self::PrevValueResponse(_) => PacketType::PrevValueResponse,
            Self::GroupChangeComplete(_) => PacketType::GroupChangeComplete,
            Self::KeepAlive(_) => PacketType::KeepAlive,
        }
    }

    /// Name the packet is about.
    pub fn name(&self) -> &str {
        match self {
            Self::RemoveRecord(p)
            | Self::ActiveRemove(p)
            | Self::ActiveRemoveConfirm(p)
            | Self::ControllerRemove(p) => &p.name,
            Self::NewActivePropose(p) => &p.name,
            Self::OldActiveStop(p) | Self::OldActiveStopConfirm(p) | Self::DeleteOldActiveState(p) => {
                &p.name
            }
            Self::NewActiveStart(p)
            | Self::NewActiveStartForward(p)
            | Self::NewActiveStartResponse(p)
            | Self::NewActiveStartConfirm(p)
            | Self::PrevValueRequest(p)
            | Self::PrevValueResponse(p) => &p.name,
            Self::GroupChangeComplete(p) => &p.name,
            Self::KeepAlive(p) => &p.name,
        }
    }
}

impl std::fmt::Display for ReconfigPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.packet_type(), self.name())
    }
}
