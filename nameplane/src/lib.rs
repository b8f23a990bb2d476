//! # Nameplane: reconfiguration control plane of a replicated name directory
//!
//! Every registered name is served by a group of *active replicas* and
//! controlled by a fixed group of *replica controllers*. Controllers decide,
//! through their own consensus group, when a name's active set changes.
//! Each change installs a new *generation* of the active group: the old
//! generation is stopped, its last values are copied to the new members,
//! and the controllers mark the new generation as running.
//!
//! ## Model
//!
//! | Concept | Type | Notes |
//! |---|---|---|
//! | Name server | [`NameServer`] | One node; runs both roles |
//! | Controller side | [`ReplicaController`] | Owns [`ControllerRecord`]s |
//! | Active side | [`ActiveReplica`] | Owns [`NameRecord`]s |
//! | Generation | [`Version`] | Strictly increasing per name |
//! | Record store | [`RecordStore`] | Conditional writes are the only concurrency control |
//! | Packets | [`ReconfigPacket`] | Flat JSON with an integer `type`, framed as `<len>:<json>` |
//!
//! ## Lifecycle of a name
//!
//! ```text
//!              register
//!                 │
//!                 ▼
//!   ┌────── STEADY(v) ◄──────────────────────────────┐
//!   │             │ NewActivePropose decided          │
//!   │             ▼                                   │
//!   │       STOPPING(v, v+1) ── old group stops ──┐   │
//!   │                                             ▼   │
//!   │                              TRANSFERRING(v, v+1)
//!   │                                             │   │
//!   │                  majority of v+1 started ───┘   │
//!   │                  GroupChangeComplete decided ───┘
//!   │
//!   │ RemoveRecord decided
//!   ▼
//! MARKED ── actives removed ──> ACTIVES_REMOVED ── ControllerRemove ──> gone
//! ```
//!
//! Every arrow is a conditional write on one record; replays of any packet
//! or decision leave the records unchanged.
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Identifiers: `NodeId`, `Version`, `GroupId`, `RequestId` |
//! | [`error`] | Error enums of every layer |
//! | [`config`] | Node table and protocol tuning |
//! | [`store`] | `RecordStore` trait, in-memory and file engines |
//! | [`record`] | Name and controller records with their transitions |
//! | [`packet`] | Packet types and the JSON codec |
//! | [`wire`] | Length-prefixed framing |
//! | [`selection`] | Replica selection policy |
//! | [`hashing`] | Placement of names on controllers |
//! | [`heartbeat`] | Keep-alive tracking |
//! | [`consensus`] | Group consensus interface and a local implementation |
//! | [`transport`] | Outgoing packet sink |
//! | [`controller`] | Controller role |
//! | [`active`] | Active-replica role |
//! | [`node`] | Name server dispatch |
//! | [`sim`] | Deterministic cluster simulation and invariant checkers |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod active;
pub mod config;
pub mod consensus;
pub mod controller;
pub mod error;
pub mod hashing;
pub mod heartbeat;
pub mod node;
pub mod packet;
pub mod record;
pub mod selection;
pub mod sim;
pub mod store;
pub mod transport;
pub mod types;
pub mod wire;

pub use active::ActiveReplica;
pub use config::{NodeConfig, NodeInfo, ReconfigConfig};
pub use consensus::{Decision, GroupConsensus, LocalConsensus};
pub use controller::ReplicaController;
pub use error::{
    ConfigError, ConsensusError, FrameError, PacketError, ReconfigError, StoreError,
    TransportError,
};
pub use hashing::{FixedControllers, HashRing, ReplicaControllerSet};
pub use heartbeat::{KeepAliveConfig, KeepAliveTracker};
pub use node::{Collaborators, NameServer, TickReport};
pub use packet::{PacketType, ReconfigPacket};
pub use record::{
    ControllerRecord, ControllerRecords, NameRecord, NameRecords, RemovalMark, SkipReason,
    Transition,
};
pub use store::{FileRecordStore, InMemoryRecordStore, Record, RecordStore};
pub use transport::{LocalBus, PacketSink};
pub use types::{GroupId, NodeId, NodeSet, RequestId, ValuesMap, Version};
