//! Error types for the reconfiguration control plane.
//!
//! A conditional write whose condition does not hold is not an error: it is
//! reported as `Ok(false)` by the store and as
//! [`Transition::NotApplied`](crate::record::Transition) by the record layer.

use thiserror::Error;

use crate::types::{GroupId, NodeId, Version};

/// Errors surfaced by a [`RecordStore`](crate::store::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists under the key.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Insert of a key that already exists.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// The backend could not be reached. A write that failed this way may
    /// or may not have been applied.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Record (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while framing bytes on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix is not a decimal number.
    #[error("Invalid length prefix: {0:?}")]
    InvalidLength(String),

    /// The declared payload exceeds the frame limit.
    #[error("Frame too large: {size} bytes (max: {max} bytes)")]
    TooLarge {
        /// Declared payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Trailing or missing bytes around a single frame.
    #[error("Frame length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        /// Length from the prefix.
        declared: usize,
        /// Bytes actually present.
        actual: usize,
    },
}

/// Errors raised while decoding or encoding a reconfiguration packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The payload is not valid JSON for the packet type.
    #[error("Invalid packet JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is not a JSON object.
    #[error("Packet is not a JSON object")]
    NotAnObject,

    /// The `type` discriminator is absent or not an integer.
    #[error("Packet has no integer type field")]
    MissingType,

    /// The `type` discriminator is not a reconfiguration packet.
    #[error("Unknown packet type: {0}")]
    UnknownType(i64),

    /// Framing around the packet is broken.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Errors raised by a [`GroupConsensus`](crate::consensus::GroupConsensus).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    /// The group was never started.
    #[error("Unknown consensus group: {0}")]
    UnknownGroup(GroupId),

    /// The group accepted its stop request and takes no further proposals.
    #[error("Consensus group stopped: {0}")]
    GroupStopped(GroupId),

    /// A group was restarted with a different membership.
    #[error("Consensus group {group} already started with other members")]
    MembershipConflict {
        /// The conflicting group.
        group: GroupId,
    },
}

/// Errors raised by a [`PacketSink`](crate::transport::PacketSink).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination is not in the node table.
    #[error("Unknown destination: {0}")]
    UnknownNode(NodeId),

    /// Encoding the packet failed.
    #[error("Encoding failed: {0}")]
    Encode(#[from] PacketError),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration is malformed.
    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A line of the hosts file could not be parsed.
    #[error("Invalid hosts line {line}: {reason}")]
    InvalidLine {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// The same node id appears twice.
    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the reconfiguration roles.
#[derive(Debug, Error)]
pub enum ReconfigError {
    /// The name has no record on this node.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// The name is already registered.
    #[error("Record already exists: {0}")]
    RecordExists(String),

    /// The store could not be reached and the outcome could not be resolved.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Any other store failure.
    #[error("Store failure: {0}")]
    Store(StoreError),

    /// A packet references a generation this node no longer (or not yet)
    /// serves.
    #[error("Stale group reference for {name}: {version}")]
    StaleGroupReference {
        /// The name in the packet.
        name: String,
        /// The generation the packet refers to.
        version: Version,
    },

    /// A packet could not be decoded.
    #[error("Malformed packet: {0}")]
    MalformedPacket(#[from] PacketError),

    /// Consensus rejected a proposal.
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Sending a packet failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<StoreError> for ReconfigError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => Self::RecordNotFound(name),
            StoreError::AlreadyExists(name) => Self::RecordExists(name),
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
            other => Self::Store(other),
        }
    }
}
