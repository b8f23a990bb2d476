//! Outgoing packet sink.
//!
//! Protocol handlers never wait for a peer: they hand packets to a
//! [`PacketSink`] and return. [`LocalBus`] frames each packet and queues it
//! for an in-process delivery loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use tracing::trace;

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::packet::ReconfigPacket;
use crate::types::NodeId;
use crate::wire;

/// Non-blocking packet sender.
pub trait PacketSink {
    /// Enqueue `packet` for `to`.
    fn send(&self, to: NodeId, packet: &ReconfigPacket) -> Result<(), TransportError>;
}

/// A framed packet in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Destination node.
    pub to: NodeId,
    /// `<length>:<payload>` frame.
    pub frame: Bytes,
}

/// In-process bus queueing framed packets.
#[derive(Debug)]
pub struct LocalBus {
    nodes: Rc<NodeConfig>,
    queue: RefCell<VecDeque<Envelope>>,
}

impl LocalBus {
    /// Create a bus delivering to the nodes of `nodes`.
    pub fn new(nodes: Rc<NodeConfig>) -> Self {
        Self {
            nodes,
            queue: RefCell::new(VecDeque::new()),
        }
    }

    /// Take the envelope at `index` (queue order).
    pub fn take(&self, index: usize) -> Option<Envelope> {
        self.queue.borrow_mut().remove(index)
    }

    /// Take every queued envelope.
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.borrow_mut().drain(..).collect()
    }

    /// Push a raw frame, bypassing encoding.
    pub fn inject(&self, to: NodeId, frame: Bytes) {
        self.queue.borrow_mut().push_back(Envelope { to, frame });
    }

    /// Number of queued envelopes.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl PacketSink for LocalBus {
    fn send(&self, to: NodeId, packet: &ReconfigPacket) -> Result<(), TransportError> {
        if !self.nodes.contains(to) {
            return Err(TransportError::UnknownNode(to));
        }
        let frame = wire::encode_packet(packet)?;
        trace!(to = %to, packet = %packet, "queued");
        self.queue.borrow_mut().push_back(Envelope { to, frame });
        Ok(())
    }
}
