//! Transport contract
//!
//! The bridge never talks to the host controller directly; it goes through
//! this trait. `sim_host::ProcessHost` is the in-memory implementation.

use crate::message::MessageEnvelope;
use core_types::{PortId, ProcessRef, ProcessRole};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// How long `receive` may wait for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately when the inbox is empty
    Immediate,
    /// Wait until a delivery arrives or the process is woken
    Block,
    /// Wait until the deadline passes
    Until(Instant),
}

/// Something taken out of a process inbox
#[derive(Debug, Clone)]
pub enum Delivery {
    Message(MessageEnvelope),
    /// Lifecycle notice: the process has terminated
    PeerGone(ProcessRef),
    /// The other end of a locally owned port went away
    PortClosed(PortId),
}

/// A port moving with a message
///
/// `backlog` holds port messages the sender already took out of its inbox
/// but never delivered; they travel ahead of anything still queued.
#[derive(Debug, Clone)]
pub struct PortHandoff {
    pub port: PortId,
    pub backlog: Vec<MessageEnvelope>,
}

impl PortHandoff {
    pub fn new(port: PortId) -> Self {
        Self {
            port,
            backlog: Vec::new(),
        }
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Peer {0} is gone")]
    PeerGone(ProcessRef),

    #[error("Inbox of {0} is full")]
    InboxFull(ProcessRef),

    #[error("Process {0} has been terminated")]
    Closed(ProcessRef),

    #[error("Unknown port: {0}")]
    UnknownPort(PortId),
}

/// Ordered, message-based channel between processes
///
/// Implementations preserve FIFO order per (sender, receiver) pair and never
/// block on send.
pub trait Transport: Send + Sync {
    /// Enqueues an envelope for `envelope.destination`
    ///
    /// Ports in `handoffs` must be owned by the sender; ownership moves to
    /// the destination together with the message.
    fn send(&self, envelope: MessageEnvelope, handoffs: Vec<PortHandoff>)
        -> Result<(), TransportError>;

    /// Takes the next delivery for `process`
    ///
    /// `Ok(None)` means the wait ran out or the process was woken.
    fn receive(&self, process: ProcessRef, wait: Wait) -> Result<Option<Delivery>, TransportError>;

    /// Interrupts a blocked `receive` for `process`
    fn wake(&self, process: ProcessRef);

    fn role_of(&self, process: ProcessRef) -> Option<ProcessRole>;

    fn is_alive(&self, process: ProcessRef) -> bool;

    /// Creates two entangled port ends, both owned by `owner`
    fn create_port_pair(&self, owner: ProcessRef) -> Result<(PortId, PortId), TransportError>;

    /// Routes a message posted on `envelope.port` to whoever owns the end
    /// entangled with it, rewriting `port` and `destination` on the way
    ///
    /// Messages for a closed port are dropped silently.
    fn post_to_port(
        &self,
        envelope: MessageEnvelope,
        handoffs: Vec<PortHandoff>,
    ) -> Result<(), TransportError>;

    /// Re-routes a port message that reached a process no longer owning
    /// `envelope.port`
    ///
    /// `envelope.destination` is the forwarding process; ports in `handoffs`
    /// move from it to the current owner.
    fn forward(
        &self,
        envelope: MessageEnvelope,
        handoffs: Vec<PortHandoff>,
    ) -> Result<(), TransportError>;

    fn port_owner(&self, port: PortId) -> Option<ProcessRef>;

    /// Closes one end; the owner of the other end receives `PortClosed`
    fn close_port(&self, port: PortId);
}

/// A process's handle on the transport
#[derive(Clone)]
pub struct Endpoint {
    pub process: ProcessRef,
    pub transport: Arc<dyn Transport>,
}

impl Endpoint {
    pub fn new(process: ProcessRef, transport: Arc<dyn Transport>) -> Self {
        Self { process, transport }
    }

    pub fn role(&self) -> Option<ProcessRole> {
        self.transport.role_of(self.process)
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive(self.process)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("process", &self.process)
            .finish()
    }
}
