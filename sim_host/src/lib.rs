//! # Simulated Host Controller
//!
//! In-memory implementation of [`ipc::Transport`]. It plays the part of the
//! host controller that owns the process table: every process gets a
//! bounded inbox, ports are routed to whichever process currently owns
//! them, and terminating a process notifies everybody else.
//!
//! ## Philosophy
//!
//! **Testability is a first-class design constraint.**
//!
//! Bridges in the same test binary talk through one `ProcessHost`, each on
//! its own thread or interleaved on one thread. All host state is
//! inspectable, so tests can assert on queue depths and port ownership.
//!
//! Locking: the host table lock is always taken before any inbox lock.

pub mod config;
pub mod inbox;

pub use config::{HostConfig, DEFAULT_INBOX_CAPACITY};
pub use inbox::{Inbox, InboxError};

use core_types::{PortId, ProcessRef, ProcessRole};
use ipc::{
    Delivery, Endpoint, MessageEnvelope, MessageKind, PortHandoff, Transport, TransportError,
    Wait,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct ProcessEntry {
    role: ProcessRole,
    inbox: Arc<Inbox>,
    alive: bool,
}

#[derive(Debug, Clone, Copy)]
struct PortRecord {
    owner: ProcessRef,
    entangled: PortId,
    /// The entangled end has been closed
    peer_closed: bool,
}

#[derive(Default)]
struct HostState {
    processes: HashMap<ProcessRef, ProcessEntry>,
    ports: HashMap<PortId, PortRecord>,
}

impl HostState {
    fn live_inbox(&self, process: ProcessRef) -> Option<Arc<Inbox>> {
        self.processes
            .get(&process)
            .filter(|entry| entry.alive)
            .map(|entry| Arc::clone(&entry.inbox))
    }

    fn ensure_alive(&self, process: ProcessRef) -> Result<(), TransportError> {
        if self.live_inbox(process).is_some() {
            Ok(())
        } else {
            Err(TransportError::Closed(process))
        }
    }

    fn check_handoffs(
        &self,
        from: ProcessRef,
        handoffs: &[PortHandoff],
    ) -> Result<(), TransportError> {
        for handoff in handoffs {
            match self.ports.get(&handoff.port) {
                Some(record) if record.owner == from => {}
                _ => return Err(TransportError::UnknownPort(handoff.port)),
            }
        }
        Ok(())
    }

    fn room_in(&self, process: ProcessRef) -> Result<Arc<Inbox>, TransportError> {
        let inbox = self
            .live_inbox(process)
            .ok_or(TransportError::PeerGone(process))?;
        match inbox.ensure_room() {
            Ok(()) => Ok(inbox),
            Err(InboxError::Full) => Err(TransportError::InboxFull(process)),
            Err(InboxError::Closed) => Err(TransportError::PeerGone(process)),
        }
    }

    fn apply_handoffs(&mut self, from: ProcessRef, to: ProcessRef, handoffs: Vec<PortHandoff>) {
        for handoff in handoffs {
            self.move_port(handoff.port, from, to, handoff.backlog);
        }
    }

    /// Moves ownership of `port` and everything queued for it
    ///
    /// Port messages already sitting in the old owner's inbox go with it,
    /// and so do the ports those messages carry.
    fn move_port(
        &mut self,
        port: PortId,
        from: ProcessRef,
        to: ProcessRef,
        backlog: Vec<MessageEnvelope>,
    ) {
        let Some(record) = self.ports.get_mut(&port) else {
            return;
        };
        if record.owner != from {
            return;
        }
        record.owner = to;
        let peer_closed = record.peer_closed;

        let migrated = self
            .processes
            .get(&from)
            .map(|entry| entry.inbox.drain_port(port))
            .unwrap_or_default();
        let Some(target) = self.live_inbox(to) else {
            return;
        };

        for envelope in backlog {
            target.push_unbounded(Delivery::Message(envelope));
        }
        let mut close_forwarded = false;
        let mut carried = Vec::new();
        for delivery in migrated {
            match &delivery {
                Delivery::Message(envelope) => carried.extend(envelope.transfers.iter().copied()),
                Delivery::PortClosed(_) => close_forwarded = true,
                Delivery::PeerGone(_) => {}
            }
            target.push_unbounded(delivery);
        }
        if peer_closed && !close_forwarded {
            target.push_unbounded(Delivery::PortClosed(port));
        }
        for nested in carried {
            self.move_port(nested, from, to, Vec::new());
        }
    }

    fn close_port(&mut self, port: PortId) {
        let Some(record) = self.ports.remove(&port) else {
            return;
        };
        let Some(peer) = self.ports.get_mut(&record.entangled) else {
            return;
        };
        peer.peer_closed = true;
        let owner = peer.owner;
        if let Some(inbox) = self.live_inbox(owner) {
            inbox.push_unbounded(Delivery::PortClosed(record.entangled));
        }
    }

    /// Ports travelling with a message that can never be delivered
    fn discard_handoffs(&mut self, handoffs: Vec<PortHandoff>) {
        for handoff in handoffs {
            self.close_port(handoff.port);
        }
    }
}

/// The simulated host controller
pub struct ProcessHost {
    config: HostConfig,
    state: Mutex<HostState>,
}

impl ProcessHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Registers a new process and returns its endpoint
    pub fn spawn(self: &Arc<Self>, role: ProcessRole) -> Endpoint {
        let process = ProcessRef::new();
        let entry = ProcessEntry {
            role,
            inbox: Arc::new(Inbox::with_capacity(self.config.inbox_capacity)),
            alive: true,
        };
        self.state.lock().processes.insert(process, entry);
        tracing::debug!(%process, %role, "process spawned");
        Endpoint::new(process, Arc::clone(self) as Arc<dyn Transport>)
    }

    /// Terminates a process
    ///
    /// Its inbox is closed, the ports it owns are closed (their entangled
    /// ends see `PortClosed`), and every other live process receives
    /// `PeerGone`.
    pub fn terminate(&self, process: ProcessRef) {
        let mut state = self.state.lock();
        let Some(entry) = state.processes.get_mut(&process) else {
            return;
        };
        if !entry.alive {
            return;
        }
        entry.alive = false;
        entry.inbox.close();

        let owned: Vec<PortId> = state
            .ports
            .iter()
            .filter(|(_, record)| record.owner == process)
            .map(|(id, _)| *id)
            .collect();
        for port in owned {
            state.close_port(port);
        }

        for entry in state.processes.values().filter(|entry| entry.alive) {
            entry.inbox.push_unbounded(Delivery::PeerGone(process));
        }
        tracing::debug!(%process, "process terminated");
    }

    /// Live processes
    pub fn processes(&self) -> Vec<ProcessRef> {
        self.state
            .lock()
            .processes
            .iter()
            .filter(|(_, entry)| entry.alive)
            .map(|(process, _)| *process)
            .collect()
    }

    /// Number of deliveries queued for `process`
    pub fn queued(&self, process: ProcessRef) -> usize {
        self.state
            .lock()
            .processes
            .get(&process)
            .map(|entry| entry.inbox.len())
            .unwrap_or(0)
    }

    /// Number of open port ends
    pub fn port_count(&self) -> usize {
        self.state.lock().ports.len()
    }
}

impl Default for ProcessHost {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl Transport for ProcessHost {
    fn send(
        &self,
        envelope: MessageEnvelope,
        handoffs: Vec<PortHandoff>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let from = envelope.source;
        let to = envelope.destination;
        state.ensure_alive(from)?;
        state.check_handoffs(from, &handoffs)?;
        // Replies answer calls the receiver is waiting on; its pending-call
        // limit already bounds them.
        let inbox = if envelope.kind == MessageKind::Reply {
            state.live_inbox(to).ok_or(TransportError::PeerGone(to))?
        } else {
            state.room_in(to)?
        };

        tracing::debug!(
            %from,
            %to,
            channel = %envelope.channel,
            kind = %envelope.kind,
            "routing message"
        );
        state.apply_handoffs(from, to, handoffs);
        inbox.push_unbounded(Delivery::Message(envelope));
        Ok(())
    }

    fn receive(&self, process: ProcessRef, wait: Wait) -> Result<Option<Delivery>, TransportError> {
        let inbox = {
            let state = self.state.lock();
            match state.processes.get(&process) {
                Some(entry) => Arc::clone(&entry.inbox),
                None => return Err(TransportError::Closed(process)),
            }
        };
        inbox
            .pop(wait)
            .map_err(|_| TransportError::Closed(process))
    }

    fn wake(&self, process: ProcessRef) {
        let inbox = self
            .state
            .lock()
            .processes
            .get(&process)
            .map(|entry| Arc::clone(&entry.inbox));
        if let Some(inbox) = inbox {
            inbox.wake();
        }
    }

    fn role_of(&self, process: ProcessRef) -> Option<ProcessRole> {
        self.state
            .lock()
            .processes
            .get(&process)
            .map(|entry| entry.role)
    }

    fn is_alive(&self, process: ProcessRef) -> bool {
        self.state.lock().live_inbox(process).is_some()
    }

    fn create_port_pair(&self, owner: ProcessRef) -> Result<(PortId, PortId), TransportError> {
        let mut state = self.state.lock();
        state.ensure_alive(owner)?;
        let (a, b) = (PortId::new(), PortId::new());
        state.ports.insert(
            a,
            PortRecord {
                owner,
                entangled: b,
                peer_closed: false,
            },
        );
        state.ports.insert(
            b,
            PortRecord {
                owner,
                entangled: a,
                peer_closed: false,
            },
        );
        Ok((a, b))
    }

    fn post_to_port(
        &self,
        mut envelope: MessageEnvelope,
        handoffs: Vec<PortHandoff>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let from = envelope.source;
        state.ensure_alive(from)?;
        state.check_handoffs(from, &handoffs)?;

        let Some(source_port) = envelope.port else {
            return Err(TransportError::UnknownPort(PortId::default()));
        };
        let target = match state.ports.get(&source_port) {
            Some(record) if record.owner == from => record.entangled,
            Some(_) => return Err(TransportError::UnknownPort(source_port)),
            None => {
                state.discard_handoffs(handoffs);
                return Ok(());
            }
        };
        let Some(owner) = state.ports.get(&target).map(|record| record.owner) else {
            tracing::debug!(port = %source_port, "dropping message for closed port");
            state.discard_handoffs(handoffs);
            return Ok(());
        };
        let inbox = state.room_in(owner)?;

        envelope.port = Some(target);
        envelope.destination = owner;
        state.apply_handoffs(from, owner, handoffs);
        inbox.push_unbounded(Delivery::Message(envelope));
        Ok(())
    }

    fn forward(
        &self,
        mut envelope: MessageEnvelope,
        handoffs: Vec<PortHandoff>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let from = envelope.destination;
        state.ensure_alive(from)?;
        state.check_handoffs(from, &handoffs)?;

        let Some(target) = envelope.port else {
            return Err(TransportError::UnknownPort(PortId::default()));
        };
        let Some(owner) = state.ports.get(&target).map(|record| record.owner) else {
            state.discard_handoffs(handoffs);
            return Ok(());
        };
        let inbox = state.room_in(owner)?;

        tracing::debug!(port = %target, %from, to = %owner, "forwarding port message");
        envelope.destination = owner;
        state.apply_handoffs(from, owner, handoffs);
        inbox.push_unbounded(Delivery::Message(envelope));
        Ok(())
    }

    fn port_owner(&self, port: PortId) -> Option<ProcessRef> {
        self.state.lock().ports.get(&port).map(|record| record.owner)
    }

    fn close_port(&self, port: PortId) {
        self.state.lock().close_port(port);
    }
}
