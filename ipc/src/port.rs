//! Transferable message ports
//!
//! A port pair is a private sub-channel. Either end can be moved to another
//! process by putting it in a message; the moved handle is neutered and the
//! receiver adopts a fresh handle with the same id.
//!
//! Incoming port messages are held in the port's queue until [`MessagePort::start`]
//! is called. Messages that arrive before their port has been adopted (the
//! carrying message is still queued behind them) wait in the table's early
//! buffer.

use crate::codec::{decode_args, encode_port_message, PortAdopter, SerializationError};
use crate::emitter::{ListenerId, Listeners, Subscribable};
use crate::message::MessageEnvelope;
use crate::transport::{PortHandoff, Transport, TransportError};
use crate::value::Value;
use core_types::{PortId, ProcessRef};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use thiserror::Error;

/// Event emitted by a port
#[derive(Debug, Clone)]
pub enum PortEvent {
    Message(Value),
    /// The other end was closed, dropped, or its owner died
    Close,
}

/// Port errors
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Port {0} has been transferred and can no longer be used")]
    Neutered(PortId),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

type PortListener = dyn Fn(&PortEvent);

#[derive(Debug, Default)]
struct PortState {
    started: bool,
    neutered: bool,
    /// No further messages will arrive or be sent
    closed: bool,
    /// Closed by this process (or dropped); the host has been told
    released: bool,
    close_pending: bool,
    delivering: bool,
    queue: VecDeque<MessageEnvelope>,
}

struct PortInner {
    id: PortId,
    table: Option<PortTable>,
    state: RefCell<PortState>,
    listeners: RefCell<Listeners<PortListener>>,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.neutered || state.released {
            return;
        }
        if let Some(table) = &self.table {
            table.release(self.id);
        }
    }
}

/// One end of a port pair
#[derive(Clone)]
pub struct MessagePort {
    inner: Rc<PortInner>,
}

impl MessagePort {
    fn attached(id: PortId, table: PortTable) -> Self {
        Self {
            inner: Rc::new(PortInner {
                id,
                table: Some(table),
                state: RefCell::new(PortState::default()),
                listeners: RefCell::new(Listeners::new()),
            }),
        }
    }

    /// Inert handle that belongs to no process
    pub fn detached(id: PortId) -> Self {
        let state = PortState {
            neutered: true,
            closed: true,
            ..PortState::default()
        };
        Self {
            inner: Rc::new(PortInner {
                id,
                table: None,
                state: RefCell::new(state),
                listeners: RefCell::new(Listeners::new()),
            }),
        }
    }

    pub fn id(&self) -> PortId {
        self.inner.id
    }

    /// True once this handle has been moved to another process
    pub fn is_neutered(&self) -> bool {
        self.inner.state.borrow().neutered
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.borrow().started
    }

    /// Number of messages waiting for `start`
    pub fn queued(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Sends a value to the other end
    ///
    /// Posting to a closed port does nothing. Ports inside `value` move
    /// with the message and are neutered once it has been handed over.
    pub fn post_message(&self, value: Value) -> Result<(), PortError> {
        {
            let state = self.inner.state.borrow();
            if state.neutered {
                return Err(PortError::Neutered(self.id()));
            }
            if state.closed {
                return Ok(());
            }
        }
        let Some(table) = &self.inner.table else {
            return Err(PortError::Neutered(self.id()));
        };

        let encoded = encode_port_message(&value, self.id())?;
        let payload = encoded.payload()?;
        let envelope = MessageEnvelope::port_message(table.process(), self.id(), payload)
            .with_transfers(encoded.transfer_ids());
        let handoffs = table.prepare_handoffs(encoded.transfers());
        let moved: Vec<PortId> = handoffs.iter().map(|handoff| handoff.port).collect();

        table.transport().post_to_port(envelope, handoffs)?;
        table.commit_handoffs(&moved);
        Ok(())
    }

    /// Starts delivery of queued and future messages
    pub fn start(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.neutered || state.started {
                return;
            }
            state.started = true;
        }
        self.flush();
    }

    /// Closes this end; the other end emits `close`
    pub fn close(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.neutered || state.released {
                return;
            }
            state.closed = true;
            state.released = true;
            state.close_pending = false;
            state.queue.clear();
        }
        if let Some(table) = &self.inner.table {
            table.release(self.id());
        }
    }

    /// Listens for message events
    pub fn on_message(&self, listener: impl Fn(&Value) + 'static) -> ListenerId {
        self.subscribe(Rc::new(move |event: &PortEvent| {
            if let PortEvent::Message(value) = event {
                listener(value);
            }
        }))
    }

    /// Listens for the close event
    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.subscribe(Rc::new(move |event: &PortEvent| {
            if matches!(event, PortEvent::Close) {
                listener();
            }
        }))
    }

    fn enqueue(&self, envelope: MessageEnvelope) {
        let started = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.queue.push_back(envelope);
            state.started
        };
        if started {
            self.flush();
        }
    }

    fn peer_closed(&self) {
        let started = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_pending = true;
            state.started
        };
        if started {
            self.flush();
        }
    }

    fn neuter(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.neutered = true;
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.inner.listeners.borrow_mut().clear();
    }

    fn backlog(&self) -> Vec<MessageEnvelope> {
        self.inner.state.borrow().queue.iter().cloned().collect()
    }

    fn flush(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        loop {
            let next = {
                let mut state = self.inner.state.borrow_mut();
                if !state.started || state.neutered {
                    None
                } else if let Some(envelope) = state.queue.pop_front() {
                    Some(Some(envelope))
                } else if state.close_pending {
                    state.close_pending = false;
                    Some(None)
                } else {
                    None
                }
            };
            match next {
                Some(Some(envelope)) => {
                    let value = self.decode(&envelope);
                    self.emit(&PortEvent::Message(value));
                }
                Some(None) => self.emit(&PortEvent::Close),
                None => break,
            }
        }
        self.inner.state.borrow_mut().delivering = false;
    }

    fn decode(&self, envelope: &MessageEnvelope) -> Value {
        let Some(table) = &self.inner.table else {
            return Value::Undefined;
        };
        match decode_args(&envelope.payload, table) {
            Ok(mut values) if !values.is_empty() => values.swap_remove(0),
            Ok(_) => Value::Undefined,
            Err(error) => {
                tracing::warn!(port = %self.id(), %error, "dropping undecodable port message");
                Value::Undefined
            }
        }
    }

    fn emit(&self, event: &PortEvent) {
        let listeners = self.inner.listeners.borrow_mut().snapshot();
        for listener in listeners {
            listener(event);
        }
    }
}

impl Subscribable for MessagePort {
    type Event = PortEvent;

    fn subscribe(&self, listener: Rc<dyn Fn(&PortEvent)>) -> ListenerId {
        self.inner.listeners.borrow_mut().add(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.borrow_mut().remove(id)
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("MessagePort");
        out.field("id", &self.inner.id);
        if let Ok(state) = self.inner.state.try_borrow() {
            out.field("started", &state.started)
                .field("neutered", &state.neutered)
                .field("closed", &state.closed);
        }
        out.finish()
    }
}

#[derive(Default)]
struct EarlyBuffer {
    messages: Vec<MessageEnvelope>,
    closed: bool,
}

#[derive(Default)]
struct TableState {
    live: HashMap<PortId, Weak<PortInner>>,
    early: HashMap<PortId, EarlyBuffer>,
    /// Moved to another process; stray messages are forwarded
    departed: HashSet<PortId>,
    /// Closed or dropped here; stray messages are discarded
    retired: HashSet<PortId>,
}

struct TableInner {
    process: ProcessRef,
    transport: Arc<dyn Transport>,
    state: RefCell<TableState>,
}

/// The ports one process currently holds
#[derive(Clone)]
pub struct PortTable {
    inner: Rc<TableInner>,
}

impl PortTable {
    pub fn new(process: ProcessRef, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Rc::new(TableInner {
                process,
                transport,
                state: RefCell::new(TableState::default()),
            }),
        }
    }

    pub fn process(&self) -> ProcessRef {
        self.inner.process
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Creates an entangled pair owned by this process
    pub fn create_pair(&self) -> Result<(MessagePort, MessagePort), TransportError> {
        let (a, b) = self.inner.transport.create_port_pair(self.inner.process)?;
        Ok((self.adopt(a), self.adopt(b)))
    }

    /// Number of live handles
    pub fn live_count(&self) -> usize {
        self.inner
            .state
            .borrow()
            .live
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Routes an incoming port message
    pub fn deliver(&self, envelope: MessageEnvelope) {
        let Some(target) = envelope.port else {
            tracing::warn!(message = %envelope.id, "port message without target port");
            return;
        };
        if let Some(port) = self.live_port(target) {
            port.enqueue(envelope);
            return;
        }

        let mut state = self.inner.state.borrow_mut();
        if state.retired.contains(&target) {
            tracing::debug!(port = %target, "discarding message for closed port");
        } else if state.departed.contains(&target) {
            drop(state);
            self.forward(envelope);
        } else {
            state.early.entry(target).or_default().messages.push(envelope);
        }
    }

    /// Handles a `PortClosed` delivery
    pub fn port_closed(&self, id: PortId) {
        if let Some(port) = self.live_port(id) {
            port.peer_closed();
            return;
        }
        let mut state = self.inner.state.borrow_mut();
        if !state.departed.contains(&id) && !state.retired.contains(&id) {
            state.early.entry(id).or_default().closed = true;
        }
    }

    /// Collects the handoffs for ports about to leave this process
    ///
    /// Queued messages go along, and so does every port those messages
    /// carry, recursively.
    pub fn prepare_handoffs(&self, ports: &[MessagePort]) -> Vec<PortHandoff> {
        let mut handoffs = Vec::new();
        for port in ports {
            let backlog = port.backlog();
            let mut nested = Vec::new();
            self.nested_handoffs(&backlog, &mut nested);
            handoffs.push(PortHandoff {
                port: port.id(),
                backlog,
            });
            for handoff in nested {
                if !handoffs.iter().any(|existing| existing.port == handoff.port) {
                    handoffs.push(handoff);
                }
            }
        }
        handoffs
    }

    /// Neuters the handed-off ports once the transport accepted them
    pub fn commit_handoffs(&self, moved: &[PortId]) {
        for id in moved {
            if let Some(port) = self.live_port(*id) {
                port.neuter();
            }
            let mut state = self.inner.state.borrow_mut();
            state.live.remove(id);
            state.early.remove(id);
            state.retired.remove(id);
            state.departed.insert(*id);
        }
    }

    fn nested_handoffs(&self, backlog: &[MessageEnvelope], out: &mut Vec<PortHandoff>) {
        for envelope in backlog {
            for carried in &envelope.transfers {
                if out.iter().any(|handoff| handoff.port == *carried) {
                    continue;
                }
                let messages = self
                    .inner
                    .state
                    .borrow()
                    .early
                    .get(carried)
                    .map(|buffer| buffer.messages.clone())
                    .unwrap_or_default();
                self.nested_handoffs(&messages, out);
                out.push(PortHandoff {
                    port: *carried,
                    backlog: messages,
                });
            }
        }
    }

    fn forward(&self, envelope: MessageEnvelope) {
        let handoffs = {
            let mut handoffs = Vec::new();
            self.nested_handoffs(std::slice::from_ref(&envelope), &mut handoffs);
            handoffs
        };
        let moved: Vec<PortId> = handoffs.iter().map(|handoff| handoff.port).collect();
        let target = envelope.port;
        match self.inner.transport.forward(envelope, handoffs) {
            Ok(()) => {
                tracing::debug!(port = ?target, "forwarded message for departed port");
                self.commit_handoffs(&moved);
            }
            Err(error) => {
                tracing::warn!(port = ?target, %error, "failed to forward port message");
            }
        }
    }

    fn live_port(&self, id: PortId) -> Option<MessagePort> {
        self.inner
            .state
            .borrow()
            .live
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|inner| MessagePort { inner })
    }

    fn release(&self, id: PortId) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.live.remove(&id);
            state.retired.insert(id);
        }
        self.inner.transport.close_port(id);
    }
}

impl PortAdopter for PortTable {
    fn adopt(&self, id: PortId) -> MessagePort {
        if let Some(port) = self.live_port(id) {
            return port;
        }
        let port = MessagePort::attached(id, self.clone());
        let early = {
            let mut state = self.inner.state.borrow_mut();
            state.departed.remove(&id);
            state.retired.remove(&id);
            state.live.insert(id, Rc::downgrade(&port.inner));
            state.early.remove(&id)
        };
        if let Some(buffer) = early {
            let mut state = port.inner.state.borrow_mut();
            state.queue.extend(buffer.messages);
            if buffer.closed {
                state.closed = true;
                state.close_pending = true;
            }
        }
        port
    }
}

impl fmt::Debug for PortTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortTable")
            .field("process", &self.inner.process)
            .field("live", &self.live_count())
            .finish()
    }
}
