//! The per-process bridge
//!
//! A [`MessageBridge`] owns everything one process needs to take part in the
//! messaging fabric: its registries, its pending calls, its ports and the
//! local tasks running async handlers. It is tied to the thread that created
//! it; the only state shared between processes lives in the transport.
//!
//! ## Event loop
//!
//! Nothing is dispatched behind the caller's back. Incoming traffic is
//! handled by [`MessageBridge::pump`], [`MessageBridge::run`] and
//! [`MessageBridge::run_until`]. [`MessageBridge::send_sync`] runs a nested
//! loop that only accepts its own reply and the target's termination notice;
//! everything else it receives is deferred, in arrival order, to the next
//! regular pump.

use crate::capabilities::CapabilityRegistry;
use crate::config::BridgeConfig;
use crate::correlation::{register_call, CallMode, Invocation, PendingCalls};
use crate::error::BridgeError;
use crate::event::{HandlerFn, HandlerReply, IpcEvent, ListenerFn};
use crate::executor::{InboxWaker, LocalTasks};
use crate::registry::Registry;
use boundary_policy::{BoundaryPolicy, Direction, ErrorExposure, PayloadShape, PolicyDecision};
use core_types::{PortId, ProcessRef, ProcessRole};
use futures::future::FutureExt;
use futures::pin_mut;
use ipc::{
    decode, encode, encode_args, is_reserved_channel, CorrelationId, Delivery, Encoded, Endpoint,
    ErrorValue, ListenerId, MessageEnvelope, MessageKind, MessagePayload, MessagePort,
    PortAdopter, PortTable, ReplyBody, SerializationError, SerializationFailure, Transport, Value,
    Wait, WireError, WireValue, BRIDGE_SCHEMA_VERSION,
};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

/// A content process announces that its script context is going away
pub const CONTEXT_RELEASE_CHANNEL: &str = "__bridge:context-release";
/// Lists the capability names a process offers
pub const CAPABILITIES_CHANNEL: &str = "__bridge:capabilities";
/// Events on this channel with nobody listening are dropped silently
pub const ERROR_CHANNEL: &str = "error";

const NEVER_REPLIED: &str = "reply was never sent";

fn no_handler(channel: &str) -> ErrorValue {
    ErrorValue::msg(format!("No handler registered for '{}'", channel))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn panic_error(payload: &(dyn Any + Send)) -> ErrorValue {
    ErrorValue::msg(panic_message(payload))
}

/// Where the answer to a request goes
#[derive(Debug, Clone)]
struct ReplyTarget {
    peer: ProcessRef,
    channel: String,
    correlation: CorrelationId,
}

impl ReplyTarget {
    fn of(event: &IpcEvent) -> Option<Self> {
        let Some(correlation) = event.correlation else {
            tracing::warn!(
                channel = %event.channel,
                sender = %event.sender,
                "request without correlation id; dropping"
            );
            return None;
        };
        Some(Self {
            peer: event.sender,
            channel: event.channel.clone(),
            correlation,
        })
    }
}

pub(crate) struct BridgeInner {
    process: ProcessRef,
    role: ProcessRole,
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    policy: RefCell<Option<Arc<dyn BoundaryPolicy>>>,
    registry: RefCell<Registry>,
    scoped: RefCell<HashMap<ProcessRef, Registry>>,
    calls: Rc<RefCell<PendingCalls>>,
    ports: PortTable,
    backlog: RefCell<VecDeque<Delivery>>,
    tasks: LocalTasks,
    in_flight: RefCell<HashMap<u64, ReplyTarget>>,
    next_task: Cell<u64>,
    waker: Waker,
    capabilities: RefCell<Option<Arc<CapabilityRegistry>>>,
    closed: Cell<bool>,
}

impl BridgeInner {
    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed.get() {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_public_channel(&self, channel: &str) -> Result<(), BridgeError> {
        if is_reserved_channel(channel) {
            return Err(BridgeError::ReservedChannel(channel.to_string()));
        }
        Ok(())
    }

    fn policy(&self) -> Option<Arc<dyn BoundaryPolicy>> {
        self.policy.borrow().clone()
    }

    /// Encodes, checks and sends an event or request
    pub(crate) fn post(
        &self,
        peer: ProcessRef,
        kind: MessageKind,
        channel: &str,
        args: &[Value],
        correlation: Option<CorrelationId>,
    ) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let encoded = encode_args(args)?;
        self.check_outbound(peer, kind, channel, &encoded)?;
        let payload = encoded.payload()?;
        let envelope = match correlation {
            Some(id) => MessageEnvelope::request(kind, self.process, peer, channel, id, payload),
            None => MessageEnvelope::event(self.process, peer, channel, payload),
        }
        .with_transfers(encoded.transfer_ids());
        self.hand_over(envelope, encoded.transfers())
    }

    fn hand_over(&self, envelope: MessageEnvelope, ports: &[MessagePort]) -> Result<(), BridgeError> {
        let handoffs = self.ports.prepare_handoffs(ports);
        let moved: Vec<PortId> = handoffs.iter().map(|handoff| handoff.port).collect();
        tracing::debug!(
            channel = %envelope.channel,
            peer = %envelope.destination,
            kind = %envelope.kind,
            ports = moved.len(),
            "sending message"
        );
        self.transport.send(envelope, handoffs)?;
        self.ports.commit_handoffs(&moved);
        Ok(())
    }

    fn check_outbound(
        &self,
        peer: ProcessRef,
        kind: MessageKind,
        channel: &str,
        encoded: &Encoded,
    ) -> Result<(), BridgeError> {
        let Some(policy) = self.policy() else {
            return Ok(());
        };
        let peer_role = self
            .transport
            .role_of(peer)
            .ok_or(BridgeError::PeerGone(peer))?;
        let direction = Direction::new(self.role, peer_role);
        let shape = PayloadShape::from_wire(kind, encoded.values(), !encoded.transfers().is_empty());
        match policy.evaluate(direction, channel, &shape) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny { reason } => {
                tracing::warn!(
                    channel,
                    %peer,
                    %direction,
                    policy = policy.name(),
                    %reason,
                    "outbound message denied"
                );
                Err(BridgeError::Denied {
                    channel: channel.to_string(),
                    policy: policy.name().to_string(),
                    reason,
                })
            }
        }
    }

    /// Returns the denial reason for an incoming message, if any
    fn check_inbound(
        &self,
        sender: ProcessRef,
        sender_role: ProcessRole,
        kind: MessageKind,
        channel: &str,
        wire: &[WireValue],
        transfers_ports: bool,
    ) -> Option<String> {
        let policy = self.policy()?;
        let direction = Direction::new(sender_role, self.role);
        let shape = PayloadShape::from_wire(kind, wire, transfers_ports);
        match policy.evaluate(direction, channel, &shape) {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny { reason } => {
                tracing::warn!(
                    channel,
                    %sender,
                    %direction,
                    policy = policy.name(),
                    %reason,
                    "inbound message denied"
                );
                Some(reason)
            }
        }
    }

    fn exposure_toward(&self, peer: ProcessRef) -> ErrorExposure {
        if let Some(exposure) = self.config.error_exposure {
            return exposure;
        }
        match (self.policy(), self.transport.role_of(peer)) {
            (Some(policy), Some(role)) => policy.error_exposure(Direction::new(self.role, role)),
            _ => ErrorExposure::Full,
        }
    }

    fn error_body(&self, peer: ProcessRef, error: ErrorValue) -> ReplyBody {
        let wire = WireError::new(error.name, error.message, error.stack);
        match self.exposure_toward(peer) {
            ErrorExposure::Full => ReplyBody::Err(wire),
            ErrorExposure::Redacted => ReplyBody::Err(wire.redacted()),
        }
    }

    fn send_reply(&self, target: &ReplyTarget, result: Result<Value, ErrorValue>) {
        let (body, ports) = match result {
            Ok(value) => match encode(&value) {
                Ok(encoded) => {
                    let (values, ports) = encoded.into_parts();
                    let wire = values.into_iter().next().unwrap_or(WireValue::Hole);
                    (ReplyBody::Ok(wire), ports)
                }
                Err(error) => {
                    tracing::error!(
                        channel = %target.channel,
                        %error,
                        "Error occurred in handler for '{}'",
                        target.channel
                    );
                    (self.error_body(target.peer, ErrorValue::from_error(&error)), Vec::new())
                }
            },
            Err(error) => (self.error_body(target.peer, error), Vec::new()),
        };

        let payload = match MessagePayload::new(&body) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(channel = %target.channel, %error, "failed to encode reply");
                return;
            }
        };
        let transfers = ports.iter().map(MessagePort::id).collect();
        let envelope = MessageEnvelope::reply(
            self.process,
            target.peer,
            target.channel.clone(),
            target.correlation,
            payload,
        )
        .with_transfers(transfers);
        if let Err(error) = self.hand_over(envelope, &ports) {
            tracing::debug!(
                channel = %target.channel,
                peer = %target.peer,
                correlation_id = %target.correlation,
                %error,
                "reply not delivered"
            );
        }
    }

    fn finish_call(&self, target: &ReplyTarget, result: Result<Value, ErrorValue>) {
        if let Err(error) = &result {
            tracing::error!(
                channel = %target.channel,
                peer = %target.peer,
                %error,
                "Error occurred in handler for '{}'",
                target.channel
            );
        }
        self.send_reply(target, result);
    }

    fn handle_reply(&self, envelope: MessageEnvelope) {
        let Some(id) = envelope.reply_to else {
            tracing::warn!(message = %envelope.id, "reply without reply_to; dropping");
            return;
        };
        let outcome = match envelope.payload.deserialize::<ReplyBody>() {
            Ok(ReplyBody::Ok(wire)) => Ok(decode(&wire, &self.ports)),
            Ok(ReplyBody::Err(error)) => Err(BridgeError::HandlerExecution {
                channel: envelope.channel.clone(),
                error: ErrorValue::bridged(error.name, error.message, error.stack),
            }),
            Err(error) => Err(BridgeError::Serialization(SerializationError::new(
                "reply",
                SerializationFailure::Payload(error.to_string()),
            ))),
        };
        self.calls
            .borrow_mut()
            .resolve(id, envelope.source, outcome);
    }

    fn peer_gone(&self, peer: ProcessRef) {
        let rejected = self.calls.borrow_mut().reject_peer(peer);
        let scoped = self.scoped.borrow_mut().remove(&peer);
        self.in_flight
            .borrow_mut()
            .retain(|_, target| target.peer != peer);
        tracing::debug!(%peer, rejected, "peer gone");
        drop(scoped);
    }

    fn release_scope(&self, peer: ProcessRef) {
        let scoped = self.scoped.borrow_mut().remove(&peer);
        tracing::debug!(%peer, released = scoped.is_some(), "peer released its context");
        drop(scoped);
    }

    fn take_handler(&self, sender: ProcessRef, channel: &str) -> Option<Rc<HandlerFn>> {
        let scoped = self
            .scoped
            .borrow_mut()
            .get_mut(&sender)
            .and_then(|registry| registry.take_handler(channel));
        scoped.or_else(|| self.registry.borrow_mut().take_handler(channel))
    }

    fn with_registry<R>(&self, scope: Option<ProcessRef>, f: impl FnOnce(&mut Registry) -> R) -> R {
        match scope {
            None => f(&mut *self.registry.borrow_mut()),
            Some(peer) => f(self
                .scoped
                .borrow_mut()
                .entry(peer)
                .or_insert_with(Registry::scoped)),
        }
    }

    fn next_delivery(&self, wait: Wait) -> Result<Option<Delivery>, BridgeError> {
        self.ensure_open()?;
        let deferred = self.backlog.borrow_mut().pop_front();
        if deferred.is_some() {
            return Ok(deferred);
        }
        match self.transport.receive(self.process, wait) {
            Ok(delivery) => Ok(delivery),
            Err(error) => {
                tracing::debug!(process = %self.process, %error, "inbox closed");
                self.shutdown();
                Err(BridgeError::Closed)
            }
        }
    }

    fn poll_tasks(&self) -> usize {
        self.tasks.poll(&self.waker)
    }

    pub(crate) fn shutdown(&self) {
        if self.closed.replace(true) {
            return;
        }
        let unanswered: Vec<ReplyTarget> = self
            .in_flight
            .borrow_mut()
            .drain()
            .map(|(_, target)| target)
            .collect();
        for target in &unanswered {
            self.send_reply(target, Err(ErrorValue::msg(NEVER_REPLIED)));
        }
        let rejected = self.calls.borrow_mut().reject_all(BridgeError::Closed);
        let dropped_tasks = self.tasks.len();
        self.tasks.clear();
        self.backlog.borrow_mut().clear();

        let registry = std::mem::replace(&mut *self.registry.borrow_mut(), Registry::protected());
        let scoped = std::mem::take(&mut *self.scoped.borrow_mut());
        drop(registry);
        drop(scoped);

        tracing::debug!(
            process = %self.process,
            unanswered = unanswered.len(),
            rejected,
            dropped_tasks,
            "bridge closed"
        );
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sync_handler<F>(handler: F) -> Rc<HandlerFn>
where
    F: Fn(&IpcEvent, Vec<Value>) -> Result<Value, ErrorValue> + 'static,
{
    Rc::new(move |event: &IpcEvent, args: Vec<Value>| HandlerReply::Ready(handler(event, args)))
}

fn async_handler<F, Fut>(handler: F) -> Rc<HandlerFn>
where
    F: Fn(IpcEvent, Vec<Value>) -> Fut + 'static,
    Fut: Future<Output = Result<Value, ErrorValue>> + 'static,
{
    Rc::new(move |event: &IpcEvent, args: Vec<Value>| {
        HandlerReply::Deferred(handler(event.clone(), args).boxed_local())
    })
}

/// One process's end of the messaging fabric
#[derive(Clone)]
pub struct MessageBridge {
    inner: Rc<BridgeInner>,
}

impl MessageBridge {
    /// Creates the bridge for the process behind `endpoint`
    pub fn new(endpoint: Endpoint, config: BridgeConfig) -> Result<Self, BridgeError> {
        let Endpoint { process, transport } = endpoint;
        if !transport.is_alive(process) {
            return Err(BridgeError::Closed);
        }
        let role = transport.role_of(process).ok_or(BridgeError::Closed)?;
        let waker = InboxWaker::waker(Arc::clone(&transport), process);
        let ports = PortTable::new(process, Arc::clone(&transport));
        let calls = Rc::new(RefCell::new(PendingCalls::new(config.max_pending_calls)));

        tracing::debug!(%process, %role, "bridge created");
        Ok(Self {
            inner: Rc::new(BridgeInner {
                process,
                role,
                transport,
                config,
                policy: RefCell::new(None),
                registry: RefCell::new(Registry::protected()),
                scoped: RefCell::new(HashMap::new()),
                calls,
                ports,
                backlog: RefCell::new(VecDeque::new()),
                tasks: LocalTasks::default(),
                in_flight: RefCell::new(HashMap::new()),
                next_task: Cell::new(1),
                waker,
                capabilities: RefCell::new(None),
                closed: Cell::new(false),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Rc<BridgeInner>) -> Self {
        Self { inner }
    }

    pub fn with_policy(self, policy: Arc<dyn BoundaryPolicy>) -> Self {
        self.set_policy(policy);
        self
    }

    /// Enforces `policy` on everything sent and received from now on
    pub fn set_policy(&self, policy: Arc<dyn BoundaryPolicy>) {
        tracing::debug!(process = %self.inner.process, policy = policy.name(), "policy installed");
        *self.inner.policy.borrow_mut() = Some(policy);
    }

    pub fn policy(&self) -> Option<Arc<dyn BoundaryPolicy>> {
        self.inner.policy()
    }

    /// Installs the capabilities this process offers to its peers
    pub fn with_capabilities(self, capabilities: CapabilityRegistry) -> Result<Self, BridgeError> {
        let capabilities = Arc::new(capabilities);
        let offered = Arc::clone(&capabilities);
        let handler = sync_handler(move |_, _| {
            Ok(Value::list(offered.names().into_iter().map(Value::from)))
        });
        self.inner
            .registry
            .borrow_mut()
            .add_handler(CAPABILITIES_CHANNEL, handler, false)?;
        *self.inner.capabilities.borrow_mut() = Some(capabilities);
        Ok(self)
    }

    pub fn capabilities(&self) -> Option<Arc<CapabilityRegistry>> {
        self.inner.capabilities.borrow().clone()
    }

    pub fn process(&self) -> ProcessRef {
        self.inner.process
    }

    pub fn role(&self) -> ProcessRole {
        self.inner.role
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    // ---- outbound ----

    /// Sends a one-way event
    pub fn send(&self, peer: ProcessRef, channel: &str, args: &[Value]) -> Result<(), BridgeError> {
        self.inner.check_public_channel(channel)?;
        self.inner.post(peer, MessageKind::Event, channel, args, None)
    }

    /// Starts an asynchronous round trip
    pub fn invoke(
        &self,
        peer: ProcessRef,
        channel: &str,
        args: &[Value],
    ) -> Result<Invocation, BridgeError> {
        self.inner.check_public_channel(channel)?;
        self.call(peer, channel, args, CallMode::Async)
    }

    fn call(
        &self,
        peer: ProcessRef,
        channel: &str,
        args: &[Value],
        mode: CallMode,
    ) -> Result<Invocation, BridgeError> {
        self.inner.ensure_open()?;
        let kind = match mode {
            CallMode::Sync => MessageKind::Sync,
            CallMode::Async => MessageKind::Invoke,
        };
        let invocation = register_call(&self.inner.calls, peer, channel, mode)?;
        self.inner
            .post(peer, kind, channel, args, Some(invocation.id()))?;
        Ok(invocation)
    }

    /// Blocking round trip
    ///
    /// Only the matching reply and the target's termination are serviced
    /// while waiting. Other traffic is deferred to the next pump.
    pub fn send_sync(
        &self,
        peer: ProcessRef,
        channel: &str,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        self.inner.check_public_channel(channel)?;
        let mut invocation = self.call(peer, channel, args, CallMode::Sync)?;
        let id = invocation.id();
        let timeout = self.inner.config.sync_timeout();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(outcome) = invocation.try_result() {
                return outcome;
            }
            let wait = match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    tracing::warn!(channel, %peer, correlation_id = %id, "sync call timed out");
                    invocation.abandon();
                    return Err(BridgeError::Timeout {
                        channel: channel.to_string(),
                        timeout: timeout.unwrap_or_default(),
                    });
                }
                Some(deadline) => Wait::Until(deadline),
                None => Wait::Block,
            };
            let delivery = match self.inner.transport.receive(self.inner.process, wait) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(error) => {
                    tracing::debug!(process = %self.inner.process, %error, "inbox closed during sync call");
                    drop(invocation);
                    self.inner.shutdown();
                    return Err(BridgeError::Closed);
                }
            };
            self.service_nested(delivery, peer, id);
        }
    }

    fn service_nested(&self, delivery: Delivery, peer: ProcessRef, id: CorrelationId) {
        match delivery {
            Delivery::Message(envelope)
                if envelope.kind == MessageKind::Reply
                    && envelope.reply_to == Some(id)
                    && envelope.source == peer =>
            {
                self.inner.handle_reply(envelope);
            }
            Delivery::PeerGone(gone) if gone == peer => {
                self.inner.calls.borrow_mut().reject_peer(gone);
                self.inner
                    .backlog
                    .borrow_mut()
                    .push_back(Delivery::PeerGone(gone));
            }
            other => {
                tracing::trace!("deferring delivery during sync call");
                self.inner.backlog.borrow_mut().push_back(other);
            }
        }
    }

    // ---- registration ----

    /// Adds an event listener on the process-wide registry
    pub fn on<F>(&self, channel: &str, listener: F) -> Result<ListenerId, BridgeError>
    where
        F: Fn(&IpcEvent, &[Value]) -> Result<(), ErrorValue> + 'static,
    {
        self.add_listener(None, channel, Rc::new(listener), false)
    }

    /// Adds a listener that is removed after its first event
    pub fn once<F>(&self, channel: &str, listener: F) -> Result<ListenerId, BridgeError>
    where
        F: Fn(&IpcEvent, &[Value]) -> Result<(), ErrorValue> + 'static,
    {
        self.add_listener(None, channel, Rc::new(listener), true)
    }

    fn add_listener(
        &self,
        scope: Option<ProcessRef>,
        channel: &str,
        listener: Rc<ListenerFn>,
        once: bool,
    ) -> Result<ListenerId, BridgeError> {
        self.inner.ensure_open()?;
        self.inner.check_public_channel(channel)?;
        Ok(self
            .inner
            .with_registry(scope, |registry| registry.add_listener(channel, listener, once)))
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.inner
            .with_registry(None, |registry| registry.remove_listener(channel, id))
    }

    /// Removes every listener of `channel`
    ///
    /// The process-wide registry refuses `None`.
    pub fn remove_all_listeners(&self, channel: Option<&str>) -> Result<(), BridgeError> {
        self.inner
            .with_registry(None, |registry| registry.remove_all_listeners(channel))
            .map_err(BridgeError::from)
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner
            .with_registry(None, |registry| registry.listener_count(channel))
    }

    /// Channels with listeners, sorted
    pub fn event_names(&self) -> Vec<String> {
        self.inner.with_registry(None, |registry| {
            registry.event_names().map(str::to_string).collect()
        })
    }

    /// Registers the handler answering `invoke` and `send_sync` on `channel`
    pub fn handle<F>(&self, channel: &str, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(&IpcEvent, Vec<Value>) -> Result<Value, ErrorValue> + 'static,
    {
        self.add_handler(None, channel, sync_handler(handler), false)
    }

    pub fn handle_async<F, Fut>(&self, channel: &str, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(IpcEvent, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, ErrorValue>> + 'static,
    {
        self.add_handler(None, channel, async_handler(handler), false)
    }

    /// Like [`MessageBridge::handle`]; removed after the first call
    pub fn handle_once<F>(&self, channel: &str, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(&IpcEvent, Vec<Value>) -> Result<Value, ErrorValue> + 'static,
    {
        self.add_handler(None, channel, sync_handler(handler), true)
    }

    pub fn handle_once_async<F, Fut>(&self, channel: &str, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(IpcEvent, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, ErrorValue>> + 'static,
    {
        self.add_handler(None, channel, async_handler(handler), true)
    }

    fn add_handler(
        &self,
        scope: Option<ProcessRef>,
        channel: &str,
        handler: Rc<HandlerFn>,
        once: bool,
    ) -> Result<(), BridgeError> {
        self.inner.ensure_open()?;
        self.inner.check_public_channel(channel)?;
        self.inner
            .with_registry(scope, |registry| registry.add_handler(channel, handler, once))?;
        tracing::debug!(channel, scoped = scope.is_some(), "handler registered");
        Ok(())
    }

    pub fn remove_handler(&self, channel: &str) -> bool {
        self.inner
            .with_registry(None, |registry| registry.remove_handler(channel))
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        self.inner
            .with_registry(None, |registry| registry.has_handler(channel))
    }

    /// Registry that only serves messages from `peer`
    ///
    /// Consulted before the process-wide registry and dropped when `peer`
    /// terminates or releases its context.
    pub fn scope(&self, peer: ProcessRef) -> PeerScope {
        PeerScope {
            bridge: self.clone(),
            peer,
        }
    }

    // ---- ports and framework channels ----

    /// Creates an entangled port pair owned by this process
    pub fn message_channel(&self) -> Result<(MessagePort, MessagePort), BridgeError> {
        self.inner.ensure_open()?;
        Ok(self.inner.ports.create_pair()?)
    }

    /// Tells `peer` that this process's context is going away
    pub fn release_context(&self, peer: ProcessRef) -> Result<(), BridgeError> {
        self.inner
            .post(peer, MessageKind::Event, CONTEXT_RELEASE_CHANNEL, &[], None)
    }

    /// Asks `peer` which capabilities it offers; resolves to a list of names
    pub fn query_capabilities(&self, peer: ProcessRef) -> Result<Invocation, BridgeError> {
        self.call(peer, CAPABILITIES_CHANNEL, &[], CallMode::Async)
    }

    // ---- event loop ----

    /// Handles everything currently queued without blocking
    ///
    /// Returns the number of deliveries handled.
    pub fn pump(&self) -> Result<usize, BridgeError> {
        let mut handled = 0;
        self.inner.poll_tasks();
        while let Some(delivery) = self.inner.next_delivery(Wait::Immediate)? {
            self.dispatch(delivery);
            handled += 1;
        }
        self.inner.poll_tasks();
        Ok(handled)
    }

    /// Serves incoming traffic until the process is terminated or the
    /// bridge is closed
    pub fn run(&self) -> Result<(), BridgeError> {
        loop {
            self.inner.poll_tasks();
            match self.inner.next_delivery(Wait::Block) {
                Ok(Some(delivery)) => self.dispatch(delivery),
                Ok(None) => {}
                Err(BridgeError::Closed) => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    /// Drives the event loop until `future` completes
    pub fn run_until<F: Future>(&self, future: F) -> Result<F::Output, BridgeError> {
        pin_mut!(future);
        let waker = self.inner.waker.clone();
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            self.inner.poll_tasks();
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if let Some(delivery) = self.inner.next_delivery(Wait::Block)? {
                self.dispatch(delivery);
            }
        }
    }

    /// Waits for an invocation while serving incoming traffic
    pub fn wait_for(&self, invocation: Invocation) -> Result<Value, BridgeError> {
        self.run_until(invocation)?
    }

    /// Outstanding round trips started by this bridge
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.borrow().len()
    }

    /// Async handlers that have not replied yet
    pub fn handlers_in_flight(&self) -> usize {
        self.inner.in_flight.borrow().len()
    }

    /// Number of live port handles in this process
    pub fn open_ports(&self) -> usize {
        self.inner.ports.live_count()
    }

    /// Closes the bridge
    ///
    /// Pending calls are rejected with `Closed` and unfinished async
    /// handlers answer `reply was never sent`.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    // ---- dispatch ----

    fn dispatch(&self, delivery: Delivery) {
        match delivery {
            Delivery::Message(envelope) => {
                if !envelope
                    .schema_version
                    .is_compatible_with(&BRIDGE_SCHEMA_VERSION)
                {
                    self.refuse_version(envelope);
                    return;
                }
                match envelope.kind {
                    MessageKind::Port => self.inner.ports.deliver(envelope),
                    MessageKind::Reply => self.inner.handle_reply(envelope),
                    MessageKind::Event | MessageKind::Sync | MessageKind::Invoke => {
                        self.handle_request(envelope)
                    }
                }
            }
            Delivery::PortClosed(port) => self.inner.ports.port_closed(port),
            Delivery::PeerGone(peer) => self.inner.peer_gone(peer),
        }
    }

    fn refuse_version(&self, envelope: MessageEnvelope) {
        tracing::warn!(
            channel = %envelope.channel,
            sender = %envelope.source,
            version = %envelope.schema_version,
            "dropping message with incompatible schema version"
        );
        if let (true, Some(correlation)) = (envelope.kind.is_request(), envelope.correlation_id) {
            let target = ReplyTarget {
                peer: envelope.source,
                channel: envelope.channel,
                correlation,
            };
            let error = ErrorValue::new(
                "ProtocolError",
                format!("unsupported schema version {}", envelope.schema_version),
            );
            self.inner.send_reply(&target, Err(error));
        }
    }

    fn handle_request(&self, envelope: MessageEnvelope) {
        let MessageEnvelope {
            source: sender,
            kind,
            channel,
            correlation_id,
            transfers,
            payload,
            ..
        } = envelope;

        let Some(sender_role) = self.inner.transport.role_of(sender) else {
            tracing::warn!(%sender, %channel, "dropping message from unknown process");
            return;
        };
        let event = IpcEvent {
            sender,
            sender_role,
            channel,
            kind,
            correlation: correlation_id,
            return_value: Rc::new(RefCell::new(None)),
            bridge: Rc::downgrade(&self.inner),
        };

        let wire: Vec<WireValue> = match payload.deserialize() {
            Ok(wire) => wire,
            Err(error) => {
                tracing::warn!(channel = %event.channel, %sender, %error, "dropping undecodable message");
                if kind.is_request() {
                    if let Some(target) = ReplyTarget::of(&event) {
                        self.inner
                            .send_reply(&target, Err(ErrorValue::from_error(&error)));
                    }
                }
                return;
            }
        };

        if let Some(reason) = self.inner.check_inbound(
            sender,
            sender_role,
            kind,
            &event.channel,
            &wire,
            !transfers.is_empty(),
        ) {
            // Ports that came with a refused message are closed right away.
            for port in &transfers {
                drop(self.inner.ports.adopt(*port));
            }
            if kind.is_request() {
                if let Some(target) = ReplyTarget::of(&event) {
                    let error = ErrorValue::new(
                        "AccessDenied",
                        format!("Access to '{}' denied: {}", event.channel, reason),
                    );
                    self.inner.send_reply(&target, Err(error));
                }
            }
            return;
        }

        let args: Vec<Value> = wire
            .iter()
            .map(|item| decode(item, &self.inner.ports))
            .collect();
        tracing::debug!(channel = %event.channel, %sender, %kind, "dispatching message");

        if event.channel == CONTEXT_RELEASE_CHANNEL {
            self.inner.release_scope(sender);
            return;
        }
        match kind {
            MessageKind::Event => {
                self.emit(&event, &args);
            }
            MessageKind::Sync => self.serve_sync(event, args),
            MessageKind::Invoke => self.serve_invoke(event, args),
            MessageKind::Reply | MessageKind::Port => {}
        }
    }

    /// Runs scoped then process-wide listeners; returns how many ran
    fn emit(&self, event: &IpcEvent, args: &[Value]) -> usize {
        let mut listeners = match self.inner.scoped.borrow_mut().get_mut(&event.sender) {
            Some(registry) => registry.listeners_for(&event.channel),
            None => Vec::new(),
        };
        listeners.extend(self.inner.registry.borrow_mut().listeners_for(&event.channel));

        if listeners.is_empty() {
            if event.channel != ERROR_CHANNEL {
                tracing::debug!(channel = %event.channel, sender = %event.sender, "no listeners");
            }
            return 0;
        }
        for listener in &listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event, args))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(channel = %event.channel, %error, "listener failed");
                }
                Err(payload) => {
                    tracing::warn!(
                        channel = %event.channel,
                        panic = %panic_message(&*payload),
                        "listener panicked"
                    );
                }
            }
        }
        listeners.len()
    }

    fn serve_sync(&self, event: IpcEvent, args: Vec<Value>) {
        let Some(target) = ReplyTarget::of(&event) else {
            return;
        };
        if let Some(handler) = self.inner.take_handler(event.sender, &event.channel) {
            self.run_handler(target, &event, args, handler);
            return;
        }
        let listened = self.emit(&event, &args);
        let result = match event.take_return_value() {
            Some(value) => Ok(value),
            None if listened > 0 => {
                tracing::warn!(channel = %event.channel, "sync message left without a return value");
                Err(ErrorValue::msg(NEVER_REPLIED))
            }
            None => Err(no_handler(&event.channel)),
        };
        self.inner.send_reply(&target, result);
    }

    fn serve_invoke(&self, event: IpcEvent, args: Vec<Value>) {
        let Some(target) = ReplyTarget::of(&event) else {
            return;
        };
        match self.inner.take_handler(event.sender, &event.channel) {
            Some(handler) => self.run_handler(target, &event, args, handler),
            None => {
                tracing::debug!(channel = %event.channel, sender = %event.sender, "no handler");
                self.inner.send_reply(&target, Err(no_handler(&event.channel)));
            }
        }
    }

    fn run_handler(
        &self,
        target: ReplyTarget,
        event: &IpcEvent,
        args: Vec<Value>,
        handler: Rc<HandlerFn>,
    ) {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(event, args))) {
            Ok(HandlerReply::Ready(result)) => self.inner.finish_call(&target, result),
            Ok(HandlerReply::Deferred(future)) => self.spawn_reply(target, future),
            Err(payload) => self
                .inner
                .finish_call(&target, Err(panic_error(&*payload))),
        }
    }

    fn spawn_reply(
        &self,
        target: ReplyTarget,
        future: futures::future::LocalBoxFuture<'static, Result<Value, ErrorValue>>,
    ) {
        let task = self.inner.next_task.get();
        self.inner.next_task.set(task + 1);
        self.inner.in_flight.borrow_mut().insert(task, target);

        let bridge = Rc::downgrade(&self.inner);
        let guarded = AssertUnwindSafe(future).catch_unwind();
        self.inner.tasks.spawn(Box::pin(async move {
            let outcome = guarded.await;
            let Some(inner) = bridge.upgrade() else {
                return;
            };
            let target = inner.in_flight.borrow_mut().remove(&task);
            let Some(target) = target else {
                return;
            };
            let result = outcome.unwrap_or_else(|payload| Err(panic_error(&*payload)));
            inner.finish_call(&target, result);
        }));
        self.inner.poll_tasks();
    }
}

impl fmt::Debug for MessageBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBridge")
            .field("process", &self.inner.process)
            .field("role", &self.inner.role)
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// Registrations that only apply to messages from one peer
#[derive(Clone)]
pub struct PeerScope {
    bridge: MessageBridge,
    peer: ProcessRef,
}

impl PeerScope {
    pub fn peer(&self) -> ProcessRef {
        self.peer
    }

    fn ensure_peer(&self) -> Result<(), BridgeError> {
        if self.bridge.inner.transport.is_alive(self.peer) {
            Ok(())
        } else {
            Err(BridgeError::PeerGone(self.peer))
        }
    }

    pub fn on<F>(&self, channel: &str, listener: F) -> Result<ListenerId, BridgeError>
    where
        F: Fn(&IpcEvent, &[Value]) -> Result<(), ErrorValue> + 'static,
    {
        self.ensure_peer()?;
        self.bridge
            .add_listener(Some(self.peer), channel, Rc::new(listener), false)
    }

    pub fn once<F>(&self, channel: &str, listener: F) -> Result<ListenerId, BridgeError>
    where
        F: Fn(&IpcEvent, &[Value]) -> Result<(), ErrorValue> + 'static,
    {
        self.ensure_peer()?;
        self.bridge
            .add_listener(Some(self.peer), channel, Rc::new(listener), true)
    }

    /// Runs `f` on the scoped registry if it exists; never creates one
    fn existing<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> Option<R> {
        self.bridge
            .inner
            .scoped
            .borrow_mut()
            .get_mut(&self.peer)
            .map(f)
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.existing(|registry| registry.remove_listener(channel, id))
            .unwrap_or(false)
    }

    /// Scoped registries allow clearing every channel at once
    pub fn remove_all_listeners(&self, channel: Option<&str>) -> Result<(), BridgeError> {
        self.existing(|registry| registry.remove_all_listeners(channel))
            .unwrap_or(Ok(()))
            .map_err(BridgeError::from)
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.bridge
            .inner
            .scoped
            .borrow()
            .get(&self.peer)
            .map_or(0, |registry| registry.listener_count(channel))
    }

    pub fn handle<F>(&self, channel: &str, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(&IpcEvent, Vec<Value>) -> Result<Value, ErrorValue> + 'static,
    {
        self.ensure_peer()?;
        self.bridge
            .add_handler(Some(self.peer), channel, sync_handler(handler), false)
    }

    pub fn handle_async<F, Fut>(&self, channel: &str, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(IpcEvent, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, ErrorValue>> + 'static,
    {
        self.ensure_peer()?;
        self.bridge
            .add_handler(Some(self.peer), channel, async_handler(handler), false)
    }

    pub fn remove_handler(&self, channel: &str) -> bool {
        self.existing(|registry| registry.remove_handler(channel))
            .unwrap_or(false)
    }

    /// True while registrations for this peer are held
    pub fn is_active(&self) -> bool {
        self.bridge.inner.scoped.borrow().contains_key(&self.peer)
    }
}

impl fmt::Debug for PeerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerScope").field("peer", &self.peer).finish()
    }
}
