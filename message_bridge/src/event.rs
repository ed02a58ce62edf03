//! Context handed to listeners and handlers

use crate::bridge::{BridgeInner, MessageBridge};
use crate::error::BridgeError;
use core_types::{ProcessRef, ProcessRole};
use futures::future::LocalBoxFuture;
use ipc::{CorrelationId, ErrorValue, MessageKind, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// One incoming message, as seen by the code that handles it
#[derive(Clone)]
pub struct IpcEvent {
    pub(crate) sender: ProcessRef,
    pub(crate) sender_role: ProcessRole,
    pub(crate) channel: String,
    pub(crate) kind: MessageKind,
    pub(crate) correlation: Option<CorrelationId>,
    pub(crate) return_value: Rc<RefCell<Option<Value>>>,
    pub(crate) bridge: Weak<BridgeInner>,
}

impl IpcEvent {
    pub fn sender(&self) -> ProcessRef {
        self.sender
    }

    pub fn sender_role(&self) -> ProcessRole {
        self.sender_role
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation
    }

    /// Answers a `send_sync` served by listeners
    ///
    /// The last value set wins. Ignored for events and invokes.
    pub fn set_return_value(&self, value: Value) {
        *self.return_value.borrow_mut() = Some(value);
    }

    pub fn has_return_value(&self) -> bool {
        self.return_value.borrow().is_some()
    }

    pub(crate) fn take_return_value(&self) -> Option<Value> {
        self.return_value.borrow_mut().take()
    }

    /// Sends a one-way message back to the sender
    pub fn reply(&self, channel: &str, args: &[Value]) -> Result<(), BridgeError> {
        let bridge = self.bridge.upgrade().ok_or(BridgeError::Closed)?;
        bridge.check_public_channel(channel)?;
        bridge.post(self.sender, MessageKind::Event, channel, args, None)
    }

    /// The receiving bridge, while it is still alive
    pub fn bridge(&self) -> Option<MessageBridge> {
        self.bridge.upgrade().map(MessageBridge::from_inner)
    }
}

impl fmt::Debug for IpcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcEvent")
            .field("sender", &self.sender)
            .field("sender_role", &self.sender_role)
            .field("channel", &self.channel)
            .field("kind", &self.kind)
            .field("correlation", &self.correlation)
            .finish()
    }
}

/// Event listener; an `Err` is logged and does not stop other listeners
pub type ListenerFn = dyn Fn(&IpcEvent, &[Value]) -> Result<(), ErrorValue>;

/// What an invoke handler produced
pub enum HandlerReply {
    Ready(Result<Value, ErrorValue>),
    Deferred(LocalBoxFuture<'static, Result<Value, ErrorValue>>),
}

pub type HandlerFn = dyn Fn(&IpcEvent, Vec<Value>) -> HandlerReply;
