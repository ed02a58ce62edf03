//! Legacy method names
//!
//! Translation layer for callers still using the old method names. Each
//! method forwards to its [`MessageBridge`] replacement and logs one
//! deprecation warning per method and adapter.

use crate::bridge::MessageBridge;
use crate::error::BridgeError;
use core_types::ProcessRef;
use ipc::Value;
use std::cell::RefCell;
use std::collections::HashSet;

pub struct LegacyIpc {
    bridge: MessageBridge,
    warned: RefCell<HashSet<&'static str>>,
}

impl LegacyIpc {
    pub fn new(bridge: MessageBridge) -> Self {
        Self {
            bridge,
            warned: RefCell::new(HashSet::new()),
        }
    }

    pub fn bridge(&self) -> &MessageBridge {
        &self.bridge
    }

    /// Methods that have logged their deprecation warning
    pub fn warned(&self) -> Vec<&'static str> {
        let mut warned: Vec<_> = self.warned.borrow().iter().copied().collect();
        warned.sort_unstable();
        warned
    }

    fn deprecated(&self, method: &'static str, replacement: &'static str) {
        if self.warned.borrow_mut().insert(method) {
            tracing::warn!(method, replacement, "deprecated bridge method");
        }
    }

    #[deprecated(note = "use MessageBridge::send")]
    pub fn send_channel(
        &self,
        peer: ProcessRef,
        channel: &str,
        args: &[Value],
    ) -> Result<(), BridgeError> {
        self.deprecated("send_channel", "send");
        self.bridge.send(peer, channel, args)
    }

    #[deprecated(note = "use MessageBridge::send_sync")]
    pub fn send_channel_sync(
        &self,
        peer: ProcessRef,
        channel: &str,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        self.deprecated("send_channel_sync", "send_sync");
        self.bridge.send_sync(peer, channel, args)
    }

    /// Sends the same event to every peer; returns how many accepted it
    #[deprecated(note = "call MessageBridge::send for each peer")]
    pub fn send_to_all(&self, peers: &[ProcessRef], channel: &str, args: &[Value]) -> usize {
        self.deprecated("send_to_all", "send");
        peers
            .iter()
            .filter(|peer| match self.bridge.send(**peer, channel, args) {
                Ok(()) => true,
                Err(error) => {
                    tracing::debug!(peer = %peer, channel, %error, "broadcast skipped peer");
                    false
                }
            })
            .count()
    }

    #[deprecated(note = "use MessageBridge::remove_all_listeners with a channel")]
    pub fn remove_all(&self, channel: &str) -> Result<(), BridgeError> {
        self.deprecated("remove_all", "remove_all_listeners");
        self.bridge.remove_all_listeners(Some(channel))
    }
}
