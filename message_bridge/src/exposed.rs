//! Curated bridge object for content processes
//!
//! Content code never gets the raw [`MessageBridge`]. It gets an
//! [`ExposedApi`] that only reaches the channels and call kinds listed in its
//! manifest. The same manifest produces the controller-side policy, so both
//! ends agree on what may cross.

use crate::bridge::MessageBridge;
use crate::correlation::Invocation;
use crate::error::BridgeError;
use crate::event::IpcEvent;
use boundary_policy::{AllowListPolicy, ChannelRule};
use core_types::ProcessRef;
use ipc::{ErrorValue, ListenerId, MessageKind, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Something content code may do on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExposedKind {
    Send,
    SendSync,
    Invoke,
    /// Receive events sent by the controller
    Listen,
}

impl ExposedKind {
    fn message_kind(self) -> Option<MessageKind> {
        match self {
            ExposedKind::Send => Some(MessageKind::Event),
            ExposedKind::SendSync => Some(MessageKind::Sync),
            ExposedKind::Invoke => Some(MessageKind::Invoke),
            ExposedKind::Listen => None,
        }
    }
}

impl fmt::Display for ExposedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExposedKind::Send => "send",
            ExposedKind::SendSync => "send-sync",
            ExposedKind::Invoke => "invoke",
            ExposedKind::Listen => "listen",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedEntry {
    pub channel: String,
    pub kinds: Vec<ExposedKind>,
    #[serde(default)]
    pub max_args: Option<usize>,
    #[serde(default)]
    pub allow_ports: bool,
}

impl ExposedEntry {
    pub fn new(channel: impl Into<String>, kinds: &[ExposedKind]) -> Self {
        Self {
            channel: channel.into(),
            kinds: kinds.to_vec(),
            max_args: None,
            allow_ports: false,
        }
    }

    pub fn with_max_args(mut self, max_args: usize) -> Self {
        self.max_args = Some(max_args);
        self
    }

    pub fn with_ports(mut self) -> Self {
        self.allow_ports = true;
        self
    }

    fn to_rule(&self) -> Option<ChannelRule> {
        let kinds: Vec<MessageKind> = self
            .kinds
            .iter()
            .filter_map(|kind| kind.message_kind())
            .collect();
        if kinds.is_empty() {
            return None;
        }
        let mut rule = ChannelRule::new(self.channel.clone());
        for kind in kinds {
            rule = rule.with_kind(kind);
        }
        if let Some(max_args) = self.max_args {
            rule = rule.with_max_args(max_args);
        }
        if self.allow_ports {
            rule = rule.with_ports();
        }
        Some(rule)
    }
}

/// The channels a content process may use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedApiManifest {
    pub entries: Vec<ExposedEntry>,
}

impl ExposedApiManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, entry: ExposedEntry) -> Self {
        self.entries.retain(|existing| existing.channel != entry.channel);
        self.entries.push(entry);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn entry(&self, channel: &str) -> Option<&ExposedEntry> {
        self.entries.iter().find(|entry| entry.channel == channel)
    }

    pub fn allows(&self, channel: &str, kind: ExposedKind) -> bool {
        self.entry(channel)
            .is_some_and(|entry| entry.kinds.contains(&kind))
    }

    /// Controller-side policy matching this manifest
    pub fn to_policy(&self) -> AllowListPolicy {
        self.entries
            .iter()
            .filter_map(ExposedEntry::to_rule)
            .fold(AllowListPolicy::new(), AllowListPolicy::with_rule)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExposedApiError {
    #[error("'{kind}' on channel '{channel}' is not exposed")]
    NotExposed { channel: String, kind: ExposedKind },

    #[error("'{channel}' accepts at most {max} arguments, got {got}")]
    TooManyArguments {
        channel: String,
        max: usize,
        got: usize,
    },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Read-only view of a bridge limited to one manifest
#[derive(Clone)]
pub struct ExposedApi {
    bridge: MessageBridge,
    controller: ProcessRef,
    manifest: Rc<ExposedApiManifest>,
}

impl ExposedApi {
    pub fn new(bridge: MessageBridge, controller: ProcessRef, manifest: ExposedApiManifest) -> Self {
        Self {
            bridge,
            controller,
            manifest: Rc::new(manifest),
        }
    }

    pub fn manifest(&self) -> &ExposedApiManifest {
        &self.manifest
    }

    /// Exposed channel names, in manifest order
    pub fn channels(&self) -> Vec<&str> {
        self.manifest
            .entries
            .iter()
            .map(|entry| entry.channel.as_str())
            .collect()
    }

    fn check(&self, channel: &str, kind: ExposedKind, args: &[Value]) -> Result<(), ExposedApiError> {
        let entry = self
            .manifest
            .entry(channel)
            .filter(|entry| entry.kinds.contains(&kind))
            .ok_or_else(|| ExposedApiError::NotExposed {
                channel: channel.to_string(),
                kind,
            })?;
        if let Some(max) = entry.max_args {
            if args.len() > max {
                return Err(ExposedApiError::TooManyArguments {
                    channel: channel.to_string(),
                    max,
                    got: args.len(),
                });
            }
        }
        Ok(())
    }

    pub fn send(&self, channel: &str, args: &[Value]) -> Result<(), ExposedApiError> {
        self.check(channel, ExposedKind::Send, args)?;
        Ok(self.bridge.send(self.controller, channel, args)?)
    }

    pub fn send_sync(&self, channel: &str, args: &[Value]) -> Result<Value, ExposedApiError> {
        self.check(channel, ExposedKind::SendSync, args)?;
        Ok(self.bridge.send_sync(self.controller, channel, args)?)
    }

    pub fn invoke(&self, channel: &str, args: &[Value]) -> Result<Invocation, ExposedApiError> {
        self.check(channel, ExposedKind::Invoke, args)?;
        Ok(self.bridge.invoke(self.controller, channel, args)?)
    }

    /// Listens for events the controller sends on `channel`
    pub fn on<F>(&self, channel: &str, listener: F) -> Result<ListenerId, ExposedApiError>
    where
        F: Fn(&IpcEvent, &[Value]) -> Result<(), ErrorValue> + 'static,
    {
        self.check(channel, ExposedKind::Listen, &[])?;
        Ok(self.bridge.scope(self.controller).on(channel, listener)?)
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.bridge.scope(self.controller).remove_listener(channel, id)
    }
}

impl fmt::Debug for ExposedApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExposedApi")
            .field("controller", &self.controller)
            .field("channels", &self.channels())
            .finish()
    }
}
