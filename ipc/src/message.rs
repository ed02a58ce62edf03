//! Message types and envelope structure

use crate::wire::{WireError, WireValue};
use core_types::{PortId, ProcessRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Version of the bridge wire protocol spoken by this build.
pub const BRIDGE_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(1, 0);

/// Channels starting with this prefix belong to the bridge itself
pub const RESERVED_CHANNEL_PREFIX: &str = "__bridge:";

/// Returns true for framework-internal channel names
pub fn is_reserved_channel(channel: &str) -> bool {
    channel.starts_with(RESERVED_CHANNEL_PREFIX)
}

/// Unique identifier for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", self.0)
    }
}

/// Identifier pairing a request with its reply
///
/// Allocated monotonically by the origin process and never reused, so a
/// late reply for an abandoned call can never be mistaken for a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Creates a correlation ID from its raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Schema version of the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Major version (breaking changes)
    pub major: u32,
    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl SchemaVersion {
    /// Creates a new schema version
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Same major version = compatible
    pub fn is_compatible_with(&self, other: &SchemaVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// What an envelope asks of its receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// One-way notification delivered to every listener
    Event,
    /// Blocking round trip; the sender's thread waits for the reply
    Sync,
    /// Asynchronous round trip answered by the channel's single handler
    Invoke,
    /// Answer to a `Sync` or `Invoke` request
    Reply,
    /// Message posted to a transferable port
    Port,
}

impl MessageKind {
    /// Returns true for kinds that expect a reply
    pub fn is_request(&self) -> bool {
        matches!(self, MessageKind::Sync | MessageKind::Invoke)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Event => "event",
            MessageKind::Sync => "sync",
            MessageKind::Invoke => "invoke",
            MessageKind::Reply => "reply",
            MessageKind::Port => "port",
        };
        f.write_str(name)
    }
}

/// Message envelope containing routing and metadata
///
/// The payload is type-erased JSON: a list of [`WireValue`] arguments for
/// events, requests and port messages, a [`ReplyBody`] for replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier for this message
    pub id: MessageId,
    /// Sending process
    pub source: ProcessRef,
    /// Receiving process (assigned by the host for port messages)
    pub destination: ProcessRef,
    /// Protocol version of the sender
    pub schema_version: SchemaVersion,
    /// What the receiver is asked to do
    pub kind: MessageKind,
    /// Channel name
    pub channel: String,
    /// Correlation ID of a request
    pub correlation_id: Option<CorrelationId>,
    /// Correlation ID this message replies to
    pub reply_to: Option<CorrelationId>,
    /// Target port of a port message
    pub port: Option<PortId>,
    /// Ports whose ownership moves with this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transfers: Vec<PortId>,
    /// Serialized payload
    pub payload: MessagePayload,
}

impl MessageEnvelope {
    fn base(
        kind: MessageKind,
        source: ProcessRef,
        destination: ProcessRef,
        channel: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            source,
            destination,
            schema_version: BRIDGE_SCHEMA_VERSION,
            kind,
            channel: channel.into(),
            correlation_id: None,
            reply_to: None,
            port: None,
            transfers: Vec::new(),
            payload,
        }
    }

    /// Creates a one-way event
    pub fn event(
        source: ProcessRef,
        destination: ProcessRef,
        channel: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self::base(MessageKind::Event, source, destination, channel, payload)
    }

    /// Creates a round-trip request (`Sync` or `Invoke`)
    pub fn request(
        kind: MessageKind,
        source: ProcessRef,
        destination: ProcessRef,
        channel: impl Into<String>,
        correlation_id: CorrelationId,
        payload: MessagePayload,
    ) -> Self {
        let mut envelope = Self::base(kind, source, destination, channel, payload);
        envelope.correlation_id = Some(correlation_id);
        envelope
    }

    /// Creates a reply to a request
    pub fn reply(
        source: ProcessRef,
        destination: ProcessRef,
        channel: impl Into<String>,
        reply_to: CorrelationId,
        payload: MessagePayload,
    ) -> Self {
        let mut envelope = Self::base(MessageKind::Reply, source, destination, channel, payload);
        envelope.reply_to = Some(reply_to);
        envelope
    }

    /// Creates a message for a port
    ///
    /// The destination is unknown to the sender; the host fills it in with
    /// the current owner of `port` when routing.
    pub fn port_message(source: ProcessRef, port: PortId, payload: MessagePayload) -> Self {
        let mut envelope = Self::base(MessageKind::Port, source, source, "", payload);
        envelope.port = Some(port);
        envelope
    }

    /// Sets the list of transferred ports
    pub fn with_transfers(mut self, transfers: Vec<PortId>) -> Self {
        self.transfers = transfers;
        self
    }

    /// Checks if this is a reply to another message
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

/// Body of a reply: `{"ok": value}` or `{"err": error}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyBody {
    Ok(WireValue),
    Err(WireError),
}

/// Type-erased message payload
///
/// Serialized as JSON so the envelope stays self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    data: Vec<u8>,
}

impl MessagePayload {
    /// Creates a new payload from serializable data
    pub fn new<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_vec(data)?;
        Ok(Self { data: json })
    }

    /// Deserializes the payload into a specific type
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Returns the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_channels() {
        assert!(is_reserved_channel("__bridge:capabilities"));
        assert!(!is_reserved_channel("bridge:capabilities"));
        assert!(!is_reserved_channel("ping"));
    }

    #[test]
    fn test_message_id_creation() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn test_schema_version_compatibility() {
        let v1_0 = SchemaVersion::new(1, 0);
        let v1_1 = SchemaVersion::new(1, 1);
        let v2_0 = SchemaVersion::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_1));
        assert!(!v1_0.is_compatible_with(&v2_0));
        assert_eq!(format!("{}", v1_1), "v1.1");
    }

    #[test]
    fn test_event_envelope_creation() {
        let source = ProcessRef::new();
        let dest = ProcessRef::new();
        let payload = MessagePayload::new(&vec![WireValue::Null]).unwrap();
        let envelope = MessageEnvelope::event(source, dest, "ping", payload);

        assert_eq!(envelope.kind, MessageKind::Event);
        assert_eq!(envelope.channel, "ping");
        assert_eq!(envelope.destination, dest);
        assert!(!envelope.is_reply());
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn test_request_and_reply_correlation() {
        let a = ProcessRef::new();
        let b = ProcessRef::new();
        let id = CorrelationId::from_raw(7);
        let request = MessageEnvelope::request(
            MessageKind::Invoke,
            a,
            b,
            "sum",
            id,
            MessagePayload::new(&Vec::<WireValue>::new()).unwrap(),
        );
        assert!(request.kind.is_request());
        assert_eq!(request.correlation_id, Some(id));

        let body = ReplyBody::Ok(WireValue::Integer(3));
        let reply = MessageEnvelope::reply(b, a, "sum", id, MessagePayload::new(&body).unwrap());
        assert!(reply.is_reply());
        assert_eq!(reply.reply_to, Some(id));
        assert_eq!(reply.payload.deserialize::<ReplyBody>().unwrap(), body);
    }

    #[test]
    fn test_reply_body_wire_shape() {
        let ok = serde_json::to_value(ReplyBody::Ok(WireValue::Bool(true))).unwrap();
        assert!(ok.get("ok").is_some());

        let err = serde_json::to_value(ReplyBody::Err(WireError::new("TypeError", "bad", None)))
            .unwrap();
        let inner = err.get("err").unwrap();
        assert_eq!(inner["name"], "TypeError");
        assert_eq!(inner["__isBridgeError"], true);
    }

    #[test]
    fn test_port_message_has_no_destination_yet() {
        let source = ProcessRef::new();
        let port = PortId::new();
        let envelope = MessageEnvelope::port_message(
            source,
            port,
            MessagePayload::new(&vec![WireValue::Null]).unwrap(),
        );
        assert_eq!(envelope.kind, MessageKind::Port);
        assert_eq!(envelope.port, Some(port));
        assert_eq!(envelope.destination, source);
    }

    #[test]
    fn test_envelope_roundtrips_through_json() {
        let envelope = MessageEnvelope::event(
            ProcessRef::new(),
            ProcessRef::new(),
            "log",
            MessagePayload::new(&vec![WireValue::String("hi".into())]).unwrap(),
        )
        .with_transfers(vec![PortId::new()]);
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: MessageEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, envelope.id);
        assert_eq!(back.transfers, envelope.transfers);
        assert_eq!(back.payload.as_bytes(), envelope.payload.as_bytes());
    }
}
