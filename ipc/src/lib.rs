//! # Inter-Process Communication (IPC)
//!
//! This crate defines the bridge's wire protocol and the primitives every
//! process uses to talk across the process boundary.
//!
//! ## Philosophy
//!
//! - **Messages, not shared memory**: All communication is explicit message passing
//! - **Values are copied, endpoints are moved**: Plain data is cloned into a
//!   wire representation; ports change owner
//! - **Fail before sending**: Anything that cannot cross the boundary is
//!   rejected while encoding, never silently dropped
//! - **Correlated**: Round trips carry a correlation id; replies carry `reply_to`
//!
//! ## Architecture
//!
//! - [`Value`]: in-process values, including graphs that cannot be encoded
//! - [`WireValue`]: the serializable tree that crosses the boundary
//! - [`codec`]: conversion between the two
//! - [`MessageEnvelope`]: routing header plus JSON payload
//! - [`Transport`]: the seam the host controller implements
//! - [`MessagePort`]: a private sub-channel whose ends can be transferred

pub mod codec;
pub mod emitter;
pub mod message;
pub mod port;
pub mod transport;
pub mod value;
pub mod wire;

pub use codec::{
    decode, decode_args, encode, encode_args, encode_port_message, Encoded, PortAdopter,
    SerializationError, SerializationFailure, MAX_DEPTH,
};
pub use emitter::{ListenerId, Listeners, Subscribable};
pub use message::{
    is_reserved_channel, CorrelationId, MessageEnvelope, MessageId, MessageKind, MessagePayload,
    ReplyBody, SchemaVersion, BRIDGE_SCHEMA_VERSION, RESERVED_CHANNEL_PREFIX,
};
pub use port::{MessagePort, PortError, PortEvent, PortTable};
pub use transport::{Delivery, Endpoint, PortHandoff, Transport, TransportError, Wait};
pub use value::{Callable, ErrorValue, List, Map, Value};
pub use wire::{NonFinite, ValueKind, WireError, WireValue};
