//! # Message Bridge
//!
//! The per-process side of the messaging fabric between a privileged
//! controller, its content processes and auxiliary workers.
//!
//! ## Philosophy
//!
//! - **One bridge per process**: Registries are owned by an explicit
//!   [`MessageBridge`], never by globals, so several processes can share a
//!   test binary
//! - **Explicit event loop**: Handlers run when the process pumps, on the
//!   process's own thread
//! - **Failures travel back**: A failing handler becomes a rejected call on
//!   the other side, with name and message intact
//! - **Policy at the boundary**: An optional [`boundary_policy::BoundaryPolicy`]
//!   is checked on send and enforced on receive
//!
//! ## Operations
//!
//! - `send`: one-way event, delivered to every listener
//! - `invoke`: async round trip answered by the channel's single handler
//! - `send_sync`: blocking round trip, served by the handler or by listeners
//!   setting a return value
//! - `message_channel`: a private sub-channel whose ends can be sent along

pub mod bridge;
pub mod capabilities;
pub mod compat;
pub mod config;
pub mod correlation;
pub mod error;
pub mod event;
pub mod exposed;
mod executor;
mod registry;

pub use bridge::{
    MessageBridge, PeerScope, CAPABILITIES_CHANNEL, CONTEXT_RELEASE_CHANNEL, ERROR_CHANNEL,
};
pub use capabilities::{CapabilityError, CapabilityRegistry, CapabilityRegistryBuilder};
pub use compat::LegacyIpc;
pub use config::{BridgeConfig, DEFAULT_MAX_PENDING};
pub use correlation::{CallMode, Invocation, PendingCalls};
pub use error::{BridgeError, RegistryError};
pub use event::{HandlerFn, HandlerReply, IpcEvent, ListenerFn};
pub use exposed::{ExposedApi, ExposedApiError, ExposedApiManifest, ExposedEntry, ExposedKind};
