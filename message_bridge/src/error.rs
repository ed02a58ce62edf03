//! Bridge error types

use core_types::ProcessRef;
use ipc::{ErrorValue, SerializationError, TransportError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`crate::MessageBridge`] operations
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Arguments or a return value could not be encoded
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The peer terminated before answering
    #[error("Peer {0} is gone")]
    PeerGone(ProcessRef),

    #[error("Call to '{channel}' timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("Attempted to register a second handler for '{0}'")]
    DuplicateInvoker(String),

    #[error("Removing all listeners from the process-wide registry is not allowed")]
    ProtectedRegistryMutation,

    /// The remote handler failed; `error` is the reconstructed remote error
    #[error("Error invoking remote method '{channel}': {error}")]
    HandlerExecution { channel: String, error: ErrorValue },

    #[error("Message on '{channel}' denied by {policy}: {reason}")]
    Denied {
        channel: String,
        policy: String,
        reason: String,
    },

    #[error("Channel '{0}' is reserved for the bridge")]
    ReservedChannel(String),

    #[error("Too many pending calls (limit {0})")]
    TooManyPendingCalls(usize),

    #[error("Call was abandoned")]
    Abandoned,

    #[error("Bridge is closed")]
    Closed,

    #[error(transparent)]
    Transport(TransportError),
}

impl BridgeError {
    /// The remote error, for `HandlerExecution`
    pub fn remote_error(&self) -> Option<&ErrorValue> {
        match self {
            BridgeError::HandlerExecution { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::PeerGone(peer) => BridgeError::PeerGone(peer),
            TransportError::Closed(_) => BridgeError::Closed,
            other => BridgeError::Transport(other),
        }
    }
}

/// Registry mutation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Attempted to register a second handler for '{0}'")]
    DuplicateInvoker(String),

    #[error("Removing all listeners from the process-wide registry is not allowed")]
    ProtectedRegistryMutation,
}

impl From<RegistryError> for BridgeError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::DuplicateInvoker(channel) => BridgeError::DuplicateInvoker(channel),
            RegistryError::ProtectedRegistryMutation => BridgeError::ProtectedRegistryMutation,
        }
    }
}
