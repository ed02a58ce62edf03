//! # Core Types
//!
//! This crate defines the fundamental types shared by every participant of
//! the messaging bridge.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: Every endpoint carries a typed identity.
//! - **Privilege is part of identity**: A process reference always knows
//!   which role (controller, content, worker) it was spawned with.
//!
//! ## Key Types
//!
//! - [`ProcessRef`]: Opaque identifier of a communicating process
//! - [`ProcessRole`]: Privilege class of a process
//! - [`PortId`]: Identifier of one end of a private sub-channel

pub mod ids;
pub mod role;

pub use ids::{PortId, ProcessRef};
pub use role::ProcessRole;
