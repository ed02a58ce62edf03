//! Process roles and their privilege ordering

use serde::{Deserialize, Serialize};
use std::fmt;

/// Privilege class of a process
///
/// Ordering follows privilege: `Content < Worker < Controller`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// Isolated, sandboxed script host
    Content,
    /// Detached auxiliary process
    Worker,
    /// Privileged owner of application lifecycle and native capabilities
    Controller,
}

impl ProcessRole {
    /// Returns true for the controller role
    pub fn is_privileged(&self) -> bool {
        matches!(self, ProcessRole::Controller)
    }

    /// Returns true for sandboxed content
    pub fn is_untrusted(&self) -> bool {
        matches!(self, ProcessRole::Content)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Content => write!(f, "content"),
            ProcessRole::Worker => write!(f, "worker"),
            ProcessRole::Controller => write!(f, "controller"),
        }
    }
}
