//! Host configuration

use serde::Deserialize;

/// Default number of deliveries an inbox holds before senders get
/// `InboxFull`
pub const DEFAULT_INBOX_CAPACITY: usize = 65_536;

/// Settings for a [`crate::ProcessHost`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Maximum queued messages per process
    pub inbox_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

impl HostConfig {
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    /// Parses a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
