//! Bridge configuration

use boundary_policy::ErrorExposure;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Default limit on outstanding round trips per bridge
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Settings for a [`crate::MessageBridge`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Timeout for `send_sync`, in milliseconds; `None` waits forever
    pub sync_timeout_ms: Option<u64>,
    /// Round trips allowed in flight before `TooManyPendingCalls`; at least 1
    #[serde(deserialize_with = "at_least_one")]
    pub max_pending_calls: usize,
    /// Overrides the policy's error exposure for every direction
    pub error_exposure: Option<ErrorExposure>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: None,
            max_pending_calls: DEFAULT_MAX_PENDING,
            error_exposure: None,
        }
    }
}

impl BridgeConfig {
    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_max_pending_calls(mut self, max: usize) -> Self {
        self.max_pending_calls = max.max(1);
        self
    }

    pub fn with_error_exposure(mut self, exposure: ErrorExposure) -> Self {
        self.error_exposure = Some(exposure);
        self
    }

    /// Parses a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads `BRIDGE_MAX_PENDING` and `BRIDGE_SYNC_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`BridgeConfig::from_env`], with a custom variable source
    ///
    /// Unparseable or zero values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(max) = parse_positive(&lookup, "BRIDGE_MAX_PENDING") {
            config.max_pending_calls = max as usize;
        }
        if let Some(timeout_ms) = parse_positive(&lookup, "BRIDGE_SYNC_TIMEOUT_MS") {
            config.sync_timeout_ms = Some(timeout_ms);
        }
        config
    }
}

fn at_least_one<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    match usize::deserialize(deserializer)? {
        0 => Err(serde::de::Error::custom("max_pending_calls must be at least 1")),
        value => Ok(value),
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(variable = name, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}
