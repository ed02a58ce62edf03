//! Wire representation of values crossing the process boundary

use core_types::PortId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serializable value tree
///
/// Produced only by [`crate::codec::encode`], so it is always acyclic and
/// never contains functions or symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum WireValue {
    /// Explicit marker for an undefined slot
    Hole,
    Null,
    Bool(bool),
    Number(f64),
    /// NaN and infinities, which JSON cannot carry as numbers
    NonFinite(NonFinite),
    Integer(i64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(Vec<(String, WireValue)>),
    Error(WireError),
    /// Moved endpoint; the receiver adopts the port with this id
    Port(PortId),
}

impl WireValue {
    /// Returns the kind of this value (used for payload shape checks)
    pub fn kind(&self) -> ValueKind {
        match self {
            WireValue::Hole => ValueKind::Undefined,
            WireValue::Null => ValueKind::Null,
            WireValue::Bool(_) => ValueKind::Bool,
            WireValue::Number(_) | WireValue::NonFinite(_) => ValueKind::Number,
            WireValue::Integer(_) => ValueKind::Integer,
            WireValue::String(_) => ValueKind::String,
            WireValue::Bytes(_) => ValueKind::Bytes,
            WireValue::List(_) => ValueKind::List,
            WireValue::Map(_) => ValueKind::Map,
            WireValue::Error(_) => ValueKind::Error,
            WireValue::Port(_) => ValueKind::Port,
        }
    }
}

/// Non-finite IEEE-754 values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NonFinite {
    Nan,
    PositiveInfinity,
    NegativeInfinity,
}

impl NonFinite {
    /// Classifies a float, returning `None` for finite values
    pub fn classify(value: f64) -> Option<Self> {
        if value.is_nan() {
            Some(NonFinite::Nan)
        } else if value == f64::INFINITY {
            Some(NonFinite::PositiveInfinity)
        } else if value == f64::NEG_INFINITY {
            Some(NonFinite::NegativeInfinity)
        } else {
            None
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            NonFinite::Nan => f64::NAN,
            NonFinite::PositiveInfinity => f64::INFINITY,
            NonFinite::NegativeInfinity => f64::NEG_INFINITY,
        }
    }
}

/// Serialized error record
///
/// The `__isBridgeError` marker distinguishes a serialized error from an
/// application map that happens to have `name`/`message`/`stack` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    #[serde(rename = "__isBridgeError", default)]
    pub is_bridge_error: bool,
}

impl WireError {
    /// Creates a marked error record
    pub fn new(name: impl Into<String>, message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack,
            is_bridge_error: true,
        }
    }

    /// Drops the stack trace
    pub fn redacted(mut self) -> Self {
        self.stack = None;
        self
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Coarse kind of a value, as seen by boundary checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Undefined,
    Null,
    Bool,
    Number,
    Integer,
    String,
    Bytes,
    List,
    Map,
    Error,
    Port,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::Integer => "integer",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::Error => "error",
            ValueKind::Port => "port",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_value_json_tagging() {
        let json = serde_json::to_value(WireValue::String("hi".into())).unwrap();
        assert_eq!(json["type"], "string");
        assert_eq!(json["value"], "hi");

        let hole = serde_json::to_value(WireValue::Hole).unwrap();
        assert_eq!(hole["type"], "hole");
    }

    #[test]
    fn test_non_finite_classification() {
        assert_eq!(NonFinite::classify(1.5), None);
        assert_eq!(NonFinite::classify(f64::NAN), Some(NonFinite::Nan));
        assert_eq!(
            NonFinite::classify(f64::NEG_INFINITY),
            Some(NonFinite::NegativeInfinity)
        );
        assert!(NonFinite::Nan.to_f64().is_nan());
    }

    #[test]
    fn test_wire_error_marker_defaults_to_false() {
        let json = r#"{"name":"Error","message":"m","stack":null}"#;
        let error: WireError = serde_json::from_str(json).unwrap();
        assert!(!error.is_bridge_error);
        assert!(WireError::new("Error", "m", None).is_bridge_error);
    }

    #[test]
    fn test_wire_error_redaction() {
        let error = WireError::new("Error", "boom", Some("Error: boom\n    at x".into()));
        assert_eq!(error.clone().redacted().stack, None);
        assert_eq!(format!("{}", error), "Error: boom");
    }

    #[test]
    fn test_value_kinds() {
        assert_eq!(WireValue::Integer(1).kind(), ValueKind::Integer);
        assert_eq!(WireValue::NonFinite(NonFinite::Nan).kind(), ValueKind::Number);
        assert_eq!(WireValue::Port(PortId::new()).kind(), ValueKind::Port);
    }
}
