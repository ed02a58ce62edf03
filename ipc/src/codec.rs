//! Value codec
//!
//! Encoding walks a [`Value`] depth-first and produces a [`WireValue`] tree
//! plus the list of ports that move with it. Decoding is infallible: every
//! wire tree maps to some value.

use crate::message::MessagePayload;
use crate::port::MessagePort;
use crate::value::{ErrorValue, Value};
use crate::wire::{NonFinite, WireError, WireValue};
use core_types::PortId;
use std::collections::HashSet;
use std::fmt::Write as _;
use thiserror::Error;

/// Maximum nesting of lists, maps and errors in one value.
///
/// Each level costs up to three levels of JSON nesting in the payload,
/// which must stay below the JSON reader's recursion limit.
pub const MAX_DEPTH: usize = 32;

/// Why a value could not be encoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationFailure {
    #[error("cyclic reference")]
    Cyclic,

    #[error("function '{0}' cannot be cloned")]
    Function(String),

    #[error("symbol '{0}' cannot be cloned")]
    Symbol(String),

    #[error("port has already been transferred")]
    NeuteredPort,

    #[error("port is transferred more than once")]
    DuplicatePort,

    #[error("a port cannot be transferred through itself")]
    SourcePort,

    #[error("nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("payload encoding failed: {0}")]
    Payload(String),
}

/// A value that cannot cross the boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("An object could not be cloned: {reason} at {path}")]
pub struct SerializationError {
    /// Location of the offending value, e.g. `args[1].items[0]`
    pub path: String,
    pub reason: SerializationFailure,
}

impl SerializationError {
    pub fn new(path: impl Into<String>, reason: SerializationFailure) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }

    fn payload(error: serde_json::Error) -> Self {
        Self::new("payload", SerializationFailure::Payload(error.to_string()))
    }
}

/// Result of a successful encode
///
/// Ports listed in `transfers` are still owned by the sender; the caller
/// commits the move once the message is about to leave.
#[derive(Debug)]
pub struct Encoded {
    values: Vec<WireValue>,
    transfers: Vec<MessagePort>,
}

impl Encoded {
    pub fn values(&self) -> &[WireValue] {
        &self.values
    }

    /// Ports that move with this message
    pub fn transfers(&self) -> &[MessagePort] {
        &self.transfers
    }

    pub fn transfer_ids(&self) -> Vec<PortId> {
        self.transfers.iter().map(MessagePort::id).collect()
    }

    /// Serializes the argument list into a payload
    pub fn payload(&self) -> Result<MessagePayload, SerializationError> {
        MessagePayload::new(&self.values).map_err(SerializationError::payload)
    }

    /// Splits into the wire values and the ports to transfer
    pub fn into_parts(self) -> (Vec<WireValue>, Vec<MessagePort>) {
        (self.values, self.transfers)
    }
}

/// Hands out local handles for ports arriving in a decoded value
pub trait PortAdopter {
    fn adopt(&self, id: PortId) -> MessagePort;
}

enum Segment {
    Root(&'static str),
    Index(usize),
    Key(String),
}

struct Encoder {
    path: Vec<Segment>,
    active: Vec<*const ()>,
    transfers: Vec<MessagePort>,
    seen_ports: HashSet<PortId>,
    source_port: Option<PortId>,
}

impl Encoder {
    fn new(source_port: Option<PortId>) -> Self {
        Self {
            path: Vec::new(),
            active: Vec::new(),
            transfers: Vec::new(),
            seen_ports: HashSet::new(),
            source_port,
        }
    }

    fn path_string(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            match segment {
                Segment::Root(name) => out.push_str(name),
                Segment::Index(index) => {
                    let _ = write!(out, "[{}]", index);
                }
                Segment::Key(key) => {
                    out.push('.');
                    out.push_str(key);
                }
            }
        }
        out
    }

    fn fail(&self, reason: SerializationFailure) -> SerializationError {
        SerializationError::new(self.path_string(), reason)
    }

    fn enter(&mut self, ptr: *const ()) -> Result<(), SerializationError> {
        if self.active.contains(&ptr) {
            return Err(self.fail(SerializationFailure::Cyclic));
        }
        if self.active.len() >= MAX_DEPTH {
            return Err(self.fail(SerializationFailure::TooDeep(MAX_DEPTH)));
        }
        self.active.push(ptr);
        Ok(())
    }

    fn encode_child(
        &mut self,
        segment: Segment,
        value: &Value,
    ) -> Result<WireValue, SerializationError> {
        self.path.push(segment);
        let encoded = self.encode(value)?;
        self.path.pop();
        Ok(encoded)
    }

    fn encode(&mut self, value: &Value) -> Result<WireValue, SerializationError> {
        let wire = match value {
            Value::Undefined => WireValue::Hole,
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Number(n) => match NonFinite::classify(*n) {
                Some(special) => WireValue::NonFinite(special),
                None => WireValue::Number(*n),
            },
            Value::Integer(i) => WireValue::Integer(*i),
            Value::String(s) => WireValue::String(s.clone()),
            Value::Bytes(bytes) => WireValue::Bytes(bytes.clone()),
            Value::List(list) => {
                self.enter(list.as_ptr())?;
                let items = list.to_vec();
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    out.push(self.encode_child(Segment::Index(index), item)?);
                }
                self.active.pop();
                WireValue::List(out)
            }
            Value::Map(map) => {
                self.enter(map.as_ptr())?;
                let entries = map.entries();
                let mut out = Vec::with_capacity(entries.len());
                for (key, item) in &entries {
                    let encoded = self.encode_child(Segment::Key(key.clone()), item)?;
                    out.push((key.clone(), encoded));
                }
                self.active.pop();
                WireValue::Map(out)
            }
            Value::Error(error) => WireValue::Error(WireError::new(
                error.name.clone(),
                error.message.clone(),
                error.stack.clone(),
            )),
            Value::Port(port) => {
                let id = port.id();
                if self.source_port == Some(id) {
                    return Err(self.fail(SerializationFailure::SourcePort));
                }
                if port.is_neutered() {
                    return Err(self.fail(SerializationFailure::NeuteredPort));
                }
                if !self.seen_ports.insert(id) {
                    return Err(self.fail(SerializationFailure::DuplicatePort));
                }
                self.transfers.push(port.clone());
                WireValue::Port(id)
            }
            Value::Function(callable) => {
                return Err(self.fail(SerializationFailure::Function(callable.name().to_string())))
            }
            Value::Symbol(description) => {
                return Err(self.fail(SerializationFailure::Symbol(description.clone())))
            }
        };
        Ok(wire)
    }

    fn finish(self, values: Vec<WireValue>) -> Encoded {
        Encoded {
            values,
            transfers: self.transfers,
        }
    }
}

/// Encodes a single value
pub fn encode(value: &Value) -> Result<Encoded, SerializationError> {
    let mut encoder = Encoder::new(None);
    let wire = encoder.encode_child(Segment::Root("value"), value)?;
    Ok(encoder.finish(vec![wire]))
}

/// Encodes an argument list; paths are reported as `args[i]...`
pub fn encode_args(args: &[Value]) -> Result<Encoded, SerializationError> {
    let mut encoder = Encoder::new(None);
    let mut values = Vec::with_capacity(args.len());
    for (index, arg) in args.iter().enumerate() {
        encoder.path.push(Segment::Root("args"));
        values.push(encoder.encode_child(Segment::Index(index), arg)?);
        encoder.path.pop();
    }
    Ok(encoder.finish(values))
}

/// Encodes a message posted on `source`, which may not carry itself
pub fn encode_port_message(value: &Value, source: PortId) -> Result<Encoded, SerializationError> {
    let mut encoder = Encoder::new(Some(source));
    let wire = encoder.encode_child(Segment::Root("message"), value)?;
    Ok(encoder.finish(vec![wire]))
}

/// Decodes a wire value, adopting any ports it carries
pub fn decode(wire: &WireValue, adopter: &dyn PortAdopter) -> Value {
    match wire {
        WireValue::Hole => Value::Undefined,
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(*b),
        WireValue::Number(n) => Value::Number(*n),
        WireValue::NonFinite(special) => Value::Number(special.to_f64()),
        WireValue::Integer(i) => Value::Integer(*i),
        WireValue::String(s) => Value::String(s.clone()),
        WireValue::Bytes(bytes) => Value::Bytes(bytes.clone()),
        WireValue::List(items) => Value::list(items.iter().map(|item| decode(item, adopter))),
        WireValue::Map(entries) => Value::map(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), decode(item, adopter))),
        ),
        WireValue::Error(error) if error.is_bridge_error => Value::Error(ErrorValue::bridged(
            error.name.clone(),
            error.message.clone(),
            error.stack.clone(),
        )),
        // Unmarked records are application data that merely look like errors.
        WireValue::Error(error) => Value::map([
            ("name", Value::String(error.name.clone())),
            ("message", Value::String(error.message.clone())),
            (
                "stack",
                error
                    .stack
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Undefined),
            ),
        ]),
        WireValue::Port(id) => Value::Port(adopter.adopt(*id)),
    }
}

/// Decodes an argument-list payload
pub fn decode_args(
    payload: &MessagePayload,
    adopter: &dyn PortAdopter,
) -> Result<Vec<Value>, SerializationError> {
    let wire: Vec<WireValue> = payload
        .deserialize()
        .map_err(SerializationError::payload)?;
    Ok(wire.iter().map(|item| decode(item, adopter)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::List;
    use proptest::prelude::*;

    struct Detached;

    impl PortAdopter for Detached {
        fn adopt(&self, id: PortId) -> MessagePort {
            MessagePort::detached(id)
        }
    }

    fn roundtrip(value: &Value) -> Value {
        let encoded = encode(value).unwrap();
        let payload = encoded.payload().unwrap();
        let mut values = decode_args(&payload, &Detached).unwrap();
        values.remove(0)
    }

    #[test]
    fn test_primitives_roundtrip() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Number(1.25),
            Value::Integer(-42),
            Value::String("héllo".into()),
            Value::Bytes(vec![0, 1, 255]),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn test_non_finite_numbers_survive_json() {
        assert!(roundtrip(&Value::Number(f64::NAN)).as_f64().unwrap().is_nan());
        assert_eq!(
            roundtrip(&Value::Number(f64::INFINITY)),
            Value::Number(f64::INFINITY)
        );
    }

    #[test]
    fn test_holes_in_lists_are_preserved() {
        let value = Value::list([Value::from(1), Value::Undefined, Value::from(3)]);
        let back = roundtrip(&value);
        assert_eq!(back.as_list().unwrap().len(), 3);
        assert_eq!(back.as_list().unwrap().get(1), Some(Value::Undefined));
    }

    #[test]
    fn test_map_order_is_preserved() {
        let value = Value::map([
            ("zeta", Value::from(1)),
            ("alpha", Value::from(2)),
            ("mid", Value::from(3)),
        ]);
        let back = roundtrip(&value);
        assert_eq!(
            back.as_map().unwrap().keys(),
            vec!["zeta".to_string(), "alpha".to_string(), "mid".to_string()]
        );
    }

    #[test]
    fn test_error_roundtrip_is_idempotent() {
        let error = Value::Error(ErrorValue::new("RangeError", "out of range"));
        let once = roundtrip(&error);
        let twice = roundtrip(&once);

        assert_eq!(once, error);
        assert_eq!(twice, error);
        assert!(once.as_error().unwrap().is_bridged());
    }

    #[test]
    fn test_unmarked_error_record_decodes_as_map() {
        let wire = WireValue::Error(WireError {
            name: "Error".into(),
            message: "looks like an error".into(),
            stack: None,
            is_bridge_error: false,
        });
        let value = decode(&wire, &Detached);
        assert_eq!(value.get("message"), Some(Value::from("looks like an error")));
        assert!(value.as_error().is_none());
    }

    #[test]
    fn test_cycle_is_rejected_with_path() {
        let parent = Value::map([("name", Value::from("root"))]);
        let child = Value::map([("parent", parent.clone())]);
        parent.as_map().unwrap().insert("child", child);

        let error = encode_args(&[Value::from(1), parent]).unwrap_err();
        assert_eq!(error.reason, SerializationFailure::Cyclic);
        assert_eq!(error.path, "args[1].child.parent");
    }

    #[test]
    fn test_self_referencing_list_is_rejected() {
        let list = List::new();
        list.push(Value::List(list.clone()));
        let error = encode(&Value::List(list)).unwrap_err();
        assert_eq!(error.reason, SerializationFailure::Cyclic);
    }

    #[test]
    fn test_shared_acyclic_references_are_copied() {
        let shared = Value::list([Value::from("x")]);
        let value = Value::map([("a", shared.clone()), ("b", shared)]);
        let back = roundtrip(&value);
        assert_eq!(back.get("a"), back.get("b"));
    }

    #[test]
    fn test_functions_and_symbols_are_rejected() {
        let value = Value::map([("cb", Value::function("onDone", |_| Value::Null))]);
        let error = encode(&value).unwrap_err();
        assert_eq!(error.path, "value.cb");
        assert_eq!(
            error.reason,
            SerializationFailure::Function("onDone".to_string())
        );
        assert!(error.to_string().starts_with("An object could not be cloned"));

        let error = encode_args(&[Value::Symbol("tag".into())]).unwrap_err();
        assert_eq!(error.path, "args[0]");
    }

    #[test]
    fn test_excessive_depth_is_rejected() {
        let mut value = Value::from(0);
        for _ in 0..(MAX_DEPTH + 1) {
            value = Value::list([value]);
        }
        let error = encode(&value).unwrap_err();
        assert_eq!(error.reason, SerializationFailure::TooDeep(MAX_DEPTH));
    }

    #[test]
    fn test_max_depth_payload_decodes() {
        let mut value = Value::from(0);
        for depth in 0..MAX_DEPTH {
            value = if depth % 2 == 0 {
                Value::map([("k", value)])
            } else {
                Value::list([value])
            };
        }
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_neutered_port_is_rejected() {
        let port = MessagePort::detached(PortId::new());
        let error = encode(&Value::Port(port)).unwrap_err();
        assert_eq!(error.reason, SerializationFailure::NeuteredPort);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            Just(Value::Undefined),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            (-1.0e9f64..1.0e9).prop_map(Value::Number),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::list),
                proptest::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|entries| {
                    let mut seen = HashSet::new();
                    Value::map(
                        entries
                            .into_iter()
                            .filter(|(key, _)| seen.insert(key.clone())),
                    )
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_decode_encode_is_identity(value in arb_value()) {
            prop_assert_eq!(roundtrip(&value), value);
        }

        #[test]
        fn prop_args_keep_their_positions(args in proptest::collection::vec(arb_value(), 0..5)) {
            let encoded = encode_args(&args).unwrap();
            let decoded = decode_args(&encoded.payload().unwrap(), &Detached).unwrap();
            prop_assert_eq!(decoded, args);
        }
    }
}
