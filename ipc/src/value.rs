//! In-process values
//!
//! Lists and maps are shared, mutable cells, the same way script objects are
//! shared by reference inside one process. That makes cyclic graphs
//! constructible, which is exactly what the encoder has to reject.

use crate::port::MessagePort;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A value living inside one process
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Integer(i64),
    String(String),
    Bytes(Vec<u8>),
    List(List),
    Map(Map),
    Error(ErrorValue),
    /// Transferable endpoint; moved, not copied, when sent
    Port(MessagePort),
    /// Never crosses the boundary
    Function(Callable),
    /// Never crosses the boundary
    Symbol(String),
}

impl Value {
    /// Builds a list value from its items
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(List::from_vec(items.into_iter().collect()))
    }

    /// Builds a map value from key/value pairs
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let map = Map::new();
        for (key, value) in entries {
            map.insert(key, value);
        }
        Value::Map(map)
    }

    /// Wraps a closure as a function value
    pub fn function(name: impl Into<String>, f: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Value::Function(Callable::new(name, f))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn as_port(&self) -> Option<&MessagePort> {
        match self {
            Value::Port(port) => Some(port),
            _ => None,
        }
    }

    /// Looks up a key when this value is a map
    pub fn get(&self, key: &str) -> Option<Value> {
        self.as_map().and_then(|map| map.get(key))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Port(a), Value::Port(b)) => a.id() == b.id(),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<ErrorValue> for Value {
    fn from(value: ErrorValue) -> Self {
        Value::Error(value)
    }
}

impl From<MessagePort> for Value {
    fn from(value: MessagePort) -> Self {
        Value::Port(value)
    }
}

// Debug output of shared containers stops at this depth so that printing a
// cyclic graph terminates.
const DEBUG_DEPTH_LIMIT: usize = 16;

thread_local! {
    static DEBUG_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn with_debug_depth(
    f: &mut fmt::Formatter<'_>,
    body: impl FnOnce(&mut fmt::Formatter<'_>) -> fmt::Result,
) -> fmt::Result {
    let depth = DEBUG_DEPTH.with(|d| d.get());
    if depth >= DEBUG_DEPTH_LIMIT {
        return f.write_str("...");
    }
    DEBUG_DEPTH.with(|d| d.set(depth + 1));
    let result = body(f);
    DEBUG_DEPTH.with(|d| d.set(depth));
    result
}

/// Shared, ordered list of values
#[derive(Clone, Default)]
pub struct List(Rc<RefCell<Vec<Value>>>);

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().push(value);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Snapshot of the current items
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    /// Identity of the underlying cell
    pub fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || *self.0.borrow() == *other.0.borrow()
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        with_debug_depth(f, |f| f.debug_list().entries(self.0.borrow().iter()).finish())
    }
}

/// Shared string-keyed map
///
/// Iteration follows insertion order; equality ignores it.
#[derive(Clone, Default)]
pub struct Map(Rc<RefCell<Vec<(String, Value)>>>);

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a key, keeping the original position on replace
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut entries = self.0.borrow_mut();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut entries = self.0.borrow_mut();
        let index = entries.iter().position(|(k, _)| k == key)?;
        Some(entries.remove(index).1)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Snapshot of the entries in insertion order
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0.borrow().clone()
    }

    /// Identity of the underlying cell
    pub fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let ours = self.0.borrow();
        let theirs = other.0.borrow();
        ours.len() == theirs.len()
            && ours.iter().all(|(key, value)| {
                theirs
                    .iter()
                    .find(|(k, _)| k == key)
                    .is_some_and(|(_, v)| v == value)
            })
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        with_debug_depth(f, |f| {
            f.debug_map()
                .entries(self.0.borrow().iter().map(|(k, v)| (k, v)))
                .finish()
        })
    }
}

/// Error value: name, message and stack
///
/// `bridged` marks errors reconstructed by the decoder. Identity and
/// concrete type of the original error are not preserved across the
/// boundary, only these three fields.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    bridged: bool,
}

impl ErrorValue {
    /// Creates an error whose stack starts with `name: message`
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let stack = Some(format!("{}: {}", name, message));
        Self {
            name,
            message,
            stack,
            bridged: false,
        }
    }

    /// Generic `Error` with a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// Converts any std error, recording its source chain in the stack
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        let mut value = Self::msg(error.to_string());
        let mut stack = value.stack.take().unwrap_or_default();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push_str("\n    caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        value.stack = Some(stack);
        value
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn without_stack(mut self) -> Self {
        self.stack = None;
        self
    }

    /// Rebuilds an error received from another process
    pub fn bridged(name: String, message: String, stack: Option<String>) -> Self {
        Self {
            name,
            message,
            stack,
            bridged: true,
        }
    }

    /// True when this error was reconstructed from the wire
    pub fn is_bridged(&self) -> bool {
        self.bridged
    }
}

impl PartialEq for ErrorValue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.message == other.message && self.stack == other.stack
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorValue {}

/// In-process function handle
#[derive(Clone)]
pub struct Callable {
    name: String,
    f: Rc<dyn Fn(&[Value]) -> Value>,
}

impl Callable {
    pub fn new(name: impl Into<String>, f: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Self {
            name: name.into(),
            f: Rc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.f)(args)
    }

    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Rc::ptr_eq(&self.f, &other.f)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function {}]", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_equality_ignores_order() {
        let a = Value::map([("x", Value::from(1)), ("y", Value::from("two"))]);
        let b = Value::map([("y", Value::from("two")), ("x", Value::from(1))]);
        assert_eq!(a, b);

        let keys = a.as_map().unwrap().keys();
        assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_map_insert_replaces_in_place() {
        let map = Map::new();
        map.insert("a", Value::from(1));
        map.insert("b", Value::from(2));
        map.insert("a", Value::from(3));
        assert_eq!(map.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(map.get("a"), Some(Value::from(3)));
        assert_eq!(map.remove("b"), Some(Value::from(2)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_integer_and_number_are_distinct() {
        assert_ne!(Value::Integer(1), Value::Number(1.0));
        assert_eq!(Value::Integer(1).as_f64(), Some(1.0));
    }

    #[test]
    fn test_debug_of_cyclic_list_terminates() {
        let list = List::new();
        list.push(Value::List(list.clone()));
        let printed = format!("{:?}", Value::List(list));
        assert!(printed.contains("..."));
    }

    #[test]
    fn test_error_value_stack_and_equality() {
        let error = ErrorValue::new("TypeError", "not a function");
        assert_eq!(error.stack.as_deref(), Some("TypeError: not a function"));
        assert!(!error.is_bridged());

        let bridged = ErrorValue::bridged(
            error.name.clone(),
            error.message.clone(),
            error.stack.clone(),
        );
        assert!(bridged.is_bridged());
        assert_eq!(bridged, error);
    }

    #[test]
    fn test_error_from_std_error_keeps_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let error = ErrorValue::from_error(&io);
        assert_eq!(error.name, "Error");
        assert_eq!(error.message, "disk gone");
    }

    #[test]
    fn test_function_values_compare_by_identity() {
        let f = Value::function("noop", |_| Value::Undefined);
        let g = Value::function("noop", |_| Value::Undefined);
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
        if let Value::Function(callable) = &f {
            assert_eq!(callable.name(), "noop");
            assert_eq!(callable.call(&[]), Value::Undefined);
        }
    }
}
