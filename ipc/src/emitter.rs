//! Ordered listener lists
//!
//! Shared by the bridge registries and by [`crate::MessagePort`], which embed
//! a [`Listeners`] value instead of inheriting emitter behaviour.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when a listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({})", self.0)
    }
}

struct Entry<F: ?Sized> {
    id: ListenerId,
    once: bool,
    listener: Rc<F>,
}

/// Listeners in registration order
pub struct Listeners<F: ?Sized> {
    entries: Vec<Entry<F>>,
}

impl<F: ?Sized> Listeners<F> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a listener
    pub fn add(&mut self, listener: Rc<F>) -> ListenerId {
        self.push(listener, false)
    }

    /// Appends a listener that is removed after it fires once
    pub fn add_once(&mut self, listener: Rc<F>) -> ListenerId {
        self.push(listener, true)
    }

    fn push(&mut self, listener: Rc<F>, once: bool) -> ListenerId {
        let id = ListenerId::next();
        self.entries.push(Entry { id, once, listener });
        id
    }

    /// Removes a listener; returns false if it was not registered
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes the listeners to call for one emission
    ///
    /// One-shot listeners are removed here, before any of them runs, so a
    /// re-entrant emission cannot fire them twice. Callers must not hold the
    /// surrounding borrow while invoking the returned listeners.
    pub fn snapshot(&mut self) -> Vec<Rc<F>> {
        let listeners = self
            .entries
            .iter()
            .map(|entry| Rc::clone(&entry.listener))
            .collect();
        self.entries.retain(|entry| !entry.once);
        listeners
    }
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for Listeners<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Something listeners can be attached to
pub trait Subscribable {
    type Event;

    fn subscribe(&self, listener: Rc<dyn Fn(&Self::Event)>) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;
}
