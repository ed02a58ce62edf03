//! Per-process inbox
//!
//! Bounded FIFO of deliveries guarded by one lock. Events and requests
//! respect the capacity; replies, lifecycle notices and migrated port
//! traffic do not, since dropping them would leave calls or ports hanging.

use core_types::PortId;
use ipc::{Delivery, MessageKind, Wait};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Why a push was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxError {
    Full,
    Closed,
}

#[derive(Debug)]
struct InboxState {
    capacity: usize,
    queue: VecDeque<Delivery>,
    woken: bool,
    closed: bool,
}

/// Deliveries waiting for one process
#[derive(Debug)]
pub struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
}

impl Inbox {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InboxState {
                capacity,
                queue: VecDeque::new(),
                woken: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Checks that one more application message fits
    pub fn ensure_room(&self) -> Result<(), InboxError> {
        let state = self.state.lock();
        if state.closed {
            return Err(InboxError::Closed);
        }
        if state.queue.len() >= state.capacity {
            return Err(InboxError::Full);
        }
        Ok(())
    }

    /// Pushes an application message, respecting capacity
    pub fn push(&self, delivery: Delivery) -> Result<(), InboxError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(InboxError::Closed);
        }
        if state.queue.len() >= state.capacity {
            return Err(InboxError::Full);
        }
        state.queue.push_back(delivery);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Pushes regardless of capacity; a closed inbox drops the delivery
    pub fn push_unbounded(&self, delivery: Delivery) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.queue.push_back(delivery);
        drop(state);
        self.ready.notify_one();
    }

    /// Takes the next delivery
    ///
    /// Returns `Ok(None)` when the wait runs out or the inbox is woken, and
    /// `Err(InboxError::Closed)` once the inbox has been closed.
    pub fn pop(&self, wait: Wait) -> Result<Option<Delivery>, InboxError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(InboxError::Closed);
            }
            if let Some(delivery) = state.queue.pop_front() {
                return Ok(Some(delivery));
            }
            if state.woken {
                state.woken = false;
                return Ok(None);
            }
            match wait {
                Wait::Immediate => return Ok(None),
                Wait::Block => self.ready.wait(&mut state),
                Wait::Until(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        if state.closed {
                            return Err(InboxError::Closed);
                        }
                        return Ok(state.queue.pop_front());
                    }
                }
            }
        }
    }

    /// Interrupts a blocked `pop`; the next empty `pop` returns `None` once
    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.ready.notify_all();
    }

    /// Closes the inbox and discards everything queued
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.ready.notify_all();
    }

    /// Removes and returns queued traffic for `port`, in order
    pub fn drain_port(&self, port: PortId) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(state.queue.len());
        for delivery in state.queue.drain(..) {
            let for_port = match &delivery {
                Delivery::Message(envelope) => {
                    envelope.kind == MessageKind::Port && envelope.port == Some(port)
                }
                Delivery::PortClosed(id) => *id == port,
                Delivery::PeerGone(_) => false,
            };
            if for_port {
                drained.push(delivery);
            } else {
                kept.push_back(delivery);
            }
        }
        state.queue = kept;
        drained
    }
}
