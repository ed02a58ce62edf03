//! Pending round trips
//!
//! Every `invoke` and `send_sync` registers a slot under a fresh
//! [`CorrelationId`]. The slot is settled exactly once: by the matching
//! reply, by the peer going away, or by the bridge closing. Abandoned slots
//! are removed, so a late reply finds nothing and is ignored.

use crate::error::BridgeError;
use core_types::ProcessRef;
use ipc::{CorrelationId, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// How the caller waits for the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// The caller blocks in a nested pump
    Sync,
    /// The caller holds an [`Invocation`]
    Async,
}

#[derive(Default)]
struct CallSlot {
    outcome: Option<Result<Value, BridgeError>>,
    waker: Option<Waker>,
}

impl CallSlot {
    fn settle(&mut self, outcome: Result<Value, BridgeError>) {
        self.outcome = Some(outcome);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

type SharedSlot = Rc<RefCell<CallSlot>>;

struct PendingCall {
    peer: ProcessRef,
    channel: String,
    slot: SharedSlot,
}

/// Outstanding round trips of one bridge
pub struct PendingCalls {
    next_id: u64,
    max_pending: usize,
    calls: HashMap<CorrelationId, PendingCall>,
}

impl PendingCalls {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_id: 1,
            max_pending,
            calls: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn register(
        &mut self,
        peer: ProcessRef,
        channel: &str,
        mode: CallMode,
    ) -> Result<(CorrelationId, SharedSlot), BridgeError> {
        if self.calls.len() >= self.max_pending {
            tracing::warn!(
                pending_len = self.calls.len(),
                max_pending = self.max_pending,
                "too many pending calls; refusing new call"
            );
            return Err(BridgeError::TooManyPendingCalls(self.max_pending));
        }

        let id = CorrelationId::from_raw(self.next_id);
        self.next_id += 1;
        let slot = SharedSlot::default();
        self.calls.insert(
            id,
            PendingCall {
                peer,
                channel: channel.to_string(),
                slot: Rc::clone(&slot),
            },
        );
        tracing::debug!(correlation_id = %id, %peer, channel, ?mode, "registered pending call");
        Ok((id, slot))
    }

    /// Settles a call with a reply from `from`
    ///
    /// Returns false when the reply was ignored: unknown id (abandoned or
    /// timed out) or a sender other than the call's target.
    pub fn resolve(
        &mut self,
        id: CorrelationId,
        from: ProcessRef,
        outcome: Result<Value, BridgeError>,
    ) -> bool {
        match self.calls.get(&id) {
            None => {
                tracing::debug!(correlation_id = %id, %from, "ignoring reply for unknown call");
                false
            }
            Some(call) if call.peer != from => {
                tracing::warn!(
                    correlation_id = %id,
                    expected = %call.peer,
                    %from,
                    "ignoring reply from unexpected process"
                );
                false
            }
            Some(_) => {
                if let Some(call) = self.calls.remove(&id) {
                    call.slot.borrow_mut().settle(outcome);
                }
                true
            }
        }
    }

    /// Forgets a call; its reply will be ignored
    pub fn abandon(&mut self, id: CorrelationId) -> bool {
        match self.calls.remove(&id) {
            Some(call) => {
                tracing::debug!(correlation_id = %id, channel = %call.channel, "abandoned call");
                true
            }
            None => false,
        }
    }

    /// Rejects every call targeting `peer` with `PeerGone`
    pub fn reject_peer(&mut self, peer: ProcessRef) -> usize {
        let ids: Vec<CorrelationId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(call) = self.calls.remove(id) {
                call.slot
                    .borrow_mut()
                    .settle(Err(BridgeError::PeerGone(peer)));
            }
        }
        ids.len()
    }

    /// Rejects every outstanding call with `error`
    pub fn reject_all(&mut self, error: BridgeError) -> usize {
        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            call.slot.borrow_mut().settle(Err(error.clone()));
        }
        count
    }
}

impl fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCalls")
            .field("next_id", &self.next_id)
            .field("pending", &self.calls.len())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

/// Registers a call and returns the handle that waits for it
pub(crate) fn register_call(
    calls: &Rc<RefCell<PendingCalls>>,
    peer: ProcessRef,
    channel: &str,
    mode: CallMode,
) -> Result<Invocation, BridgeError> {
    let (id, slot) = calls.borrow_mut().register(peer, channel, mode)?;
    Ok(Invocation {
        id,
        channel: channel.to_string(),
        slot,
        calls: Rc::downgrade(calls),
        finished: false,
    })
}

/// Result of an `invoke`
///
/// Resolves with the handler's return value or rejects with the remote
/// error. Dropping it abandons the call; the request itself is not
/// retracted.
pub struct Invocation {
    id: CorrelationId,
    channel: String,
    slot: SharedSlot,
    calls: Weak<RefCell<PendingCalls>>,
    finished: bool,
}

impl Invocation {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// True once the outcome is available
    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }

    /// Takes the outcome if it has arrived
    pub fn try_result(&mut self) -> Option<Result<Value, BridgeError>> {
        let outcome = self.slot.borrow_mut().outcome.take();
        if outcome.is_some() {
            self.finished = true;
        }
        outcome
    }

    /// Stops waiting; a late reply will be ignored
    pub fn abandon(self) {}
}

impl Future for Invocation {
    type Output = Result<Value, BridgeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Err(BridgeError::Abandoned));
        }
        let mut slot = this.slot.borrow_mut();
        match slot.outcome.take() {
            Some(outcome) => {
                drop(slot);
                this.finished = true;
                Poll::Ready(outcome)
            }
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(calls) = self.calls.upgrade() {
            if let Ok(mut calls) = calls.try_borrow_mut() {
                calls.abandon(self.id);
            }
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("settled", &self.is_settled())
            .finish()
    }
}
