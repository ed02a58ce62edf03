//! Local task set
//!
//! Async handlers run on the bridge's own thread. Their wakers interrupt the
//! process's blocking `receive`, so the event loop gets a chance to poll
//! them again.

use core_types::ProcessRef;
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::task::ArcWake;
use ipc::Transport;
use std::cell::RefCell;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Wakes a process blocked in `Transport::receive`
pub(crate) struct InboxWaker {
    transport: Arc<dyn Transport>,
    process: ProcessRef,
}

impl InboxWaker {
    pub(crate) fn waker(transport: Arc<dyn Transport>, process: ProcessRef) -> Waker {
        futures::task::waker(Arc::new(Self { transport, process }))
    }
}

impl ArcWake for InboxWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.transport.wake(arc_self.process);
    }
}

#[derive(Default)]
pub(crate) struct LocalTasks {
    running: RefCell<FuturesUnordered<LocalBoxFuture<'static, ()>>>,
    incoming: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
}

impl LocalTasks {
    /// Queues a task; it is first polled by the next `poll`
    pub(crate) fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        self.incoming.borrow_mut().push(task);
    }

    pub(crate) fn len(&self) -> usize {
        let running = self.running.try_borrow().map_or(0, |running| running.len());
        running + self.incoming.borrow().len()
    }

    /// Polls every ready task; returns how many finished
    ///
    /// Re-entrant calls (a task pumping the bridge) return immediately.
    pub(crate) fn poll(&self, waker: &Waker) -> usize {
        let Ok(mut running) = self.running.try_borrow_mut() else {
            return 0;
        };
        let mut cx = Context::from_waker(waker);
        let mut finished = 0;
        loop {
            let spawned: Vec<_> = self.incoming.borrow_mut().drain(..).collect();
            let had_new = !spawned.is_empty();
            running.extend(spawned);
            while let Poll::Ready(Some(())) = running.poll_next_unpin(&mut cx) {
                finished += 1;
            }
            if !had_new && self.incoming.borrow().is_empty() {
                break;
            }
        }
        finished
    }

    /// Drops every task without running it further
    pub(crate) fn clear(&self) {
        self.incoming.borrow_mut().clear();
        if let Ok(mut running) = self.running.try_borrow_mut() {
            running.clear();
        }
    }
}
