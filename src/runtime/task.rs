//! Work items executed by the dedicated thread.
//!
//! Two kinds of item flow through the scheduler queue:
//!
//! - [`CallTask`]: a closure, run once
//! - [`PollStep`]: one poll of a spawned future; every wake-up of the future
//!   enqueues a fresh step, so each poll happens on the dedicated thread

use core::fmt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;

use super::affinity::Shared;
use super::task_handle::Completion;
use crate::error::{Error, ErrorKind};
use crate::tracing_compat::trace;
use crate::types::TaskId;

/// A unit of work consumed exactly once by the dedicated thread.
pub(crate) trait Runnable: Send {
    /// The task this item belongs to.
    fn task_id(&self) -> TaskId;

    /// Executes the item. Returns `true` when the task is finished.
    fn run(self: Box<Self>) -> bool;

    /// Fails the task without executing it.
    fn abandon(self: Box<Self>, err: Error);
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

pub(crate) fn panicked(id: TaskId, payload: &(dyn Any + Send)) -> Error {
    Error::new(ErrorKind::Panicked)
        .with_message(format!("{id} panicked: {}", panic_message(payload)))
}

// ============================================================================
// Closures
// ============================================================================

pub(crate) struct CallTask<F, T> {
    id: TaskId,
    work: F,
    completion: Arc<Completion<T>>,
}

impl<F, T> CallTask<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    pub(crate) fn new(id: TaskId, work: F, completion: Arc<Completion<T>>) -> Self {
        Self {
            id,
            work,
            completion,
        }
    }
}

impl<F, T> Runnable for CallTask<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    fn task_id(&self) -> TaskId {
        self.id
    }

    fn run(self: Box<Self>) -> bool {
        let Self {
            id,
            work,
            completion,
        } = *self;
        if completion.is_done() {
            trace!(task_id = %id, "skipping cancelled work");
            return true;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(work))
            .map_err(|payload| panicked(id, payload.as_ref()));
        completion.complete(result);
        true
    }

    fn abandon(self: Box<Self>, err: Error) {
        self.completion.complete(Err(err));
    }
}

// ============================================================================
// Futures
// ============================================================================

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A spawned future together with its scheduling state. Doubles as the
/// future's waker.
pub(crate) struct FutureCell<T> {
    id: TaskId,
    future: Mutex<Option<BoxFuture<T>>>,
    completion: Arc<Completion<T>>,
    scheduler: Arc<Shared>,
    /// Set while a poll step for this future sits in the queue.
    queued: AtomicBool,
}

impl<T: Send + 'static> FutureCell<T> {
    pub(crate) fn new<F>(
        id: TaskId,
        future: F,
        completion: Arc<Completion<T>>,
        scheduler: Arc<Shared>,
    ) -> Arc<Self>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let cell = Arc::new(Self {
            id,
            future: Mutex::new(Some(Box::pin(future))),
            completion,
            scheduler,
            queued: AtomicBool::new(true),
        });
        let weak = Arc::downgrade(&cell);
        cell.completion.set_abort_hook(move || {
            if let Some(cell) = weak.upgrade() {
                cell.wake_by_ref();
            }
        });
        cell
    }

    /// Drops the future if it is not being polled right now. A poll in
    /// progress notices the completed slot and drops it itself.
    fn release_future(&self) {
        if let Some(mut slot) = self.future.try_lock() {
            slot.take();
        }
    }

    fn abort(&self, err: Error) {
        self.scheduler.finish(self.id);
        self.completion.complete(Err(err));
        self.release_future();
    }

    fn poll_once(self: &Arc<Self>) -> bool {
        self.queued.store(false, Ordering::Release);
        let mut slot = self.future.lock();
        if self.completion.is_done() {
            trace!(task_id = %self.id, "dropping cancelled future");
            slot.take();
            return true;
        }
        let Some(future) = slot.as_mut() else {
            return true;
        };

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(value)) => {
                slot.take();
                self.completion.complete(Ok(value));
                true
            }
            Ok(Poll::Pending) => {
                if self.completion.is_done() {
                    // Cancelled or aborted while polling.
                    slot.take();
                    return true;
                }
                false
            }
            Err(payload) => {
                slot.take();
                self.completion.complete(Err(panicked(self.id, payload.as_ref())));
                true
            }
        }
    }
}

impl<T> Drop for FutureCell<T> {
    fn drop(&mut self) {
        // Every waker is gone, so nothing can ever poll the future again.
        self.scheduler.finish(self.id);
        if !self.completion.is_done() {
            self.completion.complete(Err(Error::new(ErrorKind::Cancelled).with_message(
                format!("{} was dropped while pending: its waker was lost", self.id),
            )));
        }
    }
}

impl<T: Send + 'static> Wake for FutureCell<T> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let step = Box::new(PollStep(Arc::clone(self)));
        if let Err(step) = self.scheduler.reschedule(step) {
            trace!(task_id = %self.id, "future woken after scheduler disposal");
            step.abandon(Error::disposed("scheduler"));
        }
    }
}

/// One poll of a spawned future.
pub(crate) struct PollStep<T>(pub(crate) Arc<FutureCell<T>>);

impl<T: Send + 'static> Runnable for PollStep<T> {
    fn task_id(&self) -> TaskId {
        self.0.id
    }

    fn run(self: Box<Self>) -> bool {
        self.0.poll_once()
    }

    fn abandon(self: Box<Self>, err: Error) {
        self.0.abort(err);
    }
}

impl<T> fmt::Debug for PollStep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PollStep").field(&self.0.id).finish()
    }
}
