//! `TaskHandle` for awaiting work submitted to a [`Scheduler`](super::Scheduler).
//!
//! A handle shares a [`Completion`] slot with its work item. The slot is
//! filled exactly once: by the work's result, by a caught panic, by
//! cancellation, or by disposal of the scheduler.

use core::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::types::{CancelReason, TaskId};

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

struct CompletionState<T> {
    slot: Slot<T>,
    /// Waker of an async joiner.
    joiner: Option<Waker>,
    /// Reschedules the task after cancellation so it is dropped promptly.
    abort_hook: Option<AbortHook>,
}

type AbortHook = Box<dyn FnOnce() + Send>;

/// Completion slot shared by a work item and its [`TaskHandle`].
pub(crate) struct Completion<T> {
    state: Mutex<CompletionState<T>>,
    condvar: Condvar,
    done: AtomicBool,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompletionState {
                slot: Slot::Pending,
                joiner: None,
                abort_hook: None,
            }),
            condvar: Condvar::new(),
            done: AtomicBool::new(false),
        })
    }

    /// Stores the result. The first call wins; returns whether it did.
    pub(crate) fn complete(&self, result: Result<T>) -> bool {
        let (joiner, _abort_hook) = {
            let mut state = self.state.lock();
            if !matches!(state.slot, Slot::Pending) {
                return false;
            }
            state.slot = Slot::Ready(result);
            self.done.store(true, Ordering::Release);
            (state.joiner.take(), state.abort_hook.take())
        };
        self.condvar.notify_all();
        if let Some(waker) = joiner {
            waker.wake();
        }
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn set_abort_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if matches!(state.slot, Slot::Pending) {
            state.abort_hook = Some(Box::new(hook));
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while matches!(state.slot, Slot::Pending) {
            self.condvar.wait(&mut state);
        }
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while matches!(state.slot, Slot::Pending) {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return !matches!(state.slot, Slot::Pending);
            }
        }
        true
    }

    /// Takes a ready result. `None` while still pending.
    fn take(&self) -> Option<Result<T>> {
        let mut state = self.state.lock();
        match mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Ready(result) => Some(result),
            Slot::Taken => Some(Err(Error::internal("task result already taken"))),
            Slot::Pending => {
                state.slot = Slot::Pending;
                None
            }
        }
    }

    fn poll_take(&self, waker: &Waker) -> Poll<Result<T>> {
        let mut state = self.state.lock();
        match mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Ready(result) => Poll::Ready(result),
            Slot::Taken => Poll::Ready(Err(Error::internal("task result already taken"))),
            Slot::Pending => {
                state.slot = Slot::Pending;
                match &mut state.joiner {
                    Some(existing) if existing.will_wake(waker) => {}
                    joiner => *joiner = Some(waker.clone()),
                }
                Poll::Pending
            }
        }
    }

    fn cancel(&self) -> bool {
        let hook = self.state.lock().abort_hook.take();
        let first = self.complete(Err(Error::cancelled(&CancelReason::user(
            "task handle cancelled",
        ))));
        if let Some(hook) = hook {
            hook();
        }
        first
    }
}

/// A handle to work submitted to a [`Scheduler`](super::Scheduler).
///
/// Dropping the handle does not cancel the work; it only gives up the
/// result. The handle is also a [`Future`], so one future spawned on the
/// scheduler can await another task.
///
/// # Example
///
/// ```
/// use exclusync::runtime::Scheduler;
///
/// let scheduler = Scheduler::new().unwrap();
/// let handle = scheduler.submit(|| 6 * 7).unwrap();
/// assert_eq!(handle.join().unwrap(), 42);
/// scheduler.dispose();
/// ```
pub struct TaskHandle<T> {
    id: TaskId,
    completion: Arc<Completion<T>>,
    scheduler_thread: ThreadId,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, completion: Arc<Completion<T>>, scheduler_thread: ThreadId) -> Self {
        Self {
            id,
            completion,
            scheduler_thread,
        }
    }

    /// Returns the task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns true once a result is available.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }

    /// Cancels the task.
    ///
    /// Queued work is skipped. Work that is already running is not
    /// interrupted, but its result is discarded. A spawned future is dropped
    /// on the scheduler thread at its next scheduling point. Returns `true`
    /// if the cancellation decided the result.
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self) -> bool {
        self.completion.cancel()
    }

    /// Blocks until the task completes and returns its result.
    ///
    /// # Errors
    ///
    /// - `Panicked` if the work panicked
    /// - `Cancelled` if the task was cancelled first
    /// - `Disposed` if the scheduler was disposed before the work ran
    /// - `ReentrantWait` if called on the scheduler thread while the task is
    ///   unfinished
    pub fn join(self) -> Result<T> {
        if !self.completion.is_done() {
            self.check_reentrant()?;
            self.completion.wait();
        }
        self.completion
            .take()
            .unwrap_or_else(|| Err(Error::internal("task completion signalled without a result")))
    }

    /// Waits up to `timeout` for the result. Returns `None` on timeout, in
    /// which case the handle can be joined again.
    pub fn join_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        if !self.completion.is_done() {
            if let Err(err) = self.check_reentrant() {
                return Some(Err(err));
            }
            match Instant::now().checked_add(timeout) {
                Some(deadline) => {
                    if !self.completion.wait_until(deadline) {
                        return None;
                    }
                }
                None => self.completion.wait(),
            }
        }
        self.completion.take()
    }

    /// Returns the result if it is available, without blocking.
    pub fn try_join(&mut self) -> Option<Result<T>> {
        if !self.completion.is_done() {
            return None;
        }
        self.completion.take()
    }

    fn check_reentrant(&self) -> Result<()> {
        if thread::current().id() == self.scheduler_thread {
            return Err(Error::new(ErrorKind::ReentrantWait).with_message(format!(
                "blocking join on {} from the scheduler thread would deadlock",
                self.id
            )));
        }
        Ok(())
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.completion.poll_take(cx.waker())
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
