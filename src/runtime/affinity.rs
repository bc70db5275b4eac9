//! Thread-affinity scheduler.
//!
//! A [`Scheduler`] owns exactly one dedicated OS thread. Work submitted from
//! any thread runs on that thread, one item at a time, in submission order.
//! Spawned futures are polled there too: every wake-up re-enters the same
//! queue, so each continuation observes the dedicated thread.
//!
//! # Lifecycle
//!
//! ```text
//! Running --dispose()--> Disposing --thread exits--> Disposed
//! ```
//!
//! Disposal is cooperative: the item currently executing runs to the end,
//! queued items fail with `Disposed`, and the thread exits. Submissions after
//! disposal fail immediately. Dropping the owning [`Scheduler`] disposes it.
//!
//! # Reentrancy
//!
//! Work may submit more work. Such work is queued behind everything already
//! pending. [`run_blocking`](SchedulerHandle::run_blocking) called on the
//! dedicated thread executes inline, and a blocking
//! [`join`](super::TaskHandle::join) there fails with `ReentrantWait`
//! instead of deadlocking.

use core::fmt;
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::task::{panicked, CallTask, FutureCell, PollStep, Runnable};
use super::task_handle::{Completion, TaskHandle};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result, ResultExt};
use crate::tracing_compat::{debug, debug_span, trace};
use crate::types::TaskId;

const COMPONENT: &str = "scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Disposing,
    Disposed,
}

struct QueueState {
    items: VecDeque<Box<dyn Runnable>>,
    /// Tasks submitted and not yet finished.
    in_flight: BTreeSet<TaskId>,
    lifecycle: Lifecycle,
}

/// State shared by the owner, handles, parked wakers and the dedicated thread.
pub(crate) struct Shared {
    name: String,
    queue: Mutex<QueueState>,
    condvar: Condvar,
    exited: AtomicBool,
}

impl Shared {
    /// Queues a new task. Returns the item back if the scheduler is not running.
    fn submit(&self, item: Box<dyn Runnable>) -> core::result::Result<(), Box<dyn Runnable>> {
        let mut queue = self.queue.lock();
        if queue.lifecycle != Lifecycle::Running {
            return Err(item);
        }
        queue.in_flight.insert(item.task_id());
        queue.items.push_back(item);
        drop(queue);
        self.condvar.notify_one();
        Ok(())
    }

    /// Queues another step of an already submitted task.
    pub(crate) fn reschedule(
        &self,
        item: Box<dyn Runnable>,
    ) -> core::result::Result<(), Box<dyn Runnable>> {
        let mut queue = self.queue.lock();
        if queue.lifecycle != Lifecycle::Running {
            return Err(item);
        }
        queue.items.push_back(item);
        drop(queue);
        self.condvar.notify_one();
        Ok(())
    }

    /// Forgets a task that completed outside a poll step.
    pub(crate) fn finish(&self, id: TaskId) {
        self.queue.lock().in_flight.remove(&id);
    }

    /// Moves to `Disposing` and fails everything still queued.
    fn dispose(&self) -> bool {
        let abandoned = {
            let mut queue = self.queue.lock();
            if queue.lifecycle != Lifecycle::Running {
                return false;
            }
            queue.lifecycle = Lifecycle::Disposing;
            queue.in_flight.clear();
            std::mem::take(&mut queue.items)
        };
        self.condvar.notify_all();
        debug!(
            scheduler = %self.name,
            abandoned = abandoned.len(),
            "scheduler disposing"
        );
        for item in abandoned {
            item.abandon(Error::disposed(COMPONENT));
        }
        true
    }

    fn lifecycle(&self) -> Lifecycle {
        self.queue.lock().lifecycle
    }

    fn next_item(&self) -> Option<Box<dyn Runnable>> {
        let mut queue = self.queue.lock();
        loop {
            if queue.lifecycle != Lifecycle::Running {
                return None;
            }
            if let Some(item) = queue.items.pop_front() {
                return Some(item);
            }
            self.condvar.wait(&mut queue);
        }
    }

    fn run_worker(&self) {
        let span = debug_span!("affinity_thread", scheduler = %self.name);
        let _guard = span.enter();
        debug!("dedicated thread started");

        while let Some(item) = self.next_item() {
            let id = item.task_id();
            trace!(task_id = %id, "running work item");
            if item.run() {
                self.queue.lock().in_flight.remove(&id);
            }
        }

        // Items queued between the state change and our exit.
        let leftover = {
            let mut queue = self.queue.lock();
            queue.lifecycle = Lifecycle::Disposed;
            queue.in_flight.clear();
            std::mem::take(&mut queue.items)
        };
        for item in leftover {
            item.abandon(Error::disposed(COMPONENT));
        }
        self.exited.store(true, Ordering::Release);
        debug!("dedicated thread stopped");
    }
}

/// A cloneable handle for submitting work to a [`Scheduler`].
///
/// Handles keep the shared state alive but not the dedicated thread: once
/// the owner is disposed, submissions through any handle fail with
/// `Disposed`.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    thread_id: ThreadId,
}

impl SchedulerHandle {
    /// Queues `work` for the dedicated thread.
    ///
    /// The returned handle completes with the closure's return value, or with
    /// a `Panicked` error if it panicked.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` if the scheduler has been disposed.
    pub fn submit<F, T>(&self, work: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = TaskId::next();
        let completion = Completion::new();
        let item = Box::new(CallTask::new(id, work, Arc::clone(&completion)));
        self.shared
            .submit(item)
            .map_err(|_| Error::disposed(COMPONENT))?;
        trace!(task_id = %id, scheduler = %self.shared.name, "work submitted");
        Ok(TaskHandle::new(id, completion, self.thread_id))
    }

    /// Queues `future` for the dedicated thread.
    ///
    /// The first poll and every poll after a wake-up are queued like
    /// submitted closures, so the future only ever runs on the dedicated
    /// thread. A future woken after disposal is dropped and its handle fails
    /// with `Disposed`.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` if the scheduler has been disposed.
    pub fn spawn<F, T>(&self, future: F) -> Result<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = TaskId::next();
        let completion = Completion::new();
        let cell = FutureCell::new(id, future, Arc::clone(&completion), Arc::clone(&self.shared));
        if let Err(step) = self.shared.submit(Box::new(PollStep(cell))) {
            step.abandon(Error::disposed(COMPONENT));
            return Err(Error::disposed(COMPONENT));
        }
        trace!(task_id = %id, scheduler = %self.shared.name, "future spawned");
        Ok(TaskHandle::new(id, completion, self.thread_id))
    }

    /// Runs `action` on the dedicated thread and blocks until it completes.
    ///
    /// Called on the dedicated thread itself, `action` runs inline.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` if the scheduler has been (or gets) disposed before
    /// `action` runs, or `Panicked` if it panicked.
    pub fn run_blocking<F, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current_thread() {
            return panic::catch_unwind(AssertUnwindSafe(action))
                .map_err(|payload| panicked(TaskId::next(), payload.as_ref()));
        }
        self.submit(action)?.join()
    }

    /// Returns true if the caller is running on the dedicated thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Identity of the dedicated thread.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Always 1: at most one item executes at a time.
    #[must_use]
    pub const fn max_concurrency(&self) -> usize {
        1
    }

    /// Snapshot of the tasks submitted and not yet finished, in id order.
    #[must_use]
    pub fn scheduled_tasks(&self) -> Vec<TaskId> {
        self.shared.queue.lock().in_flight.iter().copied().collect()
    }

    /// Name of the dedicated thread.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns true once disposal has started.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.lifecycle() != Lifecycle::Running
    }

    /// Returns a handle that does not keep the shared state alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakSchedulerHandle {
        WeakSchedulerHandle {
            shared: Arc::downgrade(&self.shared),
            thread_id: self.thread_id,
        }
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.shared.name)
            .field("thread_id", &self.thread_id)
            .field("lifecycle", &self.shared.lifecycle())
            .finish()
    }
}

/// A non-owning reference to a scheduler's shared state.
#[derive(Clone)]
pub struct WeakSchedulerHandle {
    shared: Weak<Shared>,
    thread_id: ThreadId,
}

impl WeakSchedulerHandle {
    /// Returns a handle if the shared state is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<SchedulerHandle> {
        self.shared.upgrade().map(|shared| SchedulerHandle {
            shared,
            thread_id: self.thread_id,
        })
    }

    /// Returns true if the shared state has been reclaimed.
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        self.shared.strong_count() == 0
    }
}

impl fmt::Debug for WeakSchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSchedulerHandle")
            .field("thread_id", &self.thread_id)
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

/// Owner of a dedicated execution thread.
///
/// The submission API is shared with [`SchedulerHandle`] through `Deref`.
///
/// # Example
///
/// ```
/// use exclusync::runtime::Scheduler;
///
/// let scheduler = Scheduler::with_name("ui").unwrap();
/// let thread = scheduler.thread_id();
/// let observed = scheduler.run_blocking(|| std::thread::current().id()).unwrap();
/// assert_eq!(observed, thread);
/// assert!(scheduler.dispose_and_wait(std::time::Duration::from_secs(5)));
/// ```
pub struct Scheduler {
    handle: SchedulerHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts a scheduler with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the dedicated thread cannot be spawned.
    pub fn new() -> Result<Self> {
        Self::with_config(&SchedulerConfig::default())
    }

    /// Starts a scheduler whose thread is called `name`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the dedicated thread cannot be spawned.
    pub fn with_name(name: impl Into<String>) -> Result<Self> {
        Self::with_config(&SchedulerConfig {
            thread_name: name.into(),
        })
    }

    /// Starts a scheduler from `config`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the dedicated thread cannot be spawned.
    pub fn with_config(config: &SchedulerConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: config.thread_name.clone(),
            queue: Mutex::new(QueueState {
                items: VecDeque::new(),
                in_flight: BTreeSet::new(),
                lifecycle: Lifecycle::Running,
            }),
            condvar: Condvar::new(),
            exited: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || worker_shared.run_worker())
            .with_context(|| format!("failed to spawn thread {:?}", config.thread_name))?;

        let thread_id = worker.thread().id();
        debug!(scheduler = %config.thread_name, ?thread_id, "scheduler created");
        Ok(Self {
            handle: SchedulerHandle { shared, thread_id },
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Returns a cloneable submission handle.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Disposes the scheduler. Idempotent and non-blocking.
    ///
    /// Queued work fails with `Disposed`; work already running finishes.
    pub fn dispose(&self) {
        self.handle.shared.dispose();
    }

    /// Disposes the scheduler and waits for the dedicated thread to exit.
    ///
    /// Returns `true` if the thread exited within `timeout`. Called from the
    /// dedicated thread itself, it only disposes and returns `false`.
    pub fn dispose_and_wait(&self, timeout: Duration) -> bool {
        self.dispose();
        if self.handle.is_current_thread() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        while !self.handle.shared.exited.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(Duration::from_millis(1).min(remaining));
        }

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        true
    }
}

impl std::ops::Deref for Scheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &SchedulerHandle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.handle.shared.dispose() {
            debug!(scheduler = %self.handle.shared.name, "scheduler disposed on drop");
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.handle.shared.name)
            .field("thread_id", &self.handle.thread_id)
            .field("lifecycle", &self.handle.shared.lifecycle())
            .field("pending", &self.handle.shared.queue.lock().items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::{init_test_logging, wait_for};
    use std::sync::atomic::AtomicUsize;
    use std::pin::Pin;
    use std::sync::mpsc;
    use std::task::{Context, Poll};

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn work_runs_on_dedicated_thread() {
        init_test_logging();
        crate::test_phase!("work_runs_on_dedicated_thread");
        let scheduler = Scheduler::with_name("affinity-test").unwrap();
        let expected = scheduler.thread_id();
        assert!(!scheduler.is_current_thread());
        assert_eq!(scheduler.max_concurrency(), 1);
        assert_eq!(scheduler.name(), "affinity-test");

        let (observed, name) = scheduler
            .submit(|| {
                let current = thread::current();
                (current.id(), current.name().map(str::to_string))
            })
            .unwrap()
            .join()
            .unwrap();
        crate::assert_with_log!(observed == expected, "thread identity", expected, observed);
        assert_eq!(name.as_deref(), Some("affinity-test"));
        assert!(scheduler.dispose_and_wait(WAIT));
        crate::test_complete!("work_runs_on_dedicated_thread");
    }

    #[test]
    fn work_runs_in_submission_order() {
        let scheduler = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let order = Arc::clone(&order);
                scheduler.submit(move || order.lock().push(i)).unwrap()
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
        scheduler.dispose();
    }

    #[test]
    fn panic_is_attached_to_handle_and_thread_survives() {
        let scheduler = Scheduler::new().unwrap();
        let err = scheduler
            .submit(|| -> u32 { panic!("work exploded") })
            .unwrap()
            .join()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Panicked);
        assert!(err.to_string().contains("work exploded"));
        assert_eq!(scheduler.run_blocking(|| 5).unwrap(), 5);
        scheduler.dispose();
    }

    #[test]
    fn run_blocking_is_inline_on_dedicated_thread() {
        let scheduler = Scheduler::new().unwrap();
        let handle = scheduler.handle();
        let nested = scheduler
            .run_blocking(move || {
                let inner = handle.clone();
                handle.run_blocking(move || inner.is_current_thread())
            })
            .unwrap()
            .unwrap();
        assert!(nested);
        scheduler.dispose();
    }

    #[test]
    fn join_on_dedicated_thread_is_reentrant_error() {
        let scheduler = Scheduler::new().unwrap();
        let handle = scheduler.handle();
        let kind = scheduler
            .run_blocking(move || {
                let child = handle.submit(|| 1).unwrap();
                child.join().map_err(|e| e.kind())
            })
            .unwrap();
        assert_eq!(kind, Err(ErrorKind::ReentrantWait));
        scheduler.dispose();
    }

    #[test]
    fn recursive_submission_queues_behind() {
        let scheduler = Scheduler::new().unwrap();
        let handle = scheduler.handle();
        let (tx, rx) = mpsc::channel();
        scheduler
            .submit(move || {
                let inner_tx = tx.clone();
                let inner = handle.clone();
                handle
                    .submit(move || {
                        inner_tx.send(("inner", inner.is_current_thread())).unwrap();
                    })
                    .unwrap();
                tx.send(("outer", handle.is_current_thread())).unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("outer", true));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("inner", true));
        scheduler.dispose();
    }

    #[test]
    fn dispose_abandons_queued_work() {
        init_test_logging();
        let scheduler = Scheduler::new().unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let blocker = scheduler
            .submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                "finished"
            })
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        let queued = scheduler.submit(|| "never").unwrap();
        assert_eq!(scheduler.scheduled_tasks(), vec![blocker.id(), queued.id()]);

        scheduler.dispose();
        assert!(scheduler.is_disposed());
        assert!(queued.join().unwrap_err().is_disposed());
        assert!(scheduler.submit(|| ()).unwrap_err().is_disposed());

        release_tx.send(()).unwrap();
        assert_eq!(blocker.join().unwrap(), "finished");
        assert!(scheduler.dispose_and_wait(WAIT));
        assert!(scheduler.scheduled_tasks().is_empty());
    }

    #[test]
    fn cancel_skips_queued_work() {
        let scheduler = Scheduler::new().unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));
        let _blocker = scheduler
            .submit(move || release_rx.recv().unwrap())
            .unwrap();
        let counter = Arc::clone(&ran);
        let victim = scheduler
            .submit(move || counter.fetch_add(1, Ordering::SeqCst))
            .unwrap();
        assert!(victim.cancel());
        release_tx.send(()).unwrap();
        scheduler.run_blocking(|| ()).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(victim.join().unwrap_err().is_cancelled());
        scheduler.dispose();
    }

    struct Stalled;

    impl Future for Stalled {
        type Output = ();

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
            Poll::Pending
        }
    }

    #[test]
    fn future_that_loses_its_waker_leaves_registry() {
        init_test_logging();
        let scheduler = Scheduler::new().unwrap();
        let stalled = scheduler.spawn(Stalled).unwrap();
        let id = stalled.id();

        let err = stalled.join().unwrap_err();
        assert!(err.is_cancelled());
        scheduler.run_blocking(|| ()).unwrap();
        assert!(!scheduler.scheduled_tasks().contains(&id));
        scheduler.dispose();
    }

    #[test]
    fn cancelled_parked_future_leaves_registry() {
        let scheduler = Scheduler::new().unwrap();
        let parked = scheduler
            .spawn(crate::time::sleep(Duration::from_secs(3600)))
            .unwrap();
        let id = parked.id();
        // Let the first poll park the future on the timer.
        scheduler.run_blocking(|| ()).unwrap();
        assert!(scheduler.scheduled_tasks().contains(&id));

        assert!(parked.cancel());
        assert!(wait_for(WAIT, || !scheduler.scheduled_tasks().contains(&id)));
        scheduler.dispose();
    }

    #[test]
    fn drop_disposes_and_thread_exits() {
        let scheduler = Scheduler::new().unwrap();
        let weak = scheduler.downgrade();
        let handle = scheduler.handle();
        drop(scheduler);
        assert!(handle.is_disposed());
        assert!(handle.submit(|| ()).unwrap_err().is_disposed());
        drop(handle);
        assert!(wait_for(WAIT, || weak.is_reclaimed()));
        assert!(weak.upgrade().is_none());
    }
}
