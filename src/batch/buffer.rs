//! Deferred batch buffer.
//!
//! A [`BatchBuffer`] accumulates appended items in a fixed-capacity array and
//! hands the filled array to a [`FlushHandler`] when either:
//!
//! - the array reaches `flush_threshold` items (flushed by the appending call), or
//! - `flush_interval` has elapsed since the last flush (flushed by the
//!   buffer's background thread)
//!
//! A zero interval has always elapsed: the background thread flushes as soon
//! as an item is pending, parking on a condvar while the buffer is empty.
//!
//! # Swap-and-flush
//!
//! Under the buffer's lock the live array is replaced by a fresh one of the
//! same capacity and the flush time is recorded. The lock is released before
//! the handler runs, so appends continue into the fresh array while the old
//! one is being flushed. Each item therefore reaches the handler exactly once.
//!
//! # Disposal
//!
//! [`dispose`](BatchBuffer::dispose) marks the buffer disposed and cancels
//! its token. The background thread then drains whatever is left in a final
//! flush (the handler sees a cancelled token) and exits. Dropping the buffer
//! disposes it.

use core::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::handler::{Batch, FlushHandler};
use crate::cancel::CancelToken;
use crate::config::BatchBufferConfig;
use crate::error::{Error, Result, ResultExt};
use crate::tracing_compat::{debug, error, trace, warn};
use crate::types::CancelReason;

const COMPONENT: &str = "batch buffer";

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Threshold,
    Manual,
    Interval,
    Shutdown,
}

impl Trigger {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Manual => "manual",
            Self::Interval => "interval",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Counters describing a buffer's flush history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Handler invocations that returned `Ok`.
    pub flushes: u64,
    /// Items delivered by successful flushes.
    pub items_flushed: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed_flushes: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    flushes: AtomicU64,
    items_flushed: AtomicU64,
    failed_flushes: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> FlushStats {
        FlushStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }
}

struct Slot<T> {
    items: Vec<T>,
    last_flush: Instant,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    /// Signalled when the buffer becomes non-empty or disposed. Only waited
    /// on with a zero interval.
    pending: Condvar,
    flush_threshold: usize,
    flush_interval: Duration,
    handler: Box<dyn FlushHandler<T>>,
    cancel: CancelToken,
    /// Written with `slot` held so no append lands after the final drain.
    disposed: AtomicBool,
    worker_exited: AtomicBool,
    stats: StatsCounters,
}

impl<T: Send + 'static> Shared<T> {
    /// Replaces the live array. Caller holds the slot lock.
    fn swap(&self, slot: &mut Slot<T>) -> Option<Batch<T>> {
        slot.last_flush = Instant::now();
        if slot.items.is_empty() {
            return None;
        }
        let fresh = Vec::with_capacity(self.flush_threshold);
        Some(Batch::new(mem::replace(&mut slot.items, fresh)))
    }

    fn take(&self) -> Option<Batch<T>> {
        let mut slot = self.slot.lock();
        self.swap(&mut slot)
    }

    fn deliver(&self, batch: Batch<T>, trigger: Trigger) -> Result<usize> {
        let count = batch.len();
        trace!(count, trigger = trigger.as_str(), "flushing batch");
        match self.handler.flush(batch, &self.cancel) {
            Ok(()) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .items_flushed
                    .fetch_add(count as u64, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Flush path for the background thread: failures are logged, not returned.
    fn flush_in_background(&self, trigger: Trigger) {
        let Some(batch) = self.take() else {
            return;
        };
        let count = batch.len();
        match panic::catch_unwind(AssertUnwindSafe(|| self.deliver(batch, trigger))) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) if err.is_cancelled() && self.cancel.is_cancelled() => {
                debug!(count, error = %err, "flush cancelled during shutdown");
            }
            Ok(Err(err)) => {
                warn!(count, trigger = trigger.as_str(), error = %err, "background flush failed");
            }
            Err(_) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(count, trigger = trigger.as_str(), "flush handler panicked");
            }
        }
    }

    /// Zero-interval loop: flush whenever something is pending.
    fn flush_when_pending(&self) {
        loop {
            {
                let mut slot = self.slot.lock();
                while slot.items.is_empty() && !self.disposed.load(Ordering::Acquire) {
                    self.pending.wait(&mut slot);
                }
                if self.disposed.load(Ordering::Acquire) {
                    break;
                }
            }
            self.flush_in_background(Trigger::Interval);
        }
        // `dispose` cancels right after marking the buffer disposed.
        self.cancel.wait();
    }

    fn run_background(&self) {
        let interval = self.flush_interval;
        if interval.is_zero() {
            self.flush_when_pending();
        } else {
            loop {
                let since = self.slot.lock().last_flush.elapsed();
                if since < interval {
                    if self.cancel.wait_timeout(interval - since) {
                        break;
                    }
                    continue;
                }
                self.flush_in_background(Trigger::Interval);
                if self.cancel.wait_timeout(interval) {
                    break;
                }
            }
        }
        self.flush_in_background(Trigger::Shutdown);
    }
}

/// Append-only buffer flushed in batches by size or by time.
///
/// See the [module documentation](self) for the flushing rules.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use exclusync::batch::{Batch, BatchBuffer};
/// use exclusync::cancel::CancelToken;
///
/// let seen = Arc::new(AtomicUsize::new(0));
/// let sink = Arc::clone(&seen);
/// let buffer = BatchBuffer::builder(move |batch: Batch<u64>, _: &CancelToken| -> exclusync::Result<()> {
///     sink.fetch_add(batch.len(), Ordering::SeqCst);
///     Ok(())
/// })
/// .flush_threshold(2)
/// .flush_interval(Duration::from_secs(60))
/// .build()
/// .unwrap();
///
/// buffer.append(1).unwrap();
/// buffer.append(2).unwrap(); // reaches the threshold, flushed here
/// assert_eq!(seen.load(Ordering::SeqCst), 2);
/// buffer.dispose();
/// ```
pub struct BatchBuffer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    thread_name: String,
}

impl<T: Send + 'static> BatchBuffer<T> {
    /// Starts building a buffer that flushes into `handler`.
    pub fn builder<H: FlushHandler<T>>(handler: H) -> BatchBufferBuilder<T, H> {
        BatchBufferBuilder {
            handler,
            config: BatchBufferConfig::default(),
            _marker: PhantomData,
        }
    }

    /// Creates a buffer with the given threshold and interval.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `flush_threshold` is zero, or `Internal` if
    /// the background thread cannot be spawned.
    pub fn new<H: FlushHandler<T>>(
        handler: H,
        flush_threshold: usize,
        flush_interval: Duration,
    ) -> Result<Self> {
        Self::builder(handler)
            .flush_threshold(flush_threshold)
            .flush_interval(flush_interval)
            .build()
    }

    /// Appends an item.
    ///
    /// If the item fills the buffer, the full batch is flushed on the
    /// calling thread before this returns.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` after [`dispose`](Self::dispose), or the handler's
    /// error if this append triggered a flush that failed. The item is part
    /// of that failed batch either way.
    pub fn append(&self, item: T) -> Result<()> {
        let full = {
            let mut slot = self.shared.slot.lock();
            if self.shared.disposed.load(Ordering::Acquire) {
                return Err(Error::disposed(COMPONENT));
            }
            let was_empty = slot.items.is_empty();
            slot.items.push(item);
            if slot.items.len() < self.shared.flush_threshold {
                if was_empty && self.shared.flush_interval.is_zero() {
                    self.shared.pending.notify_one();
                }
                return Ok(());
            }
            self.shared.swap(&mut slot)
        };
        match full {
            Some(batch) => self.shared.deliver(batch, Trigger::Threshold).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Flushes whatever is buffered on the calling thread.
    ///
    /// Returns the number of items handed to the handler; `0` means the
    /// buffer was empty and the handler was not called.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` after [`dispose`](Self::dispose), or the handler's
    /// error.
    pub fn flush(&self) -> Result<usize> {
        let batch = {
            let mut slot = self.shared.slot.lock();
            if self.shared.disposed.load(Ordering::Acquire) {
                return Err(Error::disposed(COMPONENT));
            }
            self.shared.swap(&mut slot)
        };
        match batch {
            Some(batch) => self.shared.deliver(batch, Trigger::Manual),
            None => Ok(0),
        }
    }

    /// Number of items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.slot.lock().items.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item count that triggers an eager flush.
    #[must_use]
    pub fn flush_threshold(&self) -> usize {
        self.shared.flush_threshold
    }

    /// Time since the last flush that triggers a background flush.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.shared.flush_interval
    }

    /// Name of the background thread.
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Returns true once [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Snapshot of the flush counters.
    #[must_use]
    pub fn stats(&self) -> FlushStats {
        self.shared.stats.snapshot()
    }

    /// Disposes the buffer. Idempotent.
    ///
    /// Later appends and flushes fail with `Disposed`. Items still buffered
    /// are delivered by the background thread's final flush.
    pub fn dispose(&self) {
        {
            let _slot = self.shared.slot.lock();
            if self.shared.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.shared.pending.notify_all();
        }
        self.shared.cancel.cancel(&CancelReason::shutdown());
        debug!(thread = %self.thread_name, "batch buffer disposed");
    }

    /// Disposes the buffer and waits for the background thread to finish its
    /// final flush.
    ///
    /// Returns `true` if the thread exited within `timeout`. Always returns
    /// `false` when called from the background thread itself.
    pub fn dispose_and_wait(&self, timeout: Duration) -> bool {
        self.dispose();
        if thread::current().id() == self.worker_id {
            return false;
        }

        let deadline = Instant::now() + timeout;
        while !self.shared.worker_exited.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(Duration::from_millis(1).min(remaining));
        }

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        true
    }
}

impl<T: Send + 'static> Drop for BatchBuffer<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Send + 'static> fmt::Debug for BatchBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("len", &self.len())
            .field("flush_threshold", &self.shared.flush_threshold)
            .field("flush_interval", &self.shared.flush_interval)
            .field("disposed", &self.is_disposed())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Builder for [`BatchBuffer`].
pub struct BatchBufferBuilder<T, H> {
    handler: H,
    config: BatchBufferConfig,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static, H: FlushHandler<T>> BatchBufferBuilder<T, H> {
    /// Replaces every setting with `config`.
    #[must_use]
    pub fn config(mut self, config: BatchBufferConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the item count that triggers an eager flush. Must be at least 1.
    #[must_use]
    pub fn flush_threshold(mut self, threshold: usize) -> Self {
        self.config.flush_threshold = threshold;
        self
    }

    /// Sets the time-triggered flush interval. Zero flushes pending items
    /// as soon as the background thread sees them.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Names the background thread.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Builds the buffer and starts its background thread.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the threshold is zero, or `Internal` if the
    /// background thread cannot be spawned.
    pub fn build(self) -> Result<BatchBuffer<T>> {
        self.config.validate()?;
        let BatchBufferConfig {
            flush_threshold,
            flush_interval,
            thread_name,
        } = self.config;

        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                items: Vec::with_capacity(flush_threshold),
                last_flush: Instant::now(),
            }),
            pending: Condvar::new(),
            flush_threshold,
            flush_interval,
            handler: Box::new(self.handler),
            cancel: CancelToken::new(),
            disposed: AtomicBool::new(false),
            worker_exited: AtomicBool::new(false),
            stats: StatsCounters::default(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("batch buffer thread started");
                worker_shared.run_background();
                worker_shared.worker_exited.store(true, Ordering::Release);
                debug!("batch buffer thread stopped");
            })
            .with_context(|| format!("failed to spawn thread {thread_name:?}"))?;

        debug!(
            thread = %thread_name,
            flush_threshold,
            flush_interval_ms = flush_interval.as_millis() as u64,
            "batch buffer created"
        );

        Ok(BatchBuffer {
            shared,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
            thread_name,
        })
    }
}

impl<T, H> fmt::Debug for BatchBufferBuilder<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBufferBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::{init_test_logging, wait_for};
    use std::sync::atomic::AtomicUsize;

    type Seen = Arc<Mutex<Vec<Vec<u32>>>>;

    /// Long enough that no interval flush happens during a test.
    const NO_TIMER: Duration = Duration::from_secs(3600);

    fn recording(threshold: usize, interval: Duration) -> (BatchBuffer<u32>, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let buffer = BatchBuffer::new(
            move |batch: Batch<u32>, _: &CancelToken| -> Result<()> {
                sink.lock().push(batch.into_vec());
                Ok(())
            },
            threshold,
            interval,
        )
        .expect("valid buffer");
        (buffer, seen)
    }

    #[test]
    fn threshold_flushes_on_appending_thread() {
        init_test_logging();
        let (buffer, seen) = recording(3, NO_TIMER);
        buffer.append(1).unwrap();
        buffer.append(2).unwrap();
        assert_eq!(buffer.len(), 2);
        assert!(seen.lock().is_empty());

        buffer.append(3).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(*seen.lock(), vec![vec![1, 2, 3]]);
        assert_eq!(
            buffer.stats(),
            FlushStats {
                flushes: 1,
                items_flushed: 3,
                failed_flushes: 0
            }
        );
    }

    #[test]
    fn flush_on_empty_is_noop() {
        let (buffer, seen) = recording(10, NO_TIMER);
        assert_eq!(buffer.flush().unwrap(), 0);
        buffer.append(7).unwrap();
        assert_eq!(buffer.flush().unwrap(), 1);
        assert_eq!(buffer.flush().unwrap(), 0);
        assert_eq!(*seen.lock(), vec![vec![7]]);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let noop = |_: Batch<u32>, _: &CancelToken| -> Result<()> { Ok(()) };
        let err = BatchBuffer::new(noop, 0, NO_TIMER).expect_err("invalid threshold");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn interval_flushes_in_background() {
        init_test_logging();
        let (buffer, seen) = recording(100, Duration::from_millis(50));
        buffer.append(42).unwrap();
        assert!(wait_for(Duration::from_secs(5), || !seen.lock().is_empty()));
        assert_eq!(*seen.lock(), vec![vec![42]]);
    }

    #[test]
    fn handler_error_reaches_appender() {
        let buffer = BatchBuffer::new(
            |_: Batch<u32>, _: &CancelToken| -> Result<()> {
                Err(Error::new(ErrorKind::FlushFailed).with_message("sink offline"))
            },
            2,
            NO_TIMER,
        )
        .unwrap();
        buffer.append(1).unwrap();
        let err = buffer.append(2).expect_err("flush failed");
        assert_eq!(err.kind(), ErrorKind::FlushFailed);
        assert_eq!(buffer.stats().failed_flushes, 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn dispose_rejects_further_use_and_drains() {
        init_test_logging();
        let (buffer, seen) = recording(100, NO_TIMER);
        buffer.append(1).unwrap();
        buffer.append(2).unwrap();

        assert!(buffer.dispose_and_wait(Duration::from_secs(5)));
        assert!(buffer.is_disposed());
        assert_eq!(*seen.lock(), vec![vec![1, 2]]);

        assert!(buffer.append(3).expect_err("disposed").is_disposed());
        assert!(buffer.flush().expect_err("disposed").is_disposed());
        // Idempotent.
        buffer.dispose();
        assert!(buffer.dispose_and_wait(Duration::from_secs(1)));
    }

    #[test]
    fn shutdown_flush_sees_cancelled_token() {
        let observed = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&observed);
        let buffer = BatchBuffer::new(
            move |_: Batch<u32>, cancel: &CancelToken| -> Result<()> {
                if cancel.is_cancelled() {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
                cancel.check()
            },
            100,
            NO_TIMER,
        )
        .unwrap();
        buffer.append(1).unwrap();
        assert!(buffer.dispose_and_wait(Duration::from_secs(5)));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        // A cancellation error during shutdown is not counted as a success.
        assert_eq!(buffer.stats().flushes, 0);
    }

    #[test]
    fn handler_may_append_to_same_buffer() {
        let buffer: Arc<Mutex<Option<Arc<BatchBuffer<u32>>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&buffer);
        let total = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&total);
        let inner = Arc::new(
            BatchBuffer::new(
                move |batch: Batch<u32>, _: &CancelToken| -> Result<()> {
                    sink.fetch_add(batch.len(), Ordering::SeqCst);
                    if batch.as_slice() == [1, 2] {
                        if let Some(buffer) = slot.lock().as_ref() {
                            buffer.append(3)?;
                        }
                    }
                    Ok(())
                },
                2,
                NO_TIMER,
            )
            .unwrap(),
        );
        *buffer.lock() = Some(Arc::clone(&inner));

        inner.append(1).unwrap();
        inner.append(2).unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(total.load(Ordering::SeqCst), 2);
        buffer.lock().take();
    }

    #[test]
    fn background_panic_is_contained() {
        init_test_logging();
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        let buffer = BatchBuffer::new(
            move |_: Batch<u32>, _: &CancelToken| -> Result<()> {
                if sink.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first flush explodes");
                }
                Ok(())
            },
            100,
            Duration::from_millis(20),
        )
        .unwrap();
        buffer.append(1).unwrap();
        assert!(wait_for(Duration::from_secs(5), || buffer.stats().failed_flushes == 1));
        buffer.append(2).unwrap();
        assert!(wait_for(Duration::from_secs(5), || buffer.stats().flushes == 1));
    }

    #[test]
    fn zero_interval_flushes_pending_items_promptly() {
        init_test_logging();
        let (buffer, seen) = recording(10, Duration::ZERO);
        buffer.append(1).unwrap();
        assert!(wait_for(Duration::from_secs(5), || buffer.stats().flushes == 1));
        assert_eq!(*seen.lock(), vec![vec![1]]);
        assert!(buffer.is_empty());

        // The thread parks again and picks up the next item.
        buffer.append(2).unwrap();
        buffer.append(3).unwrap();
        assert!(wait_for(Duration::from_secs(5), || buffer.stats().items_flushed == 3));
        assert!(buffer.dispose_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn zero_interval_thread_exits_on_dispose_while_idle() {
        let (buffer, seen) = recording(10, Duration::ZERO);
        assert!(buffer.dispose_and_wait(Duration::from_secs(5)));
        assert!(seen.lock().is_empty());
    }
}
