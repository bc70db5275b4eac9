//! Sleep future for delaying execution inside scheduled futures.
//!
//! [`Sleep`] completes once its deadline has passed. Pending sleeps register
//! their waker with a single process-wide timer thread, so a sleeping future
//! holds no executor thread and is resumed through whatever executor polled
//! it (for a [`Scheduler`](crate::runtime::Scheduler), its dedicated thread).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::tracing_compat::{error, trace};

/// A future that completes after a specified deadline.
///
/// # Cancel Safety
///
/// `Sleep` is cancel-safe. Dropping it clears its timer registration, so the
/// timer thread no longer holds the waker.
///
/// # Example
///
/// ```ignore
/// use exclusync::time::sleep;
/// use std::time::Duration;
///
/// sleep(Duration::from_millis(1)).await;
/// ```
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    /// Shared with the timer heap once the sleep has been polled.
    registration: Option<Arc<Registration>>,
}

impl Sleep {
    /// Creates a new `Sleep` that completes at the given deadline.
    #[must_use]
    pub const fn until(deadline: Instant) -> Self {
        Self {
            deadline,
            registration: None,
        }
    }

    /// Returns the deadline for this sleep.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns true if the deadline has passed.
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.is_elapsed() {
            if let Some(registration) = this.registration.take() {
                registration.clear();
            }
            return Poll::Ready(());
        }
        match &this.registration {
            Some(registration) => registration.update(cx.waker()),
            None => {
                let registration = Arc::new(Registration::new(cx.waker().clone()));
                timer().register(this.deadline, Arc::clone(&registration));
                this.registration = Some(registration);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.clear();
        }
    }
}

/// Creates a [`Sleep`] completing `duration` from now.
#[must_use]
pub fn sleep(duration: Duration) -> Sleep {
    let deadline = Instant::now()
        .checked_add(duration)
        .unwrap_or_else(far_future);
    Sleep::until(deadline)
}

/// Creates a [`Sleep`] completing at `deadline`.
#[must_use]
pub const fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::until(deadline)
}

fn far_future() -> Instant {
    // Roughly 30 years, well inside every platform's Instant range.
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

// ============================================================================
// Timer thread
// ============================================================================

/// The waker slot of one pending sleep. Emptied when the timer fires or the
/// sleep is dropped.
#[derive(Debug)]
struct Registration {
    waker: Mutex<Option<Waker>>,
}

impl Registration {
    fn new(waker: Waker) -> Self {
        Self {
            waker: Mutex::new(Some(waker)),
        }
    }

    fn update(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    fn take(&self) -> Option<Waker> {
        self.waker.lock().take()
    }

    fn clear(&self) {
        drop(self.take());
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    registration: Arc<Registration>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap, the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

struct TimerThread {
    queue: Mutex<TimerQueue>,
    condvar: Condvar,
}

impl TimerThread {
    fn register(&self, deadline: Instant, registration: Arc<Registration>) {
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq = queue.next_seq.wrapping_add(1);
        let is_earliest = queue
            .heap
            .peek()
            .map_or(true, |head| deadline < head.deadline);
        queue.heap.push(TimerEntry {
            deadline,
            seq,
            registration,
        });
        drop(queue);
        if is_earliest {
            self.condvar.notify_one();
        }
    }

    fn run(&self) {
        let mut expired = Vec::new();
        loop {
            {
                let mut queue = self.queue.lock();
                loop {
                    let now = Instant::now();
                    while queue.heap.peek().is_some_and(|head| head.deadline <= now) {
                        if let Some(waker) = queue.heap.pop().and_then(|e| e.registration.take()) {
                            expired.push(waker);
                        }
                    }
                    if !expired.is_empty() {
                        break;
                    }
                    match queue.heap.peek().map(|head| head.deadline) {
                        Some(deadline) => {
                            let _ = self.condvar.wait_until(&mut queue, deadline);
                        }
                        None => self.condvar.wait(&mut queue),
                    }
                }
            }
            trace!(count = expired.len(), "firing expired timers");
            for waker in expired.drain(..) {
                waker.wake();
            }
        }
    }
}

fn timer() -> &'static TimerThread {
    static TIMER: OnceLock<&'static TimerThread> = OnceLock::new();
    TIMER.get_or_init(|| {
        let timer: &'static TimerThread = Box::leak(Box::new(TimerThread {
            queue: Mutex::new(TimerQueue::default()),
            condvar: Condvar::new(),
        }));
        if let Err(err) = thread::Builder::new()
            .name("exclusync-timer".to_string())
            .spawn(move || timer.run())
        {
            // Sleeps still complete when re-polled, they just never wake on their own.
            error!(error = %err, "failed to spawn timer thread");
        }
        timer
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[test]
    fn elapsed_sleep_is_ready_immediately() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);
        let mut sleep = sleep(Duration::ZERO);
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_ready());
    }

    #[test]
    fn pending_sleep_is_woken_by_timer() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);
        let mut sleep = sleep(Duration::from_millis(20));

        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        let start = Instant::now();
        while counter.0.load(AtomicOrdering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(sleep.is_elapsed());
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_ready());
    }

    #[test]
    fn entries_pop_earliest_first() {
        let waker = Waker::from(Arc::new(CountingWaker(AtomicUsize::new(0))));
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (seq, offset) in [30_u64, 10, 20].into_iter().enumerate() {
            heap.push(TimerEntry {
                deadline: now + Duration::from_millis(offset),
                seq: seq as u64,
                registration: Arc::new(Registration::new(waker.clone())),
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.deadline.duration_since(now).as_millis())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn repolling_and_dropping_release_the_waker() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);
        let mut sleep = sleep(Duration::from_secs(3600));

        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        // Ours, `waker`, and the single registered clone.
        assert_eq!(Arc::strong_count(&counter), 3);

        drop(sleep);
        assert_eq!(Arc::strong_count(&counter), 2);
        drop(waker);
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn repoll_with_new_waker_replaces_registration() {
        let first = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let second = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut sleep = sleep(Duration::from_millis(20));

        let waker = Waker::from(Arc::clone(&first));
        assert!(Pin::new(&mut sleep).poll(&mut Context::from_waker(&waker)).is_pending());
        drop(waker);
        let waker = Waker::from(Arc::clone(&second));
        assert!(Pin::new(&mut sleep).poll(&mut Context::from_waker(&waker)).is_pending());
        assert_eq!(Arc::strong_count(&first), 1);

        let start = Instant::now();
        while second.0.load(AtomicOrdering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(first.0.load(AtomicOrdering::SeqCst), 0);
    }
}
