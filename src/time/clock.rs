//! Wall-clock sources.
//!
//! The id generator reads time through [`TimeSource`] so production code can
//! use the system clock while tests drive a [`ManualClock`], including moving
//! it backwards to simulate clock regression.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source abstraction for reading the current wall-clock time.
///
/// Values are measured from the Unix epoch. Unlike a monotonic clock, a
/// wall-clock source may move backwards.
pub trait TimeSource: Send + Sync {
    /// Returns the current time since the Unix epoch.
    fn now(&self) -> Duration;
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Duration {
        // A system clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Manually driven clock for tests.
///
/// Time only moves when told to, in either direction.
///
/// # Example
///
/// ```
/// use exclusync::time::{ManualClock, TimeSource};
/// use std::time::Duration;
///
/// let clock = ManualClock::starting_at(Duration::from_secs(10));
/// clock.advance(Duration::from_millis(5));
/// assert_eq!(clock.now(), Duration::from_millis(10_005));
///
/// clock.rewind(Duration::from_millis(10));
/// assert_eq!(clock.now(), Duration::from_millis(9_995));
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    /// Current time in nanoseconds since the Unix epoch.
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock reading the current system time.
    #[must_use]
    pub fn from_system() -> Self {
        Self::starting_at(SystemClock.now())
    }

    /// Creates a manual clock starting at the given time.
    #[must_use]
    pub fn starting_at(since_unix_epoch: Duration) -> Self {
        Self {
            now: AtomicU64::new(saturating_nanos(since_unix_epoch)),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(saturating_nanos(by), Ordering::AcqRel);
    }

    /// Moves time backwards, saturating at the Unix epoch.
    pub fn rewind(&self, by: Duration) {
        let by = saturating_nanos(by);
        let _ = self
            .now
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |now| {
                Some(now.saturating_sub(by))
            });
    }

    /// Sets the current time.
    pub fn set(&self, since_unix_epoch: Duration) {
        self.now
            .store(saturating_nanos(since_unix_epoch), Ordering::Release);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now.load(Ordering::Acquire))
    }
}

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
