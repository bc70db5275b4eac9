//! Cloneable cancellation token with blocking, timed waits.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::types::CancelReason;

/// Internal shared state for a cancellation token.
struct CancelTokenState {
    /// Fast-path flag, set once.
    cancelled: AtomicBool,
    /// The cancellation reason (set when cancelled).
    reason: Mutex<Option<CancelReason>>,
    /// Signalled when cancellation is requested.
    condvar: Condvar,
}

/// A cancellation token shared between a requester and any number of
/// observers.
///
/// Clones refer to the same cancellation state. The first call to
/// [`cancel`](Self::cancel) wins; later calls only strengthen the reason.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelTokenState>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelTokenState {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.state.reason.lock().clone()
    }

    /// Requests cancellation with the given reason and wakes every waiter.
    ///
    /// Returns true if this call triggered the cancellation (first caller wins).
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self, reason: &CancelReason) -> bool {
        let mut slot = self.state.reason.lock();
        let first = match slot.as_mut() {
            Some(existing) => {
                existing.strengthen(reason);
                false
            }
            None => {
                *slot = Some(reason.clone());
                true
            }
        };
        self.state.cancelled.store(true, Ordering::Release);
        drop(slot);
        self.state.condvar.notify_all();
        first
    }

    /// Returns `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(self.to_error());
        }
        Ok(())
    }

    /// Blocks until cancellation is requested or `timeout` elapses.
    ///
    /// Returns `true` if the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut slot = self.state.reason.lock();
        while slot.is_none() {
            if self.state.condvar.wait_until(&mut slot, deadline).timed_out() {
                return slot.is_some();
            }
        }
        true
    }

    /// Blocks until cancellation is requested.
    pub fn wait(&self) {
        let mut slot = self.state.reason.lock();
        while slot.is_none() {
            self.state.condvar.wait(&mut slot);
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` carrying the token's reason if cancellation is
    /// requested before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        if self.wait_timeout(duration) {
            return Err(self.to_error());
        }
        Ok(())
    }

    fn to_error(&self) -> Error {
        Error::cancelled(&self.reason().unwrap_or_default())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::CancelKind;
    use std::thread;

    #[test]
    fn first_cancel_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        assert!(token.cancel(&CancelReason::user("first")));
        assert!(!token.cancel(&CancelReason::shutdown()));

        assert!(token.is_cancelled());
        // The reason is strengthened by later requests.
        assert_eq!(token.reason().map(|r| r.kind), Some(CancelKind::Shutdown));
        assert_eq!(token.check().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let observer = token.clone();
        token.cancel(&CancelReason::timeout());
        assert!(observer.is_cancelled());
    }

    #[test]
    fn wait_timeout_elapses_without_cancel() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_timeout_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel(&CancelReason::shutdown());
        });

        let start = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().expect("canceller panicked");
    }

    #[test]
    fn sleep_reports_cancellation() {
        let token = CancelToken::new();
        token.cancel(&CancelReason::user("stop"));
        let err = token.sleep(Duration::from_secs(1)).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Cancelled: user: stop");
    }
}
