//! Clock-sequence identifier generator.

use core::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use super::layout::{self, IdParts, MAX_SEQUENCE, MAX_WORKER_ID};
use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::time::{SystemClock, TimeSource};
use crate::tracing_compat::{debug, trace, warn};

/// Default epoch: 2022-01-01T00:00:00Z, in milliseconds since the Unix epoch.
pub const DEFAULT_EPOCH_MS: u64 = 1_640_995_200_000;

/// Default largest clock regression the generator waits out.
pub const DEFAULT_TIMEBACK_WAIT_THRESHOLD: Duration = Duration::from_secs(10);

/// How many regression waits a single call performs before giving up.
pub const MAX_TIMEBACK_RETRIES: u32 = 8;

/// Construction options for [`IdGenerator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdGeneratorOptions {
    /// Reference instant, in milliseconds since the Unix epoch. Must not be
    /// in the future.
    pub epoch_ms: u64,
    /// Worker id in `0..=1023`.
    pub worker_id: u32,
    /// Largest backwards clock jump that is waited out instead of failing.
    pub timeback_wait_threshold: Duration,
}

impl IdGeneratorOptions {
    /// Options for `worker_id` with the default epoch and threshold.
    #[must_use]
    pub fn for_worker(worker_id: u32) -> Self {
        Self {
            worker_id,
            ..Self::default()
        }
    }

    /// Sets the worker id.
    #[must_use]
    pub const fn worker_id(mut self, worker_id: u32) -> Self {
        self.worker_id = worker_id;
        self
    }

    /// Sets the epoch in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn epoch_ms(mut self, epoch_ms: u64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    /// Sets the timeback wait threshold.
    #[must_use]
    pub const fn timeback_wait_threshold(mut self, threshold: Duration) -> Self {
        self.timeback_wait_threshold = threshold;
        self
    }

    fn validate(&self, now: Duration) -> Result<()> {
        if self.worker_id > MAX_WORKER_ID {
            return Err(Error::invalid_config(format!(
                "worker id {} can not be greater than {MAX_WORKER_ID}",
                self.worker_id
            )));
        }
        let now_ms = millis(now);
        if self.epoch_ms > now_ms {
            return Err(Error::invalid_config(format!(
                "epoch {}ms is later than the current time {now_ms}ms",
                self.epoch_ms
            )));
        }
        Ok(())
    }
}

impl Default for IdGeneratorOptions {
    fn default() -> Self {
        Self {
            epoch_ms: DEFAULT_EPOCH_MS,
            worker_id: 0,
            timeback_wait_threshold: DEFAULT_TIMEBACK_WAIT_THRESHOLD,
        }
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    /// First time observed in the current millisecond bucket.
    last_time: Option<Duration>,
    bucket_ms: u64,
    sequence: u64,
    prefix: u64,
}

enum Attempt {
    Issued(u64),
    Regressed(Duration),
}

/// Generates monotonically increasing 64-bit identifiers.
///
/// Each identifier packs the milliseconds elapsed since the configured epoch,
/// the worker id and a per-millisecond sequence (see [`layout`](super::layout)).
/// Values are totally ordered across threads by the internal lock.
///
/// A backwards clock jump no larger than the timeback threshold is waited out
/// with the lock released; larger jumps fail with
/// [`ErrorKind::TimebackExceeded`].
pub struct IdGenerator<C: TimeSource = SystemClock> {
    clock: C,
    epoch_ms: u64,
    worker_id: u32,
    timeback_wait_threshold: Duration,
    state: Mutex<GeneratorState>,
}

impl IdGenerator<SystemClock> {
    /// Creates a generator reading the system clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the worker id exceeds 1023 or the epoch is
    /// in the future.
    pub fn new(options: IdGeneratorOptions) -> Result<Self> {
        Self::with_clock(options, SystemClock)
    }
}

impl<C: TimeSource> IdGenerator<C> {
    /// Creates a generator reading time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the worker id exceeds 1023 or the epoch is
    /// later than `clock.now()`.
    pub fn with_clock(options: IdGeneratorOptions, clock: C) -> Result<Self> {
        options.validate(clock.now())?;
        debug!(
            worker_id = options.worker_id,
            epoch_ms = options.epoch_ms,
            timeback_wait_ms = options.timeback_wait_threshold.as_millis() as u64,
            "id generator created"
        );
        Ok(Self {
            clock,
            epoch_ms: options.epoch_ms,
            worker_id: options.worker_id,
            timeback_wait_threshold: options.timeback_wait_threshold,
            state: Mutex::new(GeneratorState::default()),
        })
    }

    /// Returns the configured worker id.
    #[must_use]
    pub const fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Returns the epoch in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    /// Returns the timeback wait threshold.
    #[must_use]
    pub const fn timeback_wait_threshold(&self) -> Duration {
        self.timeback_wait_threshold
    }

    /// Returns the clock the generator reads.
    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// Splits an identifier produced by this generator.
    #[must_use]
    pub const fn decompose(&self, id: u64) -> IdParts {
        IdParts::from_id(id)
    }

    /// Generates the next identifier.
    ///
    /// Blocks the calling thread while a small clock regression is waited out.
    ///
    /// # Errors
    ///
    /// - `SequenceExhausted` if more than 4095 ids were requested within the
    ///   current millisecond
    /// - `TimebackExceeded` if the clock moved back further than the threshold
    /// - `ClockRegression` if the clock is still behind after
    ///   [`MAX_TIMEBACK_RETRIES`] waits
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> Result<u64> {
        self.generate(None)
    }

    /// Like [`next`](Self::next), but a regression wait observes `cancel`.
    ///
    /// # Errors
    ///
    /// As [`next`](Self::next), plus `Cancelled` if `cancel` fires before or
    /// during a regression wait.
    pub fn next_with_cancel(&self, cancel: &CancelToken) -> Result<u64> {
        self.generate(Some(cancel))
    }

    fn generate(&self, cancel: Option<&CancelToken>) -> Result<u64> {
        for attempt in 0..=MAX_TIMEBACK_RETRIES {
            match self.attempt()? {
                Attempt::Issued(id) => return Ok(id),
                Attempt::Regressed(_) if attempt == MAX_TIMEBACK_RETRIES => break,
                Attempt::Regressed(by) => {
                    warn!(
                        worker_id = self.worker_id,
                        regressed_us = by.as_micros() as u64,
                        attempt,
                        "clock moved backwards, waiting before retry"
                    );
                    match cancel {
                        Some(token) => token.sleep(by)?,
                        None => std::thread::sleep(by),
                    }
                }
            }
        }
        Err(Error::new(ErrorKind::ClockRegression).with_message(format!(
            "clock still behind the last issued id after {MAX_TIMEBACK_RETRIES} waits"
        )))
    }

    fn attempt(&self) -> Result<Attempt> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        match state.last_time {
            Some(last) if now < last => {
                let regressed = last - now;
                if regressed > self.timeback_wait_threshold {
                    return Err(Error::new(ErrorKind::TimebackExceeded).with_message(format!(
                        "clock moved back {regressed:?}, more than the wait threshold {:?}",
                        self.timeback_wait_threshold
                    )));
                }
                return Ok(Attempt::Regressed(regressed));
            }
            Some(last) if now == last => {}
            _ => {
                let bucket_ms = millis(now);
                if state.last_time.is_none() || bucket_ms != state.bucket_ms {
                    let elapsed = bucket_ms.saturating_sub(self.epoch_ms);
                    state.prefix = layout::prefix(elapsed, self.worker_id);
                    state.bucket_ms = bucket_ms;
                    state.sequence = 0;
                    state.last_time = Some(now);
                    trace!(bucket_ms, elapsed, "new millisecond bucket");
                }
            }
        }

        if state.sequence >= MAX_SEQUENCE {
            return Err(Error::new(ErrorKind::SequenceExhausted).with_message(format!(
                "all {MAX_SEQUENCE} sequence values of millisecond {} are used",
                state.bucket_ms
            )));
        }
        state.sequence += 1;
        Ok(Attempt::Issued(state.prefix | state.sequence))
    }
}

impl<C: TimeSource> fmt::Debug for IdGenerator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("worker_id", &self.worker_id)
            .field("epoch_ms", &self.epoch_ms)
            .field("timeback_wait_threshold", &self.timeback_wait_threshold)
            .finish_non_exhaustive()
    }
}

fn millis(since_unix_epoch: Duration) -> u64 {
    u64::try_from(since_unix_epoch.as_millis()).unwrap_or(u64::MAX)
}
