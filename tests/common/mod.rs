#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use exclusync::time::TimeSource;
use parking_lot::Mutex;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::collections::VecDeque;
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "EXCLUSYNC_PROPTEST_SEED";

/// Upper bound for any wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    // Honor an existing PROPTEST_RNG_SEED, otherwise apply our own.
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = read_proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    // If CI is set and no explicit seed is provided, use a fixed seed.
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }
    None
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("exclusync=trace")),
            )
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition.
pub fn test_phase(name: &str) {
    tracing::info!(phase = %name, "========================================");
    tracing::info!(phase = %name, "TEST PHASE: {}", name);
    tracing::info!(phase = %name, "========================================");
}

/// Log test completion.
pub fn test_complete(name: &str) {
    tracing::info!(test = %name, "test completed successfully: {}", name);
}

/// Polls `condition` every millisecond until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A clock that replays a fixed script of readings, then repeats the last one.
#[derive(Debug)]
pub struct ScriptedClock {
    readings: Mutex<VecDeque<Duration>>,
}

impl ScriptedClock {
    /// Creates a clock replaying `readings` in order. Must not be empty.
    pub fn new(readings: impl IntoIterator<Item = Duration>) -> Self {
        let readings: VecDeque<_> = readings.into_iter().collect();
        assert!(!readings.is_empty(), "script needs at least one reading");
        Self {
            readings: Mutex::new(readings),
        }
    }

    /// Readings not consumed yet (the last one is never consumed).
    pub fn remaining(&self) -> usize {
        self.readings.lock().len()
    }
}

impl TimeSource for ScriptedClock {
    fn now(&self) -> Duration {
        let mut readings = self.readings.lock();
        if readings.len() > 1 {
            readings.pop_front().unwrap_or_default()
        } else {
            readings.front().copied().unwrap_or_default()
        }
    }
}
