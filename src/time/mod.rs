//! Time primitives.
//!
//! - [`TimeSource`]: pluggable wall-clock source, with [`SystemClock`] for
//!   production and [`ManualClock`] for tests
//! - [`Sleep`]: a future that completes after a deadline, usable inside
//!   futures spawned on a [`Scheduler`](crate::runtime::Scheduler)

mod clock;
mod sleep;

pub use clock::{ManualClock, SystemClock, TimeSource};
pub use sleep::{sleep, sleep_until, Sleep};
