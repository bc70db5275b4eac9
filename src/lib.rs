//! Exclusync: thread-affinity scheduling, deferred batch flushing and
//! clock-sequence identifiers.
//!
//! # Overview
//!
//! Three independent concurrency primitives meant to be embedded in larger
//! services:
//!
//! - **Thread affinity**: a [`Scheduler`] pins all submitted work, including
//!   recursively submitted work and every resumption of spawned futures, to
//!   one dedicated thread
//! - **Deferred batches**: a [`BatchBuffer`] collects items and hands them to
//!   a flush handler when a size threshold or a time interval is reached,
//!   whichever comes first
//! - **Identifiers**: an [`IdGenerator`] packs elapsed milliseconds, a worker
//!   id and a sequence number into monotonically increasing `u64` values and
//!   waits out small clock regressions
//!
//! # Module Structure
//!
//! - [`runtime`]: the thread-affinity scheduler and task handles
//! - [`batch`]: the deferred batch buffer
//! - [`id`]: the identifier generator and bit layout
//! - [`cancel`]: cooperative cancellation tokens
//! - [`time`]: wall-clock sources and a sleep future
//! - [`config`]: environment and TOML configuration
//! - [`error`]: error types
//! - [`types`]: task identifiers and cancellation reasons
//! - [`tracing_compat`]: logging facade

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod batch;
pub mod cancel;
pub mod config;
pub mod error;
pub mod id;
pub mod runtime;
pub mod time;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use batch::{Batch, BatchBuffer, FlushHandler, FlushStats};
pub use cancel::CancelToken;
pub use config::{BatchBufferConfig, ConfigError, ExclusyncConfig, SchedulerConfig};
pub use error::{Error, ErrorCategory, ErrorKind, Recoverability, Result, ResultExt};
pub use id::{IdGenerator, IdGeneratorOptions, IdParts};
pub use runtime::{Scheduler, SchedulerHandle, TaskHandle, WeakSchedulerHandle};
pub use types::{CancelKind, CancelReason, TaskId};
