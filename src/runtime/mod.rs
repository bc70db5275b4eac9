//! Thread-affinity execution.
//!
//! - [`Scheduler`]: owns one dedicated thread that runs every submitted
//!   closure and every poll of every spawned future
//! - [`SchedulerHandle`] / [`WeakSchedulerHandle`]: cloneable submission
//!   handles
//! - [`TaskHandle`]: awaits a submitted task, blocking or as a future

mod affinity;
mod task;
mod task_handle;

pub use affinity::{Scheduler, SchedulerHandle, WeakSchedulerHandle};
pub use task_handle::TaskHandle;
