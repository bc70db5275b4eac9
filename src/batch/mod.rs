//! Deferred batch buffering.
//!
//! [`BatchBuffer`] collects items and flushes them through a
//! [`FlushHandler`] in batches, by item count or by elapsed time, whichever
//! comes first.

mod buffer;
mod handler;

pub use buffer::{BatchBuffer, BatchBufferBuilder, FlushStats};
pub use handler::{Batch, FlushHandler};
