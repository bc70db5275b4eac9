//! Core types shared by the components.
//!
//! - [`id`]: identifier types (`TaskId`)
//! - [`cancel`]: cancellation reason and kind types

pub mod cancel;
pub mod id;

pub use cancel::{CancelKind, CancelReason};
pub use id::TaskId;
