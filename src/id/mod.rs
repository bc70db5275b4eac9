//! Clock-sequence identifier generation.
//!
//! [`IdGenerator`] issues monotonically increasing `u64` identifiers built
//! from wall-clock time, a statically assigned worker id and a
//! per-millisecond sequence. [`IdParts`] splits an identifier back into
//! those fields.
//!
//! ```
//! use exclusync::id::{IdGenerator, IdGeneratorOptions, IdParts};
//!
//! let generator = IdGenerator::new(IdGeneratorOptions::for_worker(7)).unwrap();
//! let first = generator.next().unwrap();
//! let second = generator.next().unwrap();
//! assert!(second > first);
//! assert_eq!(IdParts::from_id(first).worker_id, 7);
//! ```

mod generator;
pub mod layout;

pub use generator::{
    IdGenerator, IdGeneratorOptions, DEFAULT_EPOCH_MS, DEFAULT_TIMEBACK_WAIT_THRESHOLD,
    MAX_TIMEBACK_RETRIES,
};
pub use layout::{IdParts, MAX_SEQUENCE, MAX_WORKER_ID};
