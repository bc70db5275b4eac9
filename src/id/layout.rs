//! Bit layout of generated identifiers.
//!
//! ```text
//!  63  62 ............... 22  21 ...... 12  11 ....... 0
//! [sign][ elapsed ms (29) ][ worker (10) ][ sequence (12) ]
//! ```
//!
//! The elapsed field is not truncated to its nominal width: it simply
//! continues into the higher bits, keeping ids monotonic. The sign bit stays
//! clear for roughly 69 years after the epoch.

use core::fmt;

/// Width of the per-millisecond sequence field.
pub const SEQUENCE_BITS: u32 = 12;
/// Width of the worker id field.
pub const WORKER_ID_BITS: u32 = 10;
/// Nominal width of the elapsed-milliseconds field.
pub const TIMESTAMP_BITS: u32 = 29;

/// Left shift applied to the worker id.
pub const WORKER_ID_SHIFT: u32 = SEQUENCE_BITS;
/// Left shift applied to the elapsed milliseconds.
pub const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS;

/// Largest accepted worker id (1023).
pub const MAX_WORKER_ID: u32 = (1 << WORKER_ID_BITS) - 1;
/// Largest sequence value within one millisecond (4095).
pub const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

const WORKER_MASK: u64 = MAX_WORKER_ID as u64;

/// An identifier split into its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdParts {
    /// Milliseconds elapsed since the generator's epoch.
    pub elapsed_ms: u64,
    /// Worker id the identifier was generated by.
    pub worker_id: u32,
    /// Sequence number within the millisecond.
    pub sequence: u64,
}

impl IdParts {
    /// Splits `id` into its fields.
    #[must_use]
    pub const fn from_id(id: u64) -> Self {
        Self {
            elapsed_ms: id >> TIMESTAMP_SHIFT,
            worker_id: ((id >> WORKER_ID_SHIFT) & WORKER_MASK) as u32,
            sequence: id & MAX_SEQUENCE,
        }
    }

    /// Packs the fields back into an identifier.
    #[must_use]
    pub const fn to_id(&self) -> u64 {
        (self.elapsed_ms << TIMESTAMP_SHIFT)
            | (((self.worker_id as u64) & WORKER_MASK) << WORKER_ID_SHIFT)
            | (self.sequence & MAX_SEQUENCE)
    }

    /// Returns the generation time in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn unix_ms(&self, epoch_ms: u64) -> u64 {
        epoch_ms.saturating_add(self.elapsed_ms)
    }
}

impl fmt::Display for IdParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{}ms/w{}/s{}",
            self.elapsed_ms, self.worker_id, self.sequence
        )
    }
}

/// Computes the id prefix for a millisecond bucket: everything but the sequence.
#[inline]
pub(crate) const fn prefix(elapsed_ms: u64, worker_id: u32) -> u64 {
    (elapsed_ms << TIMESTAMP_SHIFT) | ((worker_id as u64) << WORKER_ID_SHIFT)
}
