//! Flush handlers and the batches they receive.

use core::fmt;
use std::ops::Deref;

use crate::cancel::CancelToken;
use crate::error::Result;

/// A filled array handed to a [`FlushHandler`].
///
/// The batch owns its items and exposes them read-only; the handler may keep
/// it, move it to another thread, or drop it. Every item appended to a
/// [`BatchBuffer`](super::BatchBuffer) appears in exactly one batch.
pub struct Batch<T> {
    items: Vec<T>,
}

impl<T> Batch<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    /// Returns the items as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Consumes the batch, returning the owned items.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Deref for Batch<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> AsRef<[T]> for Batch<T> {
    fn as_ref(&self) -> &[T] {
        &self.items
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Batch<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: fmt::Debug> fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

/// Receives batches from a [`BatchBuffer`](super::BatchBuffer).
///
/// `flush` runs on whichever thread triggered the flush: an appending
/// caller, a caller of [`flush`](super::BatchBuffer::flush), or the buffer's
/// background thread. It is never called with the buffer's lock held, so it
/// may append to the same buffer.
///
/// The token is the buffer's own; it is cancelled once the buffer is
/// disposed. A handler that hands work to another thread should pass the
/// token along and stop early when it fires.
///
/// Closures with the matching signature implement this trait:
///
/// ```
/// use exclusync::batch::{Batch, BatchBuffer};
/// use exclusync::cancel::CancelToken;
///
/// let buffer = BatchBuffer::builder(|batch: Batch<u32>, _cancel: &CancelToken| -> exclusync::Result<()> {
///     assert!(!batch.is_empty());
///     Ok(())
/// })
/// .flush_threshold(10)
/// .build()
/// .unwrap();
/// buffer.append(1).unwrap();
/// buffer.dispose();
/// ```
pub trait FlushHandler<T>: Send + Sync + 'static {
    /// Processes one batch.
    ///
    /// # Errors
    ///
    /// Any error is returned to the caller that triggered the flush, or
    /// logged when the background thread triggered it.
    fn flush(&self, batch: Batch<T>, cancel: &CancelToken) -> Result<()>;
}

impl<T, F> FlushHandler<T> for F
where
    F: Fn(Batch<T>, &CancelToken) -> Result<()> + Send + Sync + 'static,
{
    fn flush(&self, batch: Batch<T>, cancel: &CancelToken) -> Result<()> {
        self(batch, cancel)
    }
}
