//! Error types and error handling strategy for exclusync.
//!
//! Every fallible operation in the crate returns [`Result`], whose error
//! carries an [`ErrorKind`], an optional message and an optional source.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Panics inside scheduled work are caught and converted to `Panicked`
//! - Errors are classified by recoverability for retry logic
//!
//! # Error Categories
//!
//! - **Configuration**: invalid construction parameters; fail fast
//! - **Capacity**: a bounded counter ran out (sequence exhaustion)
//! - **Temporal**: the wall clock moved backwards
//! - **Lifecycle**: the component was disposed, or a wait would deadlock
//! - **Cancellation**: cooperative cancellation was observed
//! - **Callback**: user code failed (flush handler error, panic)
//! - **Internal**: bugs and OS resource failures

use core::fmt;
use std::sync::Arc;

use crate::types::CancelReason;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Configuration ===
    /// A construction parameter is out of range.
    InvalidConfig,

    // === Capacity ===
    /// The per-millisecond sequence counter overflowed.
    SequenceExhausted,

    // === Temporal ===
    /// The clock moved backwards further than the wait threshold allows.
    TimebackExceeded,
    /// The clock kept regressing after the bounded number of retries.
    ClockRegression,

    // === Lifecycle ===
    /// The component has already been disposed.
    Disposed,
    /// A blocking wait on the dedicated thread would wait on itself.
    ReentrantWait,

    // === Cancellation ===
    /// Operation was cancelled.
    Cancelled,

    // === Callback ===
    /// A flush handler reported a failure.
    FlushFailed,
    /// Scheduled work panicked.
    Panicked,
    /// User-provided error.
    User,

    // === Internal ===
    /// Internal error (bug or OS resource failure).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig => ErrorCategory::Configuration,
            Self::SequenceExhausted => ErrorCategory::Capacity,
            Self::TimebackExceeded | Self::ClockRegression => ErrorCategory::Temporal,
            Self::Disposed | Self::ReentrantWait => ErrorCategory::Lifecycle,
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::FlushFailed | Self::Panicked | Self::User => ErrorCategory::Callback,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            // The next millisecond bucket or a settled clock may succeed.
            Self::SequenceExhausted | Self::ClockRegression => Recoverability::Transient,

            Self::InvalidConfig
            | Self::TimebackExceeded
            | Self::Disposed
            | Self::ReentrantWait
            | Self::Cancelled
            | Self::Internal => Recoverability::Permanent,

            Self::FlushFailed | Self::Panicked | Self::User => Recoverability::Unknown,
        }
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.recoverability(), Recoverability::Transient)
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Permanent failure that will not succeed on retry.
    Permanent,
    /// Recoverability depends on context and cannot be determined
    /// from the error kind alone.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this error should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid construction parameters.
    Configuration,
    /// Exhausted bounded capacity.
    Capacity,
    /// Wall-clock anomalies.
    Temporal,
    /// Use of a disposed component or a self-deadlocking wait.
    Lifecycle,
    /// Cooperative cancellation.
    Cancellation,
    /// Failures raised by user code.
    Callback,
    /// Internal errors.
    Internal,
}

/// The main error type for exclusync operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if the component was already disposed.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        matches!(self.kind, ErrorKind::Disposed)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(format!("{reason}"))
    }

    /// Creates a disposed-resource error naming the component.
    #[must_use]
    pub fn disposed(component: &str) -> Self {
        Self::new(ErrorKind::Disposed).with_message(format!("{component} has been disposed"))
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig).with_message(detail)
    }

    /// Creates a user error carrying `source`.
    #[must_use]
    pub fn user(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::User).with_source(source)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Internal).with_source(err)
    }
}

/// Extension trait for adding context to Results.
///
/// Any error convertible into [`Error`] gains a message, for example an
/// [`std::io::Error`] from spawning a thread becomes an `Internal` error
/// carrying the OS error as its source.
#[allow(clippy::result_large_err)]
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for exclusync operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;
