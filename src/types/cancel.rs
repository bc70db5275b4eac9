//! Cancellation reason and kind types.
//!
//! A [`CancelReason`] travels with every cancellation request so the party
//! observing it (a flush handler, a waiting id generator, an abandoned task
//! handle) can tell a shutdown from an explicit user request.

use core::fmt;

/// The kind of cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit cancellation requested by user code.
    User,
    /// Cancellation due to a timeout.
    Timeout,
    /// Cancellation due to the owning component being disposed.
    Shutdown,
}

impl CancelKind {
    /// Returns the severity of this cancellation kind.
    ///
    /// Higher severity cancellations take precedence when strengthening.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::User => 0,
            Self::Timeout => 1,
            Self::Shutdown => 2,
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Timeout => write!(f, "timeout"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The reason for a cancellation, including kind and optional context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    /// The kind of cancellation.
    pub kind: CancelKind,
    /// Optional human-readable message.
    pub message: Option<&'static str>,
}

impl CancelReason {
    /// Creates a new cancellation reason with the given kind.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates a user cancellation reason with a message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            message: Some(message),
        }
    }

    /// Creates a timeout cancellation reason.
    #[must_use]
    pub const fn timeout() -> Self {
        Self::new(CancelKind::Timeout)
    }

    /// Creates a shutdown cancellation reason.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Strengthens this reason with another, keeping the more severe one.
    ///
    /// Returns `true` if the reason was changed.
    pub fn strengthen(&mut self, other: &Self) -> bool {
        if other.kind > self.kind {
            self.kind = other.kind;
            self.message = other.message;
            return true;
        }
        if other.kind == self.kind && self.message.is_none() && other.message.is_some() {
            self.message = other.message;
            return true;
        }
        false
    }

    /// Returns true if this reason indicates shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.kind, CancelKind::Shutdown)
    }

    /// Returns the kind of this cancellation reason.
    #[must_use]
    pub const fn kind(&self) -> CancelKind {
        self.kind
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(CancelKind::User.severity() < CancelKind::Timeout.severity());
        assert!(CancelKind::Timeout.severity() < CancelKind::Shutdown.severity());
    }

    #[test]
    fn strengthen_takes_more_severe() {
        let mut reason = CancelReason::user("stop");
        assert!(reason.strengthen(&CancelReason::shutdown()));
        assert_eq!(reason.kind, CancelKind::Shutdown);
        assert_eq!(reason.message, None);

        // Less severe should not change.
        assert!(!reason.strengthen(&CancelReason::timeout()));
        assert_eq!(reason.kind, CancelKind::Shutdown);
    }

    #[test]
    fn strengthen_fills_missing_message() {
        let mut reason = CancelReason::new(CancelKind::User);
        assert!(reason.strengthen(&CancelReason::user("a")));
        assert_eq!(reason.message, Some("a"));
        assert!(!reason.strengthen(&CancelReason::user("b")));
        assert_eq!(reason.message, Some("a"));
    }

    #[test]
    fn display_includes_message() {
        assert_eq!(CancelReason::user("bye").to_string(), "user: bye");
        assert_eq!(CancelReason::shutdown().to_string(), "shutdown");
    }
}
