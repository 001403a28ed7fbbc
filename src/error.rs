//! Error types and error handling strategy.
//!
//! The crate distinguishes three failure classes:
//!
//! - **Contract violations** by callers (posting with main-thread state from
//!   the wrong thread, delayed fences on queues that did not opt in,
//!   corrupted internal invariants) are programming errors and panic with a
//!   diagnostic.
//! - **Expected rejections** (posting after shutdown or to an unregistered
//!   queue) surface as `false` from the public post APIs; internally they
//!   carry a typed [`ErrorKind`] so tests and logging can tell them apart.
//! - **Cancellation** (a bound callback whose owner is gone) is silent: the
//!   task is skipped or swept, never reported.

use core::fmt;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The queue was unregistered; its runners reject new work.
    QueueUnregistered,
    /// The manager is shutting down and no longer accepts posts.
    ShuttingDown,
    /// The post arrived before the queue was bound to a manager.
    NotAccepting,
    /// Internal invariant failure (a bug in this crate).
    Internal,
}

impl ErrorKind {
    /// True if a caller should treat this as an ordinary rejection rather
    /// than a bug.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::QueueUnregistered | Self::ShuttingDown | Self::NotAccepting
        )
    }
}

/// The error type for sequencing operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates an internal error (a bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
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

impl std::error::Error for Error {}

/// A specialized Result type for sequencing operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::ShuttingDown);
        assert_eq!(err.to_string(), "ShuttingDown");
    }

    #[test]
    fn display_with_message() {
        let err = Error::new(ErrorKind::QueueUnregistered).with_message("runner went stale");
        assert_eq!(err.to_string(), "QueueUnregistered: runner went stale");
    }

    #[test]
    fn rejection_classification() {
        assert!(ErrorKind::QueueUnregistered.is_rejection());
        assert!(ErrorKind::ShuttingDown.is_rejection());
        assert!(ErrorKind::NotAccepting.is_rejection());
        assert!(!ErrorKind::Internal.is_rejection());
    }

    #[test]
    fn internal_constructor() {
        let err = Error::internal("heap entry missing");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), Some("heap entry missing"));
    }
}
