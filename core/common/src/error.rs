//! Common error types for the synchronization engine.

use std::fmt;

use thiserror::Error;

/// Top-level error type for synchronization operations.
///
/// The variants mirror the taxonomy the orchestrator uses to decide between
/// retrying, skipping and rejecting an event.
#[derive(Debug, Error)]
pub enum Error {
    /// Zero results where exactly one was expected.
    #[error("Not found: {0}")]
    NotFound(String),

    /// More than one result where exactly one was expected.
    #[error("Ambiguous: {0}")]
    Ambiguous(String),

    /// Upstream state has not converged yet; retrying is expected to succeed.
    #[error("Transient inconsistency: {0}")]
    TransientInconsistency(String),

    /// Mapping or schema mismatch. A static bug, never blindly retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network, server or protocol failure talking to an external system.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote system refused a write on validation grounds.
    #[error("Rejected by remote: {0}")]
    BusinessRejection(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`], used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Ambiguous,
    TransientInconsistency,
    Configuration,
    Transport,
    BusinessRejection,
    InvalidInput,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Ambiguous => "ambiguous",
            ErrorKind::TransientInconsistency => "transient_inconsistency",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transport => "transport",
            ErrorKind::BusinessRejection => "business_rejection",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Serialization => "serialization",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Ambiguous(_) => ErrorKind::Ambiguous,
            Error::TransientInconsistency(_) => ErrorKind::TransientInconsistency,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Transport(_) | Error::Io(_) => ErrorKind::Transport,
            Error::BusinessRejection(_) => ErrorKind::BusinessRejection,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether upstream convergence is pending and the whole attempt should be rerun.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientInconsistency(_))
    }

    /// Whether the failure belongs to the transport's own retry policy.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }

    /// Whether an operator should be alerted about this error.
    pub fn needs_alert(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::Io(std::io::Error::other("boom")).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            Error::BusinessRejection("bad value".into()).kind().to_string(),
            "business_rejection"
        );
    }

    #[test]
    fn test_retry_predicates() {
        assert!(Error::TransientInconsistency("primary".into()).is_transient());
        assert!(!Error::Transport("down".into()).is_transient());
        assert!(Error::Transport("down".into()).is_transport());
        assert!(!Error::Configuration("bad".into()).is_transport());
        assert!(Error::Configuration("bad".into()).needs_alert());
    }
}
