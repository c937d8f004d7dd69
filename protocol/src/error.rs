//! # Error Taxonomy
//!
//! Every fallible path in SHOAL speaks the same error language. Rather than
//! one error enum per module, the substrate uses a single taxonomy because
//! the retry and circuit-breaker layers have to classify failures coming
//! from any subsystem: a socket timeout during gossip, a refused tracker
//! connection, and a mid-transfer read error all need the same
//! "is this worth retrying?" answer.
//!
//! Each variant carries a retryability verdict and, where the failing side
//! knows it, a `retry_after_ms` hint. The `code()` string is the short
//! machine code used on the tracker wire (`ERROR <code> <message>`).

use serde::{Deserialize, Serialize};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ShoalError>;

/// The unified error type for the SHOAL substrate.
///
/// Classification, not blame: variants describe what *kind* of failure
/// occurred, so callers can decide policy (retry, fail fast, fall back)
/// without string-matching messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ShoalError {
    /// Caller passed something invalid: empty peer id, port 0, bad address.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named entity does not exist (service, peer, file).
    #[error("not found: {0}")]
    NotFound(String),

    /// The named entity already exists and the operation refuses to clobber it.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Transient infrastructure failure: connection refused, DNS, socket
    /// reset. Worth retrying, possibly after `retry_after_ms`.
    #[error("unavailable: {reason}")]
    Unavailable {
        reason: String,
        retry_after_ms: Option<u64>,
    },

    /// A blocking operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A circuit breaker is open and the call was rejected without being
    /// attempted. `retry_after_ms` is the remaining open window.
    #[error("circuit open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    /// The remote side sent bytes that do not parse as the expected
    /// protocol: malformed tracker line, bad frame, checksum mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bug or an unclassifiable failure. Logged loudly, never retried.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ShoalError {
    /// Shorthand for a transient failure with no retry hint.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            retry_after_ms: None,
        }
    }

    /// Whether a retry layer should attempt this operation again.
    ///
    /// `CircuitOpen` is deliberately non-retryable: the breaker already
    /// decided the dependency is down, and hammering it defeats the point.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout(_))
    }

    /// Server-provided hint for when a retry might succeed.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Unavailable { retry_after_ms, .. } => *retry_after_ms,
            Self::CircuitOpen { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Short machine code for wire protocols and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_PARAMETERS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for ShoalError {
    /// I/O errors map onto the taxonomy by kind. Timeouts become `Timeout`,
    /// everything else that smells transient becomes `Unavailable`, and the
    /// rest lands in `Internal` so it is visible rather than retried forever.
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::Timeout(err.to_string())
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable
            | ErrorKind::Interrupted
            | ErrorKind::UnexpectedEof => Self::unavailable(err.to_string()),
            ErrorKind::NotFound => Self::NotFound(err.to_string()),
            ErrorKind::InvalidData | ErrorKind::InvalidInput => {
                Self::Protocol(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ShoalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ShoalError::unavailable("refused").is_retryable());
        assert!(ShoalError::Timeout("read".into()).is_retryable());

        assert!(!ShoalError::InvalidArgument("x".into()).is_retryable());
        assert!(!ShoalError::NotFound("x".into()).is_retryable());
        assert!(!ShoalError::CircuitOpen { retry_after_ms: 100 }.is_retryable());
        assert!(!ShoalError::Protocol("bad frame".into()).is_retryable());
        assert!(!ShoalError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn retry_after_propagates() {
        let err = ShoalError::Unavailable {
            reason: "busy".into(),
            retry_after_ms: Some(250),
        };
        assert_eq!(err.retry_after_ms(), Some(250));

        let err = ShoalError::CircuitOpen { retry_after_ms: 500 };
        assert_eq!(err.retry_after_ms(), Some(500));

        assert_eq!(ShoalError::Timeout("t".into()).retry_after_ms(), None);
    }

    #[test]
    fn io_error_mapping() {
        use std::io::{Error, ErrorKind};

        let mapped: ShoalError = Error::new(ErrorKind::ConnectionRefused, "no").into();
        assert!(matches!(mapped, ShoalError::Unavailable { .. }));

        let mapped: ShoalError = Error::new(ErrorKind::TimedOut, "slow").into();
        assert!(matches!(mapped, ShoalError::Timeout(_)));

        let mapped: ShoalError = Error::new(ErrorKind::InvalidData, "junk").into();
        assert!(matches!(mapped, ShoalError::Protocol(_)));
    }

    #[test]
    fn codes_are_stable() {
        // These strings appear on the tracker wire; changing one breaks
        // deployed clients.
        assert_eq!(ShoalError::InvalidArgument("".into()).code(), "INVALID_PARAMETERS");
        assert_eq!(ShoalError::unavailable("").code(), "UNAVAILABLE");
        assert_eq!(ShoalError::Protocol("".into()).code(), "PROTOCOL_ERROR");
        assert_eq!(ShoalError::Internal("".into()).code(), "INTERNAL_ERROR");
    }
}
