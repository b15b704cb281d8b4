//! Boundary error type.
//!
//! Everything surfaced to wire clients or CLI callers is one of these
//! kinds. Internal delivery timeouts never become errors; they are counted
//! and the subscription stays alive.

use thiserror::Error;

/// Errors surfaced at the service boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A required field was empty or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown worker, or a config file that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A worker could not be reached for a direct push.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An operation did not complete within its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer closed a client-streaming call. Treated as clean
    /// termination by callers.
    #[error("stream closed")]
    StreamClosed,

    /// Failed to decode a payload (wire frame or config file).
    #[error("decode error: {0}")]
    Decode(String),

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Short machine-readable kind, used as the wire representation.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::StreamClosed => "stream_closed",
            Self::Decode(_) => "decode",
            Self::Transport(_) => "transport",
            Self::Io(_) => "io",
        }
    }

    /// True for transport failures that a dialer may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Transport(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(ApiError::NotFound("w1".into()).kind(), "not_found");
        assert_eq!(ApiError::StreamClosed.kind(), "stream_closed");
        assert_eq!(
            ApiError::InvalidArgument("id missing".into()).kind(),
            "invalid_argument"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ApiError::Unavailable("refused".into()).is_retryable());
        assert!(!ApiError::NotFound("w1".into()).is_retryable());
        assert!(!ApiError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ApiError::NotFound("local worker [w9]".into());
        assert_eq!(err.to_string(), "not found: local worker [w9]");
    }
}
