// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the relay.
//!
//! Errors are split by how the relay reacts to them: retryable errors end the
//! current upstream session and the relay reconnects from its last applied
//! offset; non-retryable errors stop the relay.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connection` | Yes | Upstream unreachable, subscribe failed or timed out |
//! | `Redis` | Yes | Redis command failure on the upstream |
//! | `Stream` | Yes | Stream dropped or closed mid-session |
//! | `StreamParse` | Yes | Malformed upstream entry (reconnect, never skip) |
//! | `Decompression` | Yes | Corrupt zstd payload (reconnect, never skip) |
//! | `StreamTrimmed` | No | Upstream no longer holds the resume point |
//! | `Apply` | No | Local apply failed after bounded retries |
//! | `OrderingViolation` | No | Duplicate or regressing batch (dropped, not raised) |
//! | `InvalidBatch` | No | Empty or non-monotonic batch |
//! | `Storage` | No | Local SQLite errors outside an apply |
//! | `Io` | No | Filesystem errors (data directory) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Relay state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! Cancellation itself is not an error: [`Relay::run`](crate::Relay::run)
//! returns `Ok` when it drains after a shutdown signal.

use crate::offset::Offset;
use crate::sink::ApplyError;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Could not open or keep a subscription to the upstream.
    #[error("Upstream connection error ({upstream}): {message}")]
    Connection { upstream: String, message: String },

    /// Redis command error against the upstream.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: redis::RedisError,
    },

    /// The stream failed or ended mid-session.
    #[error("Stream error: {0}")]
    Stream(String),

    /// An upstream entry could not be turned into a record.
    ///
    /// Retryable in the sense that the session is torn down and re-opened
    /// from the last applied offset; the entry is never skipped.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// zstd payload failed to decode.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// The upstream trimmed its log past our resume point.
    ///
    /// Resuming would silently skip records, so this is fatal.
    #[error("Upstream trimmed past resume point: resume from {resume}, oldest retained {oldest}")]
    StreamTrimmed { resume: Offset, oldest: Offset },

    /// Apply failed after all attempts.
    #[error("Apply failed for batch ending at {position} after {attempts} attempts: {source}")]
    Apply {
        position: Offset,
        attempts: usize,
        #[source]
        source: ApplyError,
    },

    /// A batch arrived at or below the last applied position.
    ///
    /// The relay handles this by dropping the batch; it is surfaced for
    /// logging and for callers that validate streams themselves.
    #[error("Ordering violation: last applied {last_applied}, received batch ending at {received}")]
    OrderingViolation { last_applied: Offset, received: Offset },

    /// Batch construction failed (empty or offsets not increasing).
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// SQLite error outside of an apply.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state (e.g. `run()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source,
        }
    }

    pub fn connection(upstream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            upstream: upstream.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Redis { .. } => true,
            Self::Stream(_) => true,
            Self::StreamParse(_) => true, // re-read from last applied offset
            Self::Decompression(_) => true,
            Self::StreamTrimmed { .. } => false, // data gap
            Self::Apply { .. } => false,
            Self::OrderingViolation { .. } => false,
            Self::InvalidBatch(_) => false,
            Self::Storage(_) => false,
            Self::Io(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_redis() {
        let source = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        let err = RelayError::redis("XREAD", source);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XREAD"));
    }

    #[test]
    fn test_is_retryable_connection() {
        let err = RelayError::connection("redis://upstream:6379", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("upstream:6379"));
    }

    #[test]
    fn test_is_retryable_stream_errors() {
        assert!(RelayError::Stream("closed".to_string()).is_retryable());
        assert!(RelayError::StreamParse("missing op field".to_string()).is_retryable());
        assert!(RelayError::Decompression("bad frame".to_string()).is_retryable());
    }

    #[test]
    fn test_not_retryable_trimmed() {
        let err = RelayError::StreamTrimmed {
            resume: Offset::new(0, 10),
            oldest: Offset::new(2, 0),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("0-10"));
        assert!(err.to_string().contains("2-0"));
    }

    #[test]
    fn test_not_retryable_apply() {
        let err = RelayError::Apply {
            position: Offset::new(0, 5),
            attempts: 3,
            source: ApplyError::Storage("disk full".to_string()),
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("0-5"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_ordering_violation_formatting() {
        let err = RelayError::OrderingViolation {
            last_applied: Offset::new(0, 10),
            received: Offset::new(0, 8),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("0-10"));
        assert!(err.to_string().contains("0-8"));
    }

    #[test]
    fn test_not_retryable_local_errors() {
        assert!(!RelayError::Config("bad namespace".to_string()).is_retryable());
        assert!(!RelayError::InvalidBatch("empty".to_string()).is_retryable());
        assert!(!RelayError::Internal("oops".to_string()).is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!RelayError::from(io).is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = RelayError::InvalidState {
            expected: "Disconnected".to_string(),
            actual: "Closed".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Disconnected"));
        assert!(err.to_string().contains("Closed"));
    }
}
