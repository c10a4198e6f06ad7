//! Session error types.

use std::time::Duration;
use stream_wire::WireError;
use thiserror::Error;

/// Errors reported to request, connect, and peer-closed handlers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// DNS/TCP failure, peer reset, or liveness timeout
    #[error("connection error: {0}")]
    Connection(String),

    /// TLS negotiation or hostname verification failure
    #[error("handshake error: {0}")]
    Handshake(String),

    /// No response before the request deadline
    #[error("request timeout ({0:?})")]
    Timeout(Duration),

    /// Send attempted without an implicit connect while not connected
    #[error("not connected")]
    NotConnected,

    /// Session was closed by the caller
    #[error("connection closed by self")]
    Closed,

    /// Pending requests are at the concurrency limit
    #[error("too many concurrent requests (limit {limit})")]
    BackpressureExceeded {
        /// Effective concurrency limit
        limit: usize,
    },

    /// Encoded request exceeds the byte limit
    #[error("request.size({size}) > MaxBytes({max})")]
    PayloadTooLarge {
        /// Encoded frame size
        size: usize,
        /// Effective byte limit
        max: usize,
    },

    /// Server answered with a failed status
    #[error("server error: {0}")]
    Server(String),

    /// Request could not be encoded
    #[error("encode error: {0}")]
    Wire(String),
}

impl StreamError {
    /// Whether this failure concerns the whole connection rather than one request
    pub fn is_conn_error(&self) -> bool {
        matches!(
            self,
            StreamError::Connection(_) | StreamError::Handshake(_) | StreamError::Closed
        )
    }

    /// Whether this is a request deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout(_))
    }
}

impl From<WireError> for StreamError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Handshake(reason) => StreamError::Connection(reason),
            other => StreamError::Wire(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Connection(err.to_string())
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_error_classification() {
        assert!(StreamError::Connection("reset".into()).is_conn_error());
        assert!(StreamError::Handshake("bad cert".into()).is_conn_error());
        assert!(StreamError::Closed.is_conn_error());

        assert!(!StreamError::Timeout(Duration::from_secs(1)).is_conn_error());
        assert!(!StreamError::NotConnected.is_conn_error());
        assert!(!StreamError::BackpressureExceeded { limit: 5 }.is_conn_error());
        assert!(!StreamError::PayloadTooLarge { size: 10, max: 5 }.is_conn_error());
        assert!(!StreamError::Server("denied".into()).is_conn_error());
    }

    #[test]
    fn test_wire_error_conversion() {
        let err: StreamError = WireError::HeaderTooLong("k".into()).into();
        assert!(matches!(err, StreamError::Wire(_)));
        assert!(!err.is_conn_error());

        let err: StreamError = WireError::Handshake("short".into()).into();
        assert!(err.is_conn_error());
    }
}
