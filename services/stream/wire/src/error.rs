//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete content (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,

    /// Header key or value longer than 255 bytes
    #[error("header '{0}' is longer than 255 bytes")]
    HeaderTooLong(String),

    /// Invalid handshake bytes
    #[error("handshake invalid: {0}")]
    Handshake(String),
}
