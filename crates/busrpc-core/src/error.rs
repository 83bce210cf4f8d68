//! Error types for busrpc operations.
//!
//! Configuration, transport and protocol failures share one enum so that a
//! stream can remember the cause it was closed with and a handler error can
//! be shipped back to the caller over the bus.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for busrpc operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Coarse classification of an error, carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Unknown,
    Canceled,
    DeadlineExceeded,
    Unavailable,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Internal,
    MalformedRequest,
    MalformedResponse,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::Canceled => "canceled",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Internal => "internal",
            ErrorCode::MalformedRequest => "malformed_request",
            ErrorCode::MalformedResponse => "malformed_response",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while serving or calling over the bus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("server is shut down")]
    ServerClosed,

    #[error("handler already exists: {0}")]
    HandlerExists(String),

    #[error("no response from servers")]
    NoResponse,

    #[error("request timed out")]
    RequestTimeout,

    #[error("timed out waiting for stream ack")]
    AckTimeout,

    #[error("stream closed")]
    StreamClosed,

    #[error("streams are not enabled on this client")]
    StreamsDisabled,

    #[error("canceled")]
    Canceled,

    #[error("bus error: {0}")]
    Bus(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("{code}: {message}")]
    Status { code: ErrorCode, message: String },
}

impl RpcError {
    /// Build an error with an explicit code, typically from a user handler.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError::Status {
            code,
            message: message.into(),
        }
    }

    /// The wire classification for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::ServerClosed => ErrorCode::Unavailable,
            RpcError::HandlerExists(_) => ErrorCode::AlreadyExists,
            RpcError::NoResponse => ErrorCode::Unavailable,
            RpcError::RequestTimeout | RpcError::AckTimeout => ErrorCode::DeadlineExceeded,
            RpcError::StreamClosed | RpcError::Canceled => ErrorCode::Canceled,
            RpcError::StreamsDisabled => ErrorCode::InvalidArgument,
            RpcError::Bus(_) => ErrorCode::Unavailable,
            RpcError::Codec(_) => ErrorCode::MalformedRequest,
            RpcError::Status { code, .. } => *code,
        }
    }

    /// Whether this error is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        self.code() == ErrorCode::DeadlineExceeded
    }
}

impl From<bincode::Error> for RpcError {
    fn from(e: bincode::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let err = RpcError::new(ErrorCode::NotFound, "no such room");
        assert_eq!(err.to_string(), "not_found: no such room");
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_timeouts_classified() {
        assert!(RpcError::AckTimeout.is_timeout());
        assert!(RpcError::RequestTimeout.is_timeout());
        assert!(!RpcError::StreamClosed.is_timeout());
    }
}
