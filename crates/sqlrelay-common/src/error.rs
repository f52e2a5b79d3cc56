//! Error types for SQL Relay services

use std::fmt;

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for SQL Relay services
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The rendezvous shm segment or semaphore set is missing or damaged
    #[error("Rendezvous error: {0}")]
    RendezvousError(String),

    /// Client sent a malformed or oversized protocol record
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A configured per-instance limit was exceeded by the client
    #[error("{}", .0.message())]
    LimitExceeded(crate::client_errors::ClientLimitError),

    /// Query execution error surfaced by the driver
    #[error("Query execution failed: {0}")]
    QueryExecutionFailed(String),

    /// The backend database session was lost
    #[error("Database connection lost: {0}")]
    ConnectionLost(String),

    /// No idle connection daemon became available in time
    #[error("No connection daemon available within {0} seconds")]
    ListenerTimeout(u64),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Hand-off of a client descriptor to a daemon failed
    #[error("Hand-off failed: {0}")]
    HandoffFailed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Unix-layer error (sockets, signals, shm)
    #[error("System error: {0}")]
    SystemError(#[from] nix::errno::Errno),

    /// I/O error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RelayError {
    /// Create an internal error from any displayable error
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        RelayError::Internal(err.to_string())
    }

    /// Get the stable error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            RelayError::ConfigError(_) => "CONFIG_ERROR",
            RelayError::RendezvousError(_) => "RENDEZVOUS_ERROR",
            RelayError::ProtocolError(_) => "PROTOCOL_ERROR",
            RelayError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            RelayError::QueryExecutionFailed(_) => "QUERY_FAILED",
            RelayError::ConnectionLost(_) => "CONNECTION_LOST",
            RelayError::ListenerTimeout(_) => "LISTENER_TIMEOUT",
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::HandoffFailed(_) => "HANDOFF_FAILED",
            RelayError::Internal(_) => "INTERNAL",
            RelayError::SystemError(_) => "SYSTEM_ERROR",
            RelayError::IoError(_) => "IO_ERROR",
        }
    }

    /// Whether the error should end the client session but leave the daemon up
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::ProtocolError(_)
                | RelayError::AuthenticationFailed(_)
                | RelayError::ConnectionLost(_)
                | RelayError::IoError(_)
        )
    }
}

impl From<::config::ConfigError> for RelayError {
    fn from(err: ::config::ConfigError) -> Self {
        RelayError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Internal(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RelayError::ConfigError("bad".into()).code(),
            "CONFIG_ERROR"
        );
        assert_eq!(RelayError::ListenerTimeout(10).code(), "LISTENER_TIMEOUT");
    }

    #[test]
    fn test_session_fatal() {
        assert!(RelayError::ProtocolError("short read".into()).is_session_fatal());
        assert!(!RelayError::QueryExecutionFailed("syntax".into()).is_session_fatal());
    }
}
