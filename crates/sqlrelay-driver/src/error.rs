//! Driver error payload

/// Result alias for driver operations
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// The three-field error every driver operation may return, plus the
/// flag that decides whether the session can continue
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{native_code}] {sqlstate}: {message}")]
pub struct DriverError {
    /// Backend-native error code
    pub native_code: i64,
    /// SQLSTATE or SQLSTATE-like tag
    pub sqlstate: String,
    /// Human-readable message
    pub message: String,
    /// False when the backend session is gone and the daemon must
    /// re-log-in before serving another client
    pub connection_alive: bool,
}

impl DriverError {
    /// A recoverable error; the session continues
    pub fn recoverable(native_code: i64, sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            native_code,
            sqlstate: sqlstate.to_string(),
            message: message.into(),
            connection_alive: true,
        }
    }

    /// A connection-lost error; the daemon drops the client and
    /// re-logs-in
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            native_code: 0,
            sqlstate: "08000".to_string(),
            message: message.into(),
            connection_alive: false,
        }
    }

    /// Driver refused the credentials
    pub fn auth_refused(message: impl Into<String>) -> Self {
        Self {
            native_code: 0,
            sqlstate: "IM001".to_string(),
            message: message.into(),
            connection_alive: true,
        }
    }

    /// Truncate the message to a configured maximum for the wire
    pub fn truncated_message(&self, max_len: u32) -> &str {
        let max = max_len as usize;
        if max == 0 || self.message.len() <= max {
            return &self.message;
        }
        let mut end = max;
        while end > 0 && !self.message.is_char_boundary(end) {
            end -= 1;
        }
        &self.message[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_liveness() {
        assert!(DriverError::recoverable(1064, "42000", "syntax").connection_alive);
        assert!(!DriverError::disconnected("gone").connection_alive);
        assert_eq!(DriverError::auth_refused("no").sqlstate, "IM001");
    }

    #[test]
    fn message_truncation_respects_char_boundaries() {
        let err = DriverError::recoverable(1, "42000", "héllo wörld");
        assert_eq!(err.truncated_message(0), "héllo wörld");
        assert_eq!(err.truncated_message(3), "hé");
        assert_eq!(err.truncated_message(100), "héllo wörld");
    }
}
