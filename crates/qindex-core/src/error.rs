//! Shared error taxonomy for the query-index subsystem.

/// Result type for cross-crate query-index operations.
pub type QindexResult<T> = std::result::Result<T, QindexError>;

/// Error type shared across the query-index crates.
///
/// Crates that own richer failure detail define their own error enums and
/// convert into this taxonomy at crate boundaries (event handlers, the
/// planner surface, the status aggregator).
#[derive(Debug, thiserror::Error)]
pub enum QindexError {
    /// Invalid caller-supplied input; the operation had no side effects.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database-level failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Connection pool failure.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Payload or document (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage encrypt/decrypt hook failure.
    #[error("Cipher hook error: {0}")]
    Cipher(String),

    /// Event bus emit or dispatch failure.
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Entity type has no registered base table.
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),
}

impl QindexError {
    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an event bus error.
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    /// Check if the error is retryable by bus redelivery.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Timeout(_) | Self::Pool(_)
        )
    }
}

impl From<serde_json::Error> for QindexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QindexError::UnknownEntity("example:todo".to_string());
        assert!(err.to_string().contains("example:todo"));

        let err = QindexError::invalid_argument("tenantId is required");
        assert!(err.to_string().contains("Invalid argument"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(QindexError::database("timeout").is_retryable());
        assert!(QindexError::Timeout("lock".to_string()).is_retryable());
        assert!(QindexError::Pool("closed".to_string()).is_retryable());
        assert!(!QindexError::invalid_argument("bad").is_retryable());
        assert!(!QindexError::Cipher("down".to_string()).is_retryable());
    }
}
