//! Indexer error types.

use qindex_core::QindexError;

/// Result type for indexing operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Indexer error type.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Connection pool failure.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Entity type has no registered base table.
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Invalid caller-supplied input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Document (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl IndexerError {
    /// Check if the error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Timeout(_) | Self::Pool(_))
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::Timeout("Connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => Self::Pool("Connection pool is closed".to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<IndexerError> for QindexError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::Database(m) => Self::Database(m),
            IndexerError::Timeout(m) => Self::Timeout(m),
            IndexerError::Pool(m) => Self::Pool(m),
            IndexerError::UnknownEntity(m) => Self::UnknownEntity(m),
            IndexerError::InvalidArgument(m) => Self::InvalidArgument(m),
            IndexerError::Serialization(m) => Self::Serialization(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IndexerError::Database("x".to_string()).is_retryable());
        assert!(!IndexerError::UnknownEntity("a:b".to_string()).is_retryable());
    }
}
