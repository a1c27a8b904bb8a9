//! Coverage error types.

use qindex_core::QindexError;

/// Result type for coverage operations.
pub type Result<T> = std::result::Result<T, CoverageError>;

/// Coverage error type.
#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
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
}

impl CoverageError {
    /// Check if the error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Timeout(_) | Self::Pool(_))
    }
}

impl From<sqlx::Error> for CoverageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::Timeout("Connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => Self::Pool("Connection pool is closed".to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<CoverageError> for QindexError {
    fn from(err: CoverageError) -> Self {
        match err {
            CoverageError::Database(m) => Self::Database(m),
            CoverageError::Timeout(m) => Self::Timeout(m),
            CoverageError::Pool(m) => Self::Pool(m),
            CoverageError::UnknownEntity(m) => Self::UnknownEntity(m),
            CoverageError::InvalidArgument(m) => Self::InvalidArgument(m),
        }
    }
}
