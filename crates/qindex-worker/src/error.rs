//! Worker error types.

use qindex_core::QindexError;
use qindex_coverage::CoverageError;
use qindex_indexer::IndexerError;

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Worker error type.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity type has no registered base table.
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Invalid caller-supplied input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Index write failure.
    #[error(transparent)]
    Indexer(#[from] IndexerError),

    /// Coverage bookkeeping failure.
    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

impl From<sqlx::Error> for WorkerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<WorkerError> for QindexError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Database(m) => Self::Database(m),
            WorkerError::UnknownEntity(m) => Self::UnknownEntity(m),
            WorkerError::InvalidArgument(m) => Self::InvalidArgument(m),
            WorkerError::Indexer(e) => e.into(),
            WorkerError::Coverage(e) => e.into(),
        }
    }
}
