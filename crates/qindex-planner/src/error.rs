//! Planner error types.

use qindex_core::QindexError;

/// Result type for planner operations.
pub type Result<T> = std::result::Result<T, PlannerError>;

/// Planner error type.
///
/// Partial coverage is not an error; it travels as
/// [`crate::options::PartialIndexWarning`] inside a successful result.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// Invalid caller-supplied input; the query was not executed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database failure, surfaced to the caller unchanged.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity type has no registered base table.
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Result row (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for PlannerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PlannerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<PlannerError> for QindexError {
    fn from(err: PlannerError) -> Self {
        match err {
            PlannerError::InvalidArgument(m) => Self::InvalidArgument(m),
            PlannerError::Database(m) => Self::Database(m),
            PlannerError::UnknownEntity(m) => Self::UnknownEntity(m),
            PlannerError::Serialization(m) => Self::Serialization(m),
        }
    }
}
