//! Migration types and utilities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Migration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Migration is pending.
    Pending,
    /// Migration completed successfully.
    Applied,
    /// Migration failed.
    Failed,
    /// Migration was rolled back.
    RolledBack,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A database migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version (timestamp-based).
    pub version: i64,
    /// Migration name.
    pub name: String,
    /// SQL to apply the migration.
    pub up_sql: String,
    /// SQL to roll back the migration (optional).
    pub down_sql: Option<String>,
    /// Checksum of the up SQL.
    pub checksum: String,
}

impl Migration {
    /// Create a new migration.
    #[must_use]
    pub fn new(version: i64, name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        let up_sql = up_sql.into();
        let checksum = Self::compute_checksum(&up_sql);
        Self {
            version,
            name: name.into(),
            up_sql,
            down_sql: None,
            checksum,
        }
    }

    /// Set the down SQL for rollback.
    #[must_use]
    pub fn with_down(mut self, down_sql: impl Into<String>) -> Self {
        self.down_sql = Some(down_sql.into());
        self
    }

    /// Compute checksum for SQL content.
    #[must_use]
    pub fn compute_checksum(sql: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify the checksum.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(&self.up_sql) == self.checksum
    }

    /// Check if rollback is supported.
    #[must_use]
    pub fn supports_rollback(&self) -> bool {
        self.down_sql.is_some()
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{} - {}", self.version, self.name)
    }
}

/// Record of an applied migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration version.
    pub version: i64,
    /// Migration name.
    pub name: String,
    /// Checksum when applied.
    pub checksum: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
    /// Execution time in milliseconds.
    pub execution_time_ms: i64,
    /// Current status.
    pub status: MigrationStatus,
    /// Error message if failed.
    pub error: Option<String>,
}

impl MigrationRecord {
    /// Create a new pending record for a migration.
    #[must_use]
    pub fn new(migration: &Migration) -> Self {
        Self {
            version: migration.version,
            name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            applied_at: Utc::now(),
            execution_time_ms: 0,
            status: MigrationStatus::Pending,
            error: None,
        }
    }

    /// Mark as applied with execution time.
    #[must_use]
    pub fn applied(mut self, execution_time_ms: i64) -> Self {
        self.status = MigrationStatus::Applied;
        self.execution_time_ms = execution_time_ms;
        self.applied_at = Utc::now();
        self
    }

    /// Mark as failed with error.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = MigrationStatus::Failed;
        self.error = Some(error.into());
        self
    }

    /// Check if the migration was successful.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.status == MigrationStatus::Applied
    }
}

impl fmt::Display for MigrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "V{} - {} [{}] ({}ms)",
            self.version, self.name, self.status, self.execution_time_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creation() {
        let m = Migration::new(1, "create_entity_indexes", "CREATE TABLE entity_indexes ();");
        assert_eq!(m.version, 1);
        assert!(!m.checksum.is_empty());
        assert!(!m.supports_rollback());
        assert!(m.verify_checksum());
    }

    #[test]
    fn test_checksum_differs_by_sql() {
        assert_ne!(
            Migration::compute_checksum("SELECT 1;"),
            Migration::compute_checksum("SELECT 2;")
        );
    }

    #[test]
    fn test_record_lifecycle() {
        let m = Migration::new(1, "test", "SELECT 1;");
        let record = MigrationRecord::new(&m).applied(42);
        assert!(record.is_successful());
        assert_eq!(record.execution_time_ms, 42);

        let failed = MigrationRecord::new(&m).failed("boom");
        assert!(!failed.is_successful());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
