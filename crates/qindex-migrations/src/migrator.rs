//! Migration runner.

use crate::config::{MigrationConfig, MIGRATIONS_TABLE};
use crate::error::{MigrationError, Result};
use crate::migration::{Migration, MigrationRecord, MigrationStatus};
use crate::pool::IndexPool;
use sqlx::{Executor, Row};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, error, info};

/// Migration runner for the query-index tables.
pub struct Migrator {
    pool: IndexPool,
    migrations: Vec<Migration>,
    config: MigrationConfig,
}

impl Migrator {
    /// Create a migrator over an existing pool.
    #[must_use]
    pub fn new(pool: IndexPool, config: MigrationConfig) -> Self {
        Self {
            pool,
            migrations: Vec::new(),
            config,
        }
    }

    /// Add multiple migrations, kept sorted by version.
    pub fn add_migrations(&mut self, migrations: impl IntoIterator<Item = Migration>) -> &mut Self {
        self.migrations.extend(migrations);
        self.migrations.sort_by_key(|m| m.version);
        self
    }

    /// Get the list of migrations.
    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Initialize the migrations bookkeeping table.
    pub async fn init(&self) -> Result<()> {
        let sql = format!(
            r"
            CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                checksum VARCHAR(64) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                execution_time_ms BIGINT NOT NULL DEFAULT 0,
                status VARCHAR(20) NOT NULL DEFAULT 'applied',
                error TEXT
            );
            "
        );

        sqlx::query(&sql)
            .execute(self.pool.inner())
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;

        debug!("Migrations table initialized");
        Ok(())
    }

    /// Get applied migrations.
    pub async fn get_applied(&self) -> Result<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT version, name, checksum, applied_at, execution_time_ms, status, error
             FROM {MIGRATIONS_TABLE}
             ORDER BY version"
        );

        let rows = sqlx::query(&sql)
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let status_str: String = row.get("status");
            let status = match status_str.as_str() {
                "pending" => MigrationStatus::Pending,
                "failed" => MigrationStatus::Failed,
                "rolled_back" => MigrationStatus::RolledBack,
                _ => MigrationStatus::Applied,
            };

            records.push(MigrationRecord {
                version: row.get("version"),
                name: row.get("name"),
                checksum: row.get("checksum"),
                applied_at: row.get("applied_at"),
                execution_time_ms: row.get("execution_time_ms"),
                status,
                error: row.get("error"),
            });
        }

        Ok(records)
    }

    /// Get pending migrations.
    pub async fn get_pending(&self) -> Result<Vec<&Migration>> {
        let applied = self.get_applied().await?;
        let applied_versions: HashSet<i64> = applied.iter().map(|r| r.version).collect();

        Ok(self
            .migrations
            .iter()
            .filter(|m| !applied_versions.contains(&m.version))
            .collect())
    }

    /// Run all pending migrations.
    pub async fn run_pending(&self) -> Result<Vec<MigrationRecord>> {
        self.init().await?;

        let pending = self.get_pending().await?;
        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(Vec::new());
        }

        info!("Running {} pending migration(s)", pending.len());

        let mut results = Vec::new();
        for migration in pending {
            let result = self.run_migration(migration).await?;
            results.push(result);
        }

        Ok(results)
    }

    /// Run a specific migration.
    pub async fn run_migration(&self, migration: &Migration) -> Result<MigrationRecord> {
        info!(version = migration.version, name = %migration.name, "Running migration");

        let applied = self.get_applied().await?;
        if applied.iter().any(|r| r.version == migration.version) {
            return Err(MigrationError::AlreadyApplied {
                version: migration.version,
            });
        }

        if self.config.verify_checksums && !migration.verify_checksum() {
            return Err(MigrationError::ChecksumMismatch {
                version: migration.version,
                expected: migration.checksum.clone(),
                actual: Migration::compute_checksum(&migration.up_sql),
            });
        }

        let start = Instant::now();
        let mut record = MigrationRecord::new(migration);

        let result = if self.config.use_transactions {
            self.execute_in_transaction(&migration.up_sql).await
        } else {
            self.execute_sql(&migration.up_sql).await
        };

        let execution_time = start.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                record = record.applied(execution_time);
                self.save_record(&record).await?;
                info!(
                    version = migration.version,
                    name = %migration.name,
                    execution_time_ms = execution_time,
                    "Migration applied successfully"
                );
            }
            Err(e) => {
                record = record.failed(e.to_string());
                if let Err(save_err) = self.save_record(&record).await {
                    error!(error = %save_err, "Failed to save migration failure record");
                }
                error!(
                    version = migration.version,
                    name = %migration.name,
                    error = %e,
                    "Migration failed"
                );
                return Err(e);
            }
        }

        Ok(record)
    }

    /// Roll back a migration.
    pub async fn rollback(&self, version: i64) -> Result<MigrationRecord> {
        let migration = self
            .migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or(MigrationError::NotFound { version })?;

        let down_sql = migration
            .down_sql
            .as_ref()
            .ok_or(MigrationError::RollbackNotSupported { version })?;

        info!(version, name = %migration.name, "Rolling back migration");

        let result = if self.config.use_transactions {
            self.execute_in_transaction(down_sql).await
        } else {
            self.execute_sql(down_sql).await
        };

        match result {
            Ok(()) => {
                let sql = format!(
                    "UPDATE {MIGRATIONS_TABLE} SET status = 'rolled_back' WHERE version = $1"
                );
                sqlx::query(&sql)
                    .bind(version)
                    .execute(self.pool.inner())
                    .await
                    .map_err(|e| MigrationError::Execution(e.to_string()))?;

                let mut record = MigrationRecord::new(migration);
                record.status = MigrationStatus::RolledBack;
                Ok(record)
            }
            Err(e) => {
                error!(version, error = %e, "Rollback failed");
                Err(e)
            }
        }
    }

    /// Validate shipped migrations against the applied records.
    pub async fn validate(&self) -> Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        let mut versions = HashSet::new();
        for migration in &self.migrations {
            if !versions.insert(migration.version) {
                issues.push(ValidationIssue::DuplicateVersion(migration.version));
            }
            if self.config.verify_checksums && !migration.verify_checksum() {
                issues.push(ValidationIssue::InvalidChecksum(migration.version));
            }
        }

        if let Ok(applied) = self.get_applied().await {
            for migration in &self.migrations {
                if let Some(record) = applied.iter().find(|r| r.version == migration.version) {
                    if self.config.verify_checksums && record.checksum != migration.checksum {
                        issues.push(ValidationIssue::ChecksumMismatch {
                            version: migration.version,
                            expected: migration.checksum.clone(),
                            actual: record.checksum.clone(),
                        });
                    }
                }
            }
        }

        Ok(issues)
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(self.pool.inner())
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;
        Ok(())
    }

    async fn execute_in_transaction(&self, sql: &str) -> Result<()> {
        let mut tx = self
            .pool
            .inner()
            .begin()
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;

        // Raw execute keeps multi-statement DDL intact.
        tx.execute(sql)
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;

        Ok(())
    }

    async fn save_record(&self, record: &MigrationRecord) -> Result<()> {
        let sql = format!(
            r"
            INSERT INTO {MIGRATIONS_TABLE} (version, name, checksum, applied_at, execution_time_ms, status, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (version) DO UPDATE SET
                status = EXCLUDED.status,
                execution_time_ms = EXCLUDED.execution_time_ms,
                error = EXCLUDED.error
            "
        );

        sqlx::query(&sql)
            .bind(record.version)
            .bind(&record.name)
            .bind(&record.checksum)
            .bind(record.applied_at)
            .bind(record.execution_time_ms)
            .bind(record.status.to_string())
            .bind(&record.error)
            .execute(self.pool.inner())
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;

        Ok(())
    }
}

/// Validation issue.
#[derive(Debug, Clone)]
pub enum ValidationIssue {
    /// Duplicate migration version.
    DuplicateVersion(i64),
    /// Shipped SQL does not match its own checksum.
    InvalidChecksum(i64),
    /// Checksum mismatch with an applied migration.
    ChecksumMismatch {
        /// Migration version.
        version: i64,
        /// Expected checksum.
        expected: String,
        /// Actual checksum.
        actual: String,
    },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateVersion(v) => write!(f, "Duplicate version: {v}"),
            Self::InvalidChecksum(v) => write!(f, "Invalid checksum for version: {v}"),
            Self::ChecksumMismatch {
                version,
                expected,
                actual,
            } => write!(
                f,
                "Checksum mismatch for version {version}: expected {expected}, got {actual}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_issue_display() {
        let issue = ValidationIssue::DuplicateVersion(1);
        assert!(issue.to_string().contains("Duplicate"));

        let issue = ValidationIssue::ChecksumMismatch {
            version: 1,
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert!(issue.to_string().contains("mismatch"));
    }
}
