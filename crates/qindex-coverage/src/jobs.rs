//! Reindex/purge job ledger.
//!
//! One active job per scope+partition; null scope parts compare equal
//! (`IS NOT DISTINCT FROM`). Finalized rows are retained so the status
//! aggregator can report history.

use crate::error::Result;
use chrono::{DateTime, Utc};
use qindex_core::{EntityType, PartitionSpec};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::fmt;
use tracing::debug;

use qindex_migrations::IndexPool;

/// What a job is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Rebuilding index rows.
    Reindexing,
    /// Soft-deleting index rows.
    Purging,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reindexing => write!(f, "reindexing"),
            Self::Purging => write!(f, "purging"),
        }
    }
}

impl JobStatus {
    /// Parse a stored status string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reindexing" => Some(Self::Reindexing),
            "purging" => Some(Self::Purging),
            _ => None,
        }
    }
}

/// Scope key of a job. A `None` partition denotes a scope-wide job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScope {
    /// Entity type the job works on.
    pub entity_type: EntityType,
    /// Organization restriction, if any.
    pub organization_id: Option<String>,
    /// Tenant restriction, if any.
    pub tenant_id: Option<String>,
    /// Partition assignment, if partitioned.
    pub partition: Option<PartitionSpec>,
}

impl JobScope {
    /// Scope-wide (unpartitioned) job scope.
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        organization_id: Option<String>,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            entity_type,
            organization_id,
            tenant_id,
            partition: None,
        }
    }

    /// Restrict to one partition.
    #[must_use]
    pub fn with_partition(mut self, partition: PartitionSpec) -> Self {
        self.partition = Some(partition);
        self
    }

    fn partition_index(&self) -> Option<i32> {
        self.partition.map(|p| p.index as i32)
    }

    fn partition_count(&self) -> Option<i32> {
        self.partition.map(|p| p.count as i32)
    }
}

/// One ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Entity type the job works on.
    pub entity_type: String,
    /// Organization restriction, if any.
    pub organization_id: Option<String>,
    /// Tenant restriction, if any.
    pub tenant_id: Option<String>,
    /// Partition index, if partitioned.
    pub partition_index: Option<i32>,
    /// Partition count, if partitioned.
    pub partition_count: Option<i32>,
    /// Declared status.
    pub status: String,
    /// When the job started.
    pub started_at: DateTime<Utc>,
    /// Liveness clock.
    pub heartbeat_at: DateTime<Utc>,
    /// Completion time; `None` while active.
    pub finished_at: Option<DateTime<Utc>>,
    /// Rows processed so far.
    pub processed_count: i64,
    /// Rows expected in total.
    pub total_count: i64,
}

impl JobRecord {
    /// Whether the job has finished.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.finished_at.is_some()
    }
}

const SCOPE_PREDICATE: &str = "entity_type = $1
               AND organization_id IS NOT DISTINCT FROM $2
               AND tenant_id IS NOT DISTINCT FROM $3
               AND partition_index IS NOT DISTINCT FROM $4
               AND partition_count IS NOT DISTINCT FROM $5";

/// Maintains `entity_index_jobs`.
pub struct JobLedger {
    pool: IndexPool,
}

impl JobLedger {
    /// Create a ledger over the shared pool.
    #[must_use]
    pub fn new(pool: IndexPool) -> Self {
        Self { pool }
    }

    /// Upsert the single active row for a scope and reset its counters.
    pub async fn prepare(&self, scope: &JobScope, status: JobStatus, total_count: i64) -> Result<()> {
        let sql = format!(
            "UPDATE entity_index_jobs
             SET status = $6, started_at = NOW(), heartbeat_at = NOW(),
                 processed_count = 0, total_count = $7, finished_at = NULL
             WHERE {SCOPE_PREDICATE} AND finished_at IS NULL"
        );
        let updated = sqlx::query(&sql)
            .bind(scope.entity_type.as_str())
            .bind(scope.organization_id.as_deref())
            .bind(scope.tenant_id.as_deref())
            .bind(scope.partition_index())
            .bind(scope.partition_count())
            .bind(status.to_string())
            .bind(total_count)
            .execute(self.pool.inner())
            .await?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let inserted = sqlx::query(
            "INSERT INTO entity_index_jobs
                 (entity_type, organization_id, tenant_id, partition_index, partition_count,
                  status, started_at, heartbeat_at, processed_count, total_count)
             VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW(), 0, $7)",
        )
        .bind(scope.entity_type.as_str())
        .bind(scope.organization_id.as_deref())
        .bind(scope.tenant_id.as_deref())
        .bind(scope.partition_index())
        .bind(scope.partition_count())
        .bind(status.to_string())
        .bind(total_count)
        .execute(self.pool.inner())
        .await;

        match inserted {
            Ok(_) => Ok(()),
            // A concurrent prepare won the partial-unique race; converge
            // onto its row.
            Err(e) if is_unique_violation(&e) => {
                let sql = format!(
                    "UPDATE entity_index_jobs
                     SET status = $6, heartbeat_at = NOW(), total_count = $7
                     WHERE {SCOPE_PREDICATE} AND finished_at IS NULL"
                );
                sqlx::query(&sql)
                    .bind(scope.entity_type.as_str())
                    .bind(scope.organization_id.as_deref())
                    .bind(scope.tenant_id.as_deref())
                    .bind(scope.partition_index())
                    .bind(scope.partition_count())
                    .bind(status.to_string())
                    .bind(total_count)
                    .execute(self.pool.inner())
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Advance the active job's progress and refresh its heartbeat.
    /// Negative deltas are clamped to zero.
    pub async fn update_progress(&self, scope: &JobScope, delta: i64) -> Result<()> {
        let sql = format!(
            "UPDATE entity_index_jobs
             SET processed_count = processed_count + GREATEST($6, 0), heartbeat_at = NOW()
             WHERE {SCOPE_PREDICATE} AND finished_at IS NULL"
        );
        sqlx::query(&sql)
            .bind(scope.entity_type.as_str())
            .bind(scope.organization_id.as_deref())
            .bind(scope.tenant_id.as_deref())
            .bind(scope.partition_index())
            .bind(scope.partition_count())
            .bind(delta)
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }

    /// Close the active job for a scope.
    pub async fn finalize(&self, scope: &JobScope) -> Result<()> {
        let sql = format!(
            "UPDATE entity_index_jobs
             SET finished_at = NOW(), heartbeat_at = NOW()
             WHERE {SCOPE_PREDICATE} AND finished_at IS NULL"
        );
        sqlx::query(&sql)
            .bind(scope.entity_type.as_str())
            .bind(scope.organization_id.as_deref())
            .bind(scope.tenant_id.as_deref())
            .bind(scope.partition_index())
            .bind(scope.partition_count())
            .execute(self.pool.inner())
            .await?;

        debug!(entity_type = %scope.entity_type, "Job finalized");
        Ok(())
    }

    /// The active job for a scope, if any.
    pub async fn active_job(&self, scope: &JobScope) -> Result<Option<JobRecord>> {
        let sql = format!(
            "SELECT entity_type, organization_id, tenant_id, partition_index, partition_count,
                    status, started_at, heartbeat_at, finished_at, processed_count, total_count
             FROM entity_index_jobs
             WHERE {SCOPE_PREDICATE} AND finished_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(scope.entity_type.as_str())
            .bind(scope.organization_id.as_deref())
            .bind(scope.tenant_id.as_deref())
            .bind(scope.partition_index())
            .bind(scope.partition_count())
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(row.map(|r| job_record(&r)))
    }

    /// Whether any job is active for the entity/tenant/org scope across
    /// all partitions. Used by the reindexer's preflight.
    pub async fn any_active_for_scope(
        &self,
        entity_type: &EntityType,
        organization_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM entity_index_jobs
             WHERE entity_type = $1
               AND organization_id IS NOT DISTINCT FROM $2
               AND tenant_id IS NOT DISTINCT FROM $3
               AND finished_at IS NULL
             LIMIT 1",
        )
        .bind(entity_type.as_str())
        .bind(organization_id)
        .bind(tenant_id)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(row.is_some())
    }

    /// Latest job row per partition for an entity/tenant/org scope.
    pub async fn latest_per_partition(
        &self,
        entity_type: &EntityType,
        organization_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (partition_index, partition_count)
                    entity_type, organization_id, tenant_id, partition_index, partition_count,
                    status, started_at, heartbeat_at, finished_at, processed_count, total_count
             FROM entity_index_jobs
             WHERE entity_type = $1
               AND organization_id IS NOT DISTINCT FROM $2
               AND tenant_id IS NOT DISTINCT FROM $3
             ORDER BY partition_index, partition_count, started_at DESC",
        )
        .bind(entity_type.as_str())
        .bind(organization_id)
        .bind(tenant_id)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows.iter().map(job_record).collect())
    }
}

fn job_record(row: &PgRow) -> JobRecord {
    JobRecord {
        entity_type: row.get("entity_type"),
        organization_id: row.get("organization_id"),
        tenant_id: row.get("tenant_id"),
        partition_index: row.get("partition_index"),
        partition_count: row.get("partition_count"),
        status: row.get("status"),
        started_at: row.get("started_at"),
        heartbeat_at: row.get("heartbeat_at"),
        finished_at: row.get("finished_at"),
        processed_count: row.get("processed_count"),
        total_count: row.get("total_count"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        assert_eq!(JobStatus::parse("reindexing"), Some(JobStatus::Reindexing));
        assert_eq!(JobStatus::parse("purging"), Some(JobStatus::Purging));
        assert_eq!(JobStatus::parse("unknown"), None);
        assert_eq!(JobStatus::Reindexing.to_string(), "reindexing");
    }

    #[test]
    fn test_job_scope_partition_columns() {
        let et = EntityType::new("example:todo").unwrap();
        let scope = JobScope::new(et.clone(), None, Some("t1".to_string()));
        assert_eq!(scope.partition_index(), None);

        let scope = scope.with_partition(PartitionSpec::new(5, 2).unwrap());
        assert_eq!(scope.partition_index(), Some(2));
        assert_eq!(scope.partition_count(), Some(5));
    }

    #[test]
    fn test_job_record_completion() {
        let record = JobRecord {
            entity_type: "example:todo".to_string(),
            organization_id: None,
            tenant_id: Some("t1".to_string()),
            partition_index: None,
            partition_count: None,
            status: "reindexing".to_string(),
            started_at: Utc::now(),
            heartbeat_at: Utc::now(),
            finished_at: None,
            processed_count: 5,
            total_count: 10,
        };
        assert!(!record.is_completed());
    }
}
