//! Per-entity status reports.
//!
//! Read-only: joins coverage snapshots with the job ledger. The roll-up
//! is pure so it can be tested without a database.

use crate::accountant::CoverageAccountant;
use crate::error::Result;
use crate::jobs::{JobLedger, JobRecord, JobStatus};
use chrono::{DateTime, Utc};
use qindex_config::QindexConfig;
use qindex_core::{EntityRegistry, EntityType, Scope, VectorService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Aggregate job state across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    /// No active or stalled partition.
    Idle,
    /// At least one running partition is reindexing.
    Reindexing,
    /// At least one running partition is purging.
    Purging,
    /// No running partition, but at least one stalled.
    Stalled,
}

/// Summarized job state for one entity scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    /// Aggregate status across partitions.
    pub status: AggregateStatus,
    /// Summed processed count, clamped to the summed total.
    pub processed_count: i64,
    /// Summed total count.
    pub total_count: i64,
    /// Partitions considered.
    pub partitions: usize,
    /// Partitions with a stale heartbeat.
    pub stalled_partitions: usize,
}

impl JobSummary {
    /// Summary with no job history.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            status: AggregateStatus::Idle,
            processed_count: 0,
            total_count: 0,
            partitions: 0,
            stalled_partitions: 0,
        }
    }
}

/// Status entry for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatus {
    /// Entity type string.
    pub entity_id: String,
    /// Human-readable label.
    pub label: String,
    /// Base-table count from the snapshot, if known.
    pub base_count: Option<i64>,
    /// Indexed count from the snapshot, if known.
    pub index_count: Option<i64>,
    /// Vector count from the snapshot, if known.
    pub vector_count: Option<i64>,
    /// Whether the index fully covers the base population.
    pub ok: bool,
    /// Job roll-up.
    pub job: JobSummary,
}

/// Full report for a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// One entry per registered entity.
    pub items: Vec<EntityStatus>,
    /// Non-fatal errors hit while assembling the report.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl StatusReport {
    /// Whether any entity is out of sync. The transport surfaces this as
    /// the `x-om-partial-index` header.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.items.iter().any(|item| !item.ok)
    }
}

/// Roll up the latest per-partition job rows.
///
/// A partition is completed when `finished_at` is set, stalled when
/// unfinished with a heartbeat older than `heartbeat_stale`, running
/// otherwise. Progress is the sum of processed counts clamped to the sum
/// of totals.
#[must_use]
pub fn roll_up_jobs(
    jobs: &[JobRecord],
    heartbeat_stale: Duration,
    now: DateTime<Utc>,
) -> JobSummary {
    if jobs.is_empty() {
        return JobSummary::idle();
    }

    let mut running_reindex = false;
    let mut running_purge = false;
    let mut stalled = 0_usize;
    let mut processed: i64 = 0;
    let mut total: i64 = 0;

    for job in jobs {
        processed += job.processed_count;
        total += job.total_count;

        if job.is_completed() {
            continue;
        }

        let heartbeat_age = now
            .signed_duration_since(job.heartbeat_at)
            .to_std()
            .unwrap_or_default();
        if heartbeat_age > heartbeat_stale {
            stalled += 1;
        } else {
            match JobStatus::parse(&job.status) {
                Some(JobStatus::Purging) => running_purge = true,
                _ => running_reindex = true,
            }
        }
    }

    let status = if running_purge {
        AggregateStatus::Purging
    } else if running_reindex {
        AggregateStatus::Reindexing
    } else if stalled > 0 {
        AggregateStatus::Stalled
    } else {
        AggregateStatus::Idle
    };

    JobSummary {
        status,
        processed_count: processed.min(total),
        total_count: total,
        partitions: jobs.len(),
        stalled_partitions: stalled,
    }
}

/// Assembles status reports for administrative callers.
pub struct StatusAggregator {
    accountant: Arc<CoverageAccountant>,
    ledger: Arc<JobLedger>,
    registry: Arc<dyn EntityRegistry>,
    config: QindexConfig,
}

impl StatusAggregator {
    /// Create an aggregator.
    #[must_use]
    pub fn new(
        accountant: Arc<CoverageAccountant>,
        ledger: Arc<JobLedger>,
        registry: Arc<dyn EntityRegistry>,
        config: QindexConfig,
    ) -> Self {
        Self {
            accountant,
            ledger,
            registry,
            config,
        }
    }

    /// Build the report for a tenant/organization scope.
    ///
    /// Stale snapshots are refreshed inline when `force_refresh` is set or
    /// the staleness clock has expired; refresh failures degrade to the
    /// stale value and are collected in `errors`.
    pub async fn status_report(
        &self,
        tenant_id: &str,
        organization_id: Option<&str>,
        force_refresh: bool,
        vector: Option<&dyn VectorService>,
    ) -> Result<StatusReport> {
        let scope = Scope::new(tenant_id, organization_id.map(ToString::to_string));
        let now = Utc::now();
        let mut items = Vec::new();
        let mut errors = Vec::new();

        for entity_type in self.registry.entity_types() {
            let item = self
                .entity_status(&entity_type, &scope, force_refresh, vector, now, &mut errors)
                .await;
            items.push(item);
        }

        Ok(StatusReport { items, errors })
    }

    async fn entity_status(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
        force_refresh: bool,
        vector: Option<&dyn VectorService>,
        now: DateTime<Utc>,
        errors: &mut Vec<String>,
    ) -> EntityStatus {
        let mut snapshot = match self.accountant.read_snapshot(entity_type, scope).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                errors.push(format!("{entity_type}: {e}"));
                None
            }
        };

        let needs_refresh = force_refresh
            || snapshot
                .as_ref()
                .map_or(true, |s| s.is_stale(self.config.coverage_stale_after, now));
        if needs_refresh {
            match self
                .accountant
                .refresh_snapshot(entity_type, scope, vector)
                .await
            {
                Ok(fresh) => snapshot = Some(fresh),
                Err(e) => {
                    warn!(entity_type = %entity_type, error = %e, "Status refresh failed");
                    errors.push(format!("{entity_type}: {e}"));
                }
            }
        }

        let jobs = self
            .ledger
            .latest_per_partition(
                entity_type,
                scope.organization_id.as_deref(),
                Some(scope.tenant_id.as_str()),
            )
            .await
            .unwrap_or_else(|e| {
                errors.push(format!("{entity_type}: {e}"));
                Vec::new()
            });

        let job = roll_up_jobs(&jobs, self.config.heartbeat_stale_after, now);

        let (base_count, index_count, vector_count, ok) = match &snapshot {
            Some(s) => (
                Some(s.base_count),
                Some(s.indexed_count),
                Some(s.vector_indexed_count),
                s.is_complete(),
            ),
            None => (None, None, None, false),
        };

        EntityStatus {
            entity_id: entity_type.to_string(),
            label: self.registry.label(entity_type),
            base_count,
            index_count,
            vector_count,
            ok,
            job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(
        partition: Option<(i32, i32)>,
        status: &str,
        finished: bool,
        heartbeat_age_secs: i64,
        processed: i64,
        total: i64,
    ) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            entity_type: "example:todo".to_string(),
            organization_id: None,
            tenant_id: Some("t1".to_string()),
            partition_index: partition.map(|(i, _)| i),
            partition_count: partition.map(|(_, c)| c),
            status: status.to_string(),
            started_at: now - chrono::Duration::seconds(600),
            heartbeat_at: now - chrono::Duration::seconds(heartbeat_age_secs),
            finished_at: finished.then(|| now - chrono::Duration::seconds(1)),
            processed_count: processed,
            total_count: total,
        }
    }

    const STALE: Duration = Duration::from_secs(60);

    #[test]
    fn test_roll_up_empty_is_idle() {
        let summary = roll_up_jobs(&[], STALE, Utc::now());
        assert_eq!(summary.status, AggregateStatus::Idle);
        assert_eq!(summary.partitions, 0);
    }

    #[test]
    fn test_roll_up_all_completed_is_idle() {
        let jobs = vec![
            job(Some((0, 2)), "reindexing", true, 0, 500, 500),
            job(Some((1, 2)), "reindexing", true, 0, 500, 500),
        ];
        let summary = roll_up_jobs(&jobs, STALE, Utc::now());
        assert_eq!(summary.status, AggregateStatus::Idle);
        assert_eq!(summary.processed_count, 1000);
        assert_eq!(summary.total_count, 1000);
    }

    #[test]
    fn test_roll_up_purging_wins_over_reindexing() {
        let jobs = vec![
            job(Some((0, 2)), "reindexing", false, 5, 10, 100),
            job(Some((1, 2)), "purging", false, 5, 10, 100),
        ];
        let summary = roll_up_jobs(&jobs, STALE, Utc::now());
        assert_eq!(summary.status, AggregateStatus::Purging);
    }

    #[test]
    fn test_roll_up_stalled_when_heartbeat_old() {
        let jobs = vec![job(None, "reindexing", false, 120, 10, 100)];
        let summary = roll_up_jobs(&jobs, STALE, Utc::now());
        assert_eq!(summary.status, AggregateStatus::Stalled);
        assert_eq!(summary.stalled_partitions, 1);
    }

    #[test]
    fn test_roll_up_running_beats_stalled() {
        let jobs = vec![
            job(Some((0, 2)), "reindexing", false, 120, 10, 100),
            job(Some((1, 2)), "reindexing", false, 5, 10, 100),
        ];
        let summary = roll_up_jobs(&jobs, STALE, Utc::now());
        assert_eq!(summary.status, AggregateStatus::Reindexing);
        assert_eq!(summary.stalled_partitions, 1);
    }

    #[test]
    fn test_roll_up_progress_clamped_to_total() {
        // Repeated partition runs can oversum processed counts.
        let jobs = vec![
            job(Some((0, 2)), "reindexing", true, 0, 700, 500),
            job(Some((1, 2)), "reindexing", true, 0, 400, 500),
        ];
        let summary = roll_up_jobs(&jobs, STALE, Utc::now());
        assert_eq!(summary.processed_count, 1000);
        assert_eq!(summary.total_count, 1000);
    }

    #[test]
    fn test_report_partial_flag() {
        let report = StatusReport {
            items: vec![EntityStatus {
                entity_id: "example:todo".to_string(),
                label: "Todo".to_string(),
                base_count: Some(10),
                index_count: Some(3),
                vector_count: Some(0),
                ok: false,
                job: JobSummary::idle(),
            }],
            errors: Vec::new(),
        };
        assert!(report.has_partial());
    }
}
