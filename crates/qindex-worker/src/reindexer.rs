//! Partitioned reindex driver.
//!
//! Scans a base table in ascending-id chunks, batch-upserts each chunk,
//! applies coverage deltas, then sweeps orphaned index rows and refreshes
//! every touched coverage bucket authoritatively. The job ledger row is
//! finalized on every exit path.

use crate::error::{Result, WorkerError};
use chrono::{DateTime, Utc};
use qindex_core::{
    entity::partition_predicate, events, EntityRegistry, EntityType, EventBus, PartitionSpec,
    Scope, VectorService,
};
use qindex_coverage::{
    CoverageAccountant, CoverageAdjustment, CountsUpdate, JobLedger, JobScope, JobStatus,
};
use qindex_indexer::{BatchOptions, BatchUpserter, ScopeOverrides};
use qindex_migrations::{ColumnCache, IndexPool, ScopeColumns};
use qindex_telemetry::{DiagEntry, DiagStore};
use serde_json::json;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Progress callback: `(processed, total)` after each chunk.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Reindex parameters.
pub struct ReindexOptions {
    /// Restrict to one tenant; `None` reindexes every tenant.
    pub tenant_id: Option<String>,
    /// Restrict to one organization; `None` covers all.
    pub organization_id: Option<String>,
    /// Bypass the active-job preflight and allow physical resets.
    pub force: bool,
    /// Rows per scan chunk.
    pub batch_size: u32,
    /// Partition assignment, if partitioned.
    pub partition: Option<PartitionSpec>,
    /// Zero coverage snapshots before the pass.
    pub reset_coverage: bool,
    /// Emit `query_index.vectorize_one` per row.
    pub vectorize: bool,
    /// Progress callback.
    pub on_progress: Option<ProgressFn>,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            tenant_id: None,
            organization_id: None,
            force: false,
            batch_size: 500,
            partition: None,
            reset_coverage: false,
            vectorize: false,
            on_progress: None,
        }
    }
}

impl std::fmt::Debug for ReindexOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReindexOptions")
            .field("tenant_id", &self.tenant_id)
            .field("organization_id", &self.organization_id)
            .field("force", &self.force)
            .field("batch_size", &self.batch_size)
            .field("partition", &self.partition)
            .field("reset_coverage", &self.reset_coverage)
            .field("vectorize", &self.vectorize)
            .finish()
    }
}

/// Result of a reindex pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexOutcome {
    /// Rows written to the index.
    pub processed: u64,
    /// Rows the pass expected to cover.
    pub total: u64,
    /// The pass was skipped because another job holds the scope.
    pub skipped: bool,
    /// The pass stopped early on cancellation.
    pub cancelled: bool,
}

/// One coverage bucket touched by a pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Bucket {
    tenant_id: String,
    organization_id: Option<String>,
}

impl Bucket {
    fn scope(&self) -> Scope {
        Scope::new(self.tenant_id.clone(), self.organization_id.clone())
    }
}

/// Drives reindex passes.
pub struct Reindexer {
    pool: IndexPool,
    registry: Arc<dyn EntityRegistry>,
    columns: ColumnCache,
    batch: Arc<BatchUpserter>,
    accountant: Arc<CoverageAccountant>,
    ledger: Arc<JobLedger>,
    diag: DiagStore,
    bus: Option<Arc<dyn EventBus>>,
    cancel: watch::Receiver<bool>,
}

impl Reindexer {
    /// Create a reindexer over the shared pool.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        pool: IndexPool,
        registry: Arc<dyn EntityRegistry>,
        columns: ColumnCache,
        batch: Arc<BatchUpserter>,
        accountant: Arc<CoverageAccountant>,
        ledger: Arc<JobLedger>,
        diag: DiagStore,
        bus: Option<Arc<dyn EventBus>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            registry,
            columns,
            batch,
            accountant,
            ledger,
            diag,
            bus,
            cancel,
        }
    }

    /// Run one reindex pass. The job ledger row is finalized even when
    /// the pass fails; failures are recorded to the diagnostic logs
    /// before propagating.
    pub async fn reindex(
        &self,
        entity_type: &EntityType,
        options: &ReindexOptions,
        vector: Option<&dyn VectorService>,
    ) -> Result<ReindexOutcome> {
        let table = self
            .registry
            .table_name(entity_type)
            .ok_or_else(|| WorkerError::UnknownEntity(entity_type.to_string()))?;
        let cols = self.columns.scope_columns(&self.pool, &table).await?;

        if !options.force
            && self
                .ledger
                .any_active_for_scope(
                    entity_type,
                    options.organization_id.as_deref(),
                    options.tenant_id.as_deref(),
                )
                .await?
        {
            info!(entity_type = %entity_type, "Active job on scope, skipping reindex");
            return Ok(ReindexOutcome {
                skipped: true,
                ..Default::default()
            });
        }

        let buckets = self.bucket_counts(&table, cols, options).await?;
        // The ledger row tracks only this task's share of the scope.
        let total = self.count_partition_rows(&table, cols, options).await?;

        let mut job_scope = JobScope::new(
            entity_type.clone(),
            options.organization_id.clone(),
            options.tenant_id.clone(),
        );
        if let Some(partition) = options.partition {
            job_scope = job_scope.with_partition(partition);
        }

        self.ledger
            .prepare(&job_scope, JobStatus::Reindexing, total as i64)
            .await?;
        let started_at = Utc::now();

        let result = self
            .run_pass(
                entity_type, &table, cols, options, &buckets, &job_scope, total, started_at,
                vector,
            )
            .await;

        // Ledger cleanup runs on every exit path.
        if let Err(e) = self.ledger.finalize(&job_scope).await {
            warn!(entity_type = %entity_type, error = %e, "Failed to finalize job");
        }

        match result {
            Ok(outcome) => {
                self.diag
                    .record_status(
                        DiagEntry::new("reindexer", events::REINDEX, "reindex pass completed")
                            .with_detail(json!({
                                "entityType": entity_type.as_str(),
                                "processed": outcome.processed,
                                "total": outcome.total,
                                "cancelled": outcome.cancelled,
                            })),
                    )
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                self.diag
                    .record_error(
                        DiagEntry::new("reindexer", events::REINDEX, e.to_string()).with_detail(
                            json!({"entityType": entity_type.as_str(), "total": total}),
                        ),
                    )
                    .await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pass(
        &self,
        entity_type: &EntityType,
        table: &str,
        cols: ScopeColumns,
        options: &ReindexOptions,
        buckets: &HashMap<Bucket, i64>,
        job_scope: &JobScope,
        total: u64,
        started_at: DateTime<Utc>,
        vector: Option<&dyn VectorService>,
    ) -> Result<ReindexOutcome> {
        if options.reset_coverage {
            self.reset_coverage(entity_type, options, buckets).await?;
        }

        let overrides = build_overrides(options);
        let mut processed: u64 = 0;
        let mut cancelled = false;
        let mut last_id = String::new();

        loop {
            if *self.cancel.borrow() {
                info!(entity_type = %entity_type, processed, "Reindex cancelled");
                cancelled = true;
                break;
            }

            let chunk = self
                .scan_chunk(table, cols, options, &last_id)
                .await?;
            if chunk.is_empty() {
                break;
            }
            let chunk_len = chunk.len() as u64;

            let record_ids: Vec<String> = chunk
                .iter()
                .filter_map(|row| match row.get("id") {
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                })
                .collect();

            // The chunk arrives ordered by id; the last one is the cursor.
            match record_ids.last() {
                Some(id) => last_id = id.clone(),
                None => break,
            }

            let counts = self
                .batch
                .upsert_many(
                    entity_type,
                    chunk,
                    overrides.as_ref(),
                    &BatchOptions::default(),
                )
                .await?;

            let adjustments: Vec<CoverageAdjustment> = counts
                .iter()
                .map(|(scope, count)| CoverageAdjustment {
                    entity_type: entity_type.clone(),
                    scope: scope.clone(),
                    delta_base: 0,
                    delta_index: *count as i64,
                    delta_vector: 0,
                })
                .collect();
            if let Err(e) = self.accountant.apply_adjustments(adjustments).await {
                warn!(entity_type = %entity_type, error = %e, "Coverage delta failed");
            }

            if options.vectorize {
                self.emit_vectorize(entity_type, &record_ids, options).await;
            }

            processed += chunk_len;
            self.ledger
                .update_progress(job_scope, chunk_len as i64)
                .await?;
            if let Some(on_progress) = &options.on_progress {
                on_progress(processed, total);
            }

            debug!(entity_type = %entity_type, processed, total, "Reindex chunk done");

            // Keep the scan cooperative between chunks.
            tokio::task::yield_now().await;
        }

        if !cancelled {
            self.sweep_orphans(entity_type, table, options, started_at)
                .await?;

            if let Some(service) = vector {
                for bucket in buckets.keys() {
                    if let Err(e) = service
                        .remove_orphans(entity_type, &bucket.scope(), started_at)
                        .await
                    {
                        warn!(entity_type = %entity_type, error = %e, "Vector orphan sweep failed");
                    }
                }
            }

            for bucket in buckets.keys() {
                if let Err(e) = self
                    .accountant
                    .refresh_snapshot(entity_type, &bucket.scope(), vector)
                    .await
                {
                    warn!(entity_type = %entity_type, error = %e, "Coverage refresh failed");
                }
            }
        }

        Ok(ReindexOutcome {
            processed,
            total,
            skipped: false,
            cancelled,
        })
    }

    /// Per-bucket base counts. With a pinned tenant/org the pass has one
    /// bucket; otherwise counts are grouped per scope value so one pass
    /// populates every coverage scope it touches.
    async fn bucket_counts(
        &self,
        table: &str,
        cols: ScopeColumns,
        options: &ReindexOptions,
    ) -> Result<HashMap<Bucket, i64>> {
        let mut select: Vec<String> = Vec::new();
        let mut group: Vec<String> = Vec::new();
        if cols.has_tenant && options.tenant_id.is_none() {
            select.push("t.tenant_id::text AS tenant_id".to_string());
            group.push("t.tenant_id".to_string());
        }
        if cols.has_organization && options.organization_id.is_none() {
            select.push("t.organization_id::text AS organization_id".to_string());
            group.push("t.organization_id".to_string());
        }
        select.push("COUNT(*) AS n".to_string());

        let (predicate, binds) = scope_predicate(cols, options, 0);
        let mut sql = format!(
            "SELECT {} FROM {table} t WHERE TRUE{predicate}",
            select.join(", ")
        );
        if !group.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group.join(", ")));
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(self.pool.inner()).await?;

        let mut buckets = HashMap::new();
        for row in rows {
            let tenant_id = if cols.has_tenant && options.tenant_id.is_none() {
                row.get::<Option<String>, _>("tenant_id").unwrap_or_default()
            } else {
                options.tenant_id.clone().unwrap_or_default()
            };
            let organization_id = if cols.has_organization && options.organization_id.is_none() {
                row.get::<Option<String>, _>("organization_id")
            } else {
                options.organization_id.clone()
            };
            let count: i64 = row.get("n");
            buckets.insert(
                Bucket {
                    tenant_id,
                    organization_id,
                },
                count,
            );
        }

        if buckets.is_empty() {
            buckets.insert(
                Bucket {
                    tenant_id: options.tenant_id.clone().unwrap_or_default(),
                    organization_id: options.organization_id.clone(),
                },
                0,
            );
        }

        Ok(buckets)
    }

    /// Rows this task will actually scan: the scope restricted to its
    /// partition, if any.
    async fn count_partition_rows(
        &self,
        table: &str,
        cols: ScopeColumns,
        options: &ReindexOptions,
    ) -> Result<u64> {
        let (predicate, binds) = scope_predicate(cols, options, 0);
        let mut sql = format!("SELECT COUNT(*) AS n FROM {table} t WHERE TRUE{predicate}");
        if let Some(partition) = options.partition {
            if partition.is_partitioned() {
                sql.push_str(&format!(" AND {}", partition_predicate("t.id", partition)));
            }
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let row = query.fetch_one(self.pool.inner()).await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }

    async fn scan_chunk(
        &self,
        table: &str,
        cols: ScopeColumns,
        options: &ReindexOptions,
        last_id: &str,
    ) -> Result<Vec<qindex_core::doc::Doc>> {
        let (predicate, mut binds) = scope_predicate(cols, options, 1);
        let mut sql = format!(
            "SELECT row_to_json(t.*)::jsonb AS doc FROM {table} t
             WHERE t.id::text > $1{predicate}"
        );
        if let Some(partition) = options.partition {
            if partition.is_partitioned() {
                sql.push_str(&format!(" AND {}", partition_predicate("t.id", partition)));
            }
        }
        sql.push_str(&format!(
            " ORDER BY t.id::text ASC LIMIT {}",
            options.batch_size.max(1)
        ));

        let mut query = sqlx::query(&sql).bind(last_id);
        for bind in binds.drain(..) {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(self.pool.inner()).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                qindex_core::doc::doc_from_value(row.get::<serde_json::Value, _>("doc"))
            })
            .collect())
    }

    /// Zero the coverage snapshots of every bucket, throttled per scope.
    /// With `force`, also physically clear the scope's index rows and ask
    /// the vector service to purge.
    async fn reset_coverage(
        &self,
        entity_type: &EntityType,
        options: &ReindexOptions,
        buckets: &HashMap<Bucket, i64>,
    ) -> Result<()> {
        // Physical clearing and zeroed snapshots run once per pass, not
        // once per partition.
        let first_partition = options.partition.map_or(true, |p| p.index == 0);
        if !first_partition {
            return Ok(());
        }

        if options.force {
            let mut sql = String::from("DELETE FROM entity_indexes WHERE entity_type = $1");
            let mut binds: Vec<String> = vec![entity_type.as_str().to_string()];
            if let Some(tenant) = &options.tenant_id {
                binds.push(tenant.clone());
                sql.push_str(&format!(" AND tenant_id = ${}", binds.len()));
            }
            if let Some(org) = &options.organization_id {
                binds.push(org.clone());
                sql.push_str(&format!(" AND organization_id = ${}", binds.len()));
            }
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }
            let cleared = query.execute(self.pool.inner()).await?;
            info!(
                entity_type = %entity_type,
                rows = cleared.rows_affected(),
                "Cleared index rows for forced reindex"
            );

            if options.vectorize {
                if let Some(bus) = &self.bus {
                    let payload = json!({
                        "entityType": entity_type.as_str(),
                        "tenantId": options.tenant_id,
                        "organizationId": options.organization_id,
                    });
                    if let Err(e) = bus.emit(events::VECTORIZE_PURGE, payload, false).await {
                        warn!(entity_type = %entity_type, error = %e, "Vector purge emit failed");
                    }
                }
            }
        }

        for bucket in buckets.keys() {
            let scope = bucket.scope();
            if !self.accountant.should_reset(entity_type, &scope, options.force) {
                continue;
            }
            self.accountant
                .write_counts(
                    entity_type,
                    &scope,
                    CountsUpdate {
                        base_count: None,
                        indexed_count: Some(0),
                        vector_count: options.force.then_some(0),
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// Delete index rows in the scope+partition whose base row is gone or
    /// which this pass never touched.
    async fn sweep_orphans(
        &self,
        entity_type: &EntityType,
        table: &str,
        options: &ReindexOptions,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut sql = format!(
            "DELETE FROM entity_indexes ei
             WHERE ei.entity_type = $1
               AND (NOT EXISTS (SELECT 1 FROM {table} b WHERE b.id::text = ei.record_id)
                    OR ei.updated_at < $2)"
        );
        let mut binds: Vec<String> = Vec::new();
        if let Some(tenant) = &options.tenant_id {
            binds.push(tenant.clone());
            sql.push_str(&format!(" AND ei.tenant_id = ${}", binds.len() + 2));
        }
        if let Some(org) = &options.organization_id {
            binds.push(org.clone());
            sql.push_str(&format!(" AND ei.organization_id = ${}", binds.len() + 2));
        }
        if let Some(partition) = options.partition {
            if partition.is_partitioned() {
                sql.push_str(&format!(
                    " AND {}",
                    partition_predicate("ei.record_id", partition)
                ));
            }
        }

        let mut query = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(started_at);
        for bind in &binds {
            query = query.bind(bind);
        }
        let swept = query.execute(self.pool.inner()).await?;

        if swept.rows_affected() > 0 {
            info!(
                entity_type = %entity_type,
                rows = swept.rows_affected(),
                "Swept orphaned index rows"
            );
        }
        Ok(())
    }

    async fn emit_vectorize(
        &self,
        entity_type: &EntityType,
        record_ids: &[String],
        options: &ReindexOptions,
    ) {
        let Some(bus) = &self.bus else { return };
        for record_id in record_ids {
            let payload = json!({
                "entityType": entity_type.as_str(),
                "recordId": record_id,
                "tenantId": options.tenant_id,
                "organizationId": options.organization_id,
            });
            if let Err(e) = bus.emit(events::VECTORIZE_ONE, payload, false).await {
                debug!(entity_type = %entity_type, error = %e, "Vectorize emit failed");
            }
        }
    }
}

fn build_overrides(options: &ReindexOptions) -> Option<ScopeOverrides> {
    if options.tenant_id.is_none() && options.organization_id.is_none() {
        return None;
    }
    Some(ScopeOverrides {
        tenant_id: options.tenant_id.clone(),
        organization_id: options.organization_id.clone(),
    })
}

/// Scope predicate over the base table with placeholders starting after
/// `offset` existing binds. Returns the SQL fragment and its bind values.
fn scope_predicate(
    cols: ScopeColumns,
    options: &ReindexOptions,
    offset: usize,
) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut binds: Vec<String> = Vec::new();
    if cols.has_tenant {
        if let Some(tenant) = &options.tenant_id {
            binds.push(tenant.clone());
            sql.push_str(&format!(" AND t.tenant_id::text = ${}", offset + binds.len()));
        }
    }
    if cols.has_organization {
        if let Some(org) = &options.organization_id {
            binds.push(org.clone());
            sql.push_str(&format!(
                " AND t.organization_id::text = ${}",
                offset + binds.len()
            ));
        }
    }
    if cols.has_deleted {
        sql.push_str(" AND t.deleted_at IS NULL");
    }
    (sql, binds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols_all() -> ScopeColumns {
        ScopeColumns {
            has_organization: true,
            has_tenant: true,
            has_deleted: true,
            has_updated: true,
        }
    }

    #[test]
    fn test_scope_predicate_binds_and_placeholders() {
        let options = ReindexOptions {
            tenant_id: Some("t1".to_string()),
            organization_id: Some("o1".to_string()),
            ..Default::default()
        };
        let (sql, binds) = scope_predicate(cols_all(), &options, 1);
        assert!(sql.contains("t.tenant_id::text = $2"));
        assert!(sql.contains("t.organization_id::text = $3"));
        assert!(sql.contains("t.deleted_at IS NULL"));
        assert_eq!(binds, vec!["t1".to_string(), "o1".to_string()]);
    }

    #[test]
    fn test_scope_predicate_degrades_without_columns() {
        let options = ReindexOptions {
            tenant_id: Some("t1".to_string()),
            organization_id: Some("o1".to_string()),
            ..Default::default()
        };
        let (sql, binds) = scope_predicate(ScopeColumns::default(), &options, 0);
        assert!(sql.is_empty());
        assert!(binds.is_empty());
    }

    #[test]
    fn test_build_overrides() {
        assert!(build_overrides(&ReindexOptions::default()).is_none());
        let options = ReindexOptions {
            tenant_id: Some("t1".to_string()),
            ..Default::default()
        };
        let overrides = build_overrides(&options).unwrap();
        assert_eq!(overrides.tenant_id.as_deref(), Some("t1"));
        assert_eq!(overrides.organization_id, None);
    }

    #[test]
    fn test_default_options() {
        let options = ReindexOptions::default();
        assert_eq!(options.batch_size, 500);
        assert!(!options.force);
        assert!(options.partition.is_none());
    }
}
