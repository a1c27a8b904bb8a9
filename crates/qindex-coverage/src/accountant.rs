//! Coverage snapshots and delta accounting.
//!
//! A coverage row is the planner's source of truth for the hybrid/fallback
//! decision. It is refreshed authoritatively (counting base and index
//! tables) and adjusted incrementally from event-path transition flags.
//! Adjustments run under row-level locking so `max(0, current + delta)`
//! is atomic; this is the only read-modify-write path in the subsystem.

use crate::error::{CoverageError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qindex_config::QindexConfig;
use qindex_core::{EntityRegistry, EntityType, Scope, VectorService};
use qindex_migrations::{ColumnCache, IndexPool};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One coverage snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageRow {
    /// Entity type the counts describe.
    pub entity_type: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Organization storage key (sentinel UUID for the global scope).
    pub organization_id: Option<String>,
    /// Whether soft-deleted rows are counted.
    pub with_deleted: bool,
    /// Rows in the base table under the scope.
    pub base_count: i64,
    /// Active rows in `entity_indexes` under the scope.
    pub indexed_count: i64,
    /// Rows known to the vector backend under the scope.
    pub vector_indexed_count: i64,
    /// Authoritative staleness clock.
    pub refreshed_at: DateTime<Utc>,
}

impl CoverageRow {
    /// Whether the snapshot is older than `max_age`.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.refreshed_at)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }

    /// Whether the index fully covers the base population.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.base_count == 0 || self.indexed_count >= self.base_count
    }
}

/// One incremental adjustment derived from the event path.
#[derive(Debug, Clone)]
pub struct CoverageAdjustment {
    /// Entity type to adjust.
    pub entity_type: EntityType,
    /// Scope to adjust.
    pub scope: Scope,
    /// Base-count delta.
    pub delta_base: i64,
    /// Indexed-count delta.
    pub delta_index: i64,
    /// Vector-count delta.
    pub delta_vector: i64,
}

/// Absolute count overwrite; unspecified fields keep their stored value.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountsUpdate {
    /// New base count, if any.
    pub base_count: Option<i64>,
    /// New indexed count, if any.
    pub indexed_count: Option<i64>,
    /// New vector count, if any.
    pub vector_count: Option<i64>,
}

/// Maintains `entity_index_coverage`.
pub struct CoverageAccountant {
    pool: IndexPool,
    registry: Arc<dyn EntityRegistry>,
    columns: ColumnCache,
    config: QindexConfig,
    last_reset: Mutex<HashMap<String, Instant>>,
}

impl CoverageAccountant {
    /// Create an accountant over the shared pool.
    #[must_use]
    pub fn new(
        pool: IndexPool,
        registry: Arc<dyn EntityRegistry>,
        columns: ColumnCache,
        config: QindexConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            columns,
            config,
            last_reset: Mutex::new(HashMap::new()),
        }
    }

    /// Read the snapshot for a scope, if one exists.
    pub async fn read_snapshot(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
    ) -> Result<Option<CoverageRow>> {
        let row = sqlx::query(
            "SELECT entity_type, tenant_id, organization_id, with_deleted,
                    base_count, indexed_count, vector_indexed_count, refreshed_at
             FROM entity_index_coverage
             WHERE entity_type = $1 AND tenant_id = $2
               AND organization_id = $3 AND with_deleted = $4",
        )
        .bind(entity_type.as_str())
        .bind(&scope.tenant_id)
        .bind(scope.storage_org())
        .bind(scope.with_deleted)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(|r| coverage_row(&r)))
    }

    /// Authoritatively recount a scope and write the snapshot.
    ///
    /// Counting clauses degrade when the base table lacks the scoping
    /// columns. The vector count is taken from the vector service when a
    /// tenant is present; a vector failure keeps the previous value.
    pub async fn refresh_snapshot(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
        vector: Option<&dyn VectorService>,
    ) -> Result<CoverageRow> {
        let table = self
            .registry
            .table_name(entity_type)
            .ok_or_else(|| CoverageError::UnknownEntity(entity_type.to_string()))?;

        let base_count = self.count_base(&table, scope).await?;
        let indexed_count = self.count_indexed(entity_type, scope).await?;

        let previous = self.read_snapshot(entity_type, scope).await?;
        let vector_count = match vector {
            Some(service) if !scope.tenant_id.is_empty() => {
                match service.indexed_count(entity_type, scope).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(
                            entity_type = %entity_type,
                            error = %e,
                            "Vector count failed, keeping previous value"
                        );
                        previous.as_ref().map_or(0, |p| p.vector_indexed_count)
                    }
                }
            }
            _ => previous.as_ref().map_or(0, |p| p.vector_indexed_count),
        };

        self.write_snapshot(entity_type, scope, base_count, indexed_count, vector_count)
            .await
    }

    async fn count_base(&self, table: &str, scope: &Scope) -> Result<i64> {
        if !self.columns.table_exists(&self.pool, table).await? {
            return Ok(0);
        }
        let cols = self.columns.scope_columns(&self.pool, table).await?;

        let mut sql = format!("SELECT COUNT(*) AS n FROM {table} t WHERE TRUE");
        let mut binds: Vec<String> = Vec::new();
        if cols.has_tenant {
            binds.push(scope.tenant_id.clone());
            sql.push_str(&format!(" AND t.tenant_id::text = ${}", binds.len()));
        }
        if cols.has_organization {
            match &scope.organization_id {
                Some(org) => {
                    binds.push(org.clone());
                    sql.push_str(&format!(" AND t.organization_id::text = ${}", binds.len()));
                }
                None => sql.push_str(" AND t.organization_id IS NULL"),
            }
        }
        if cols.has_deleted && !scope.with_deleted {
            sql.push_str(" AND t.deleted_at IS NULL");
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let row = query.fetch_one(self.pool.inner()).await?;
        Ok(row.get::<i64, _>("n"))
    }

    async fn count_indexed(&self, entity_type: &EntityType, scope: &Scope) -> Result<i64> {
        let mut sql = String::from(
            "SELECT COUNT(*) AS n FROM entity_indexes
             WHERE entity_type = $1 AND tenant_id IS NOT DISTINCT FROM $2
               AND organization_id IS NOT DISTINCT FROM $3",
        );
        if !scope.with_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }

        let row = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(&scope.tenant_id)
            .bind(scope.organization_id.as_deref())
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Apply incremental deltas. Adjustments for the same scope are
    /// aggregated first; zero-sum aggregates are dropped; the stored value
    /// never goes below zero.
    pub async fn apply_adjustments(&self, adjustments: Vec<CoverageAdjustment>) -> Result<()> {
        let aggregated = aggregate_adjustments(adjustments);
        if aggregated.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.inner().begin().await?;
        for adj in aggregated {
            let existing = sqlx::query(
                "SELECT id, base_count, indexed_count, vector_indexed_count
                 FROM entity_index_coverage
                 WHERE entity_type = $1 AND tenant_id = $2
                   AND organization_id = $3 AND with_deleted = $4
                 FOR UPDATE",
            )
            .bind(adj.entity_type.as_str())
            .bind(&adj.scope.tenant_id)
            .bind(adj.scope.storage_org())
            .bind(adj.scope.with_deleted)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(row) => {
                    let base = (row.get::<i64, _>("base_count") + adj.delta_base).max(0);
                    let indexed = (row.get::<i64, _>("indexed_count") + adj.delta_index).max(0);
                    let vector =
                        (row.get::<i64, _>("vector_indexed_count") + adj.delta_vector).max(0);
                    sqlx::query(
                        "UPDATE entity_index_coverage
                         SET base_count = $2, indexed_count = $3, vector_indexed_count = $4
                         WHERE id = $1",
                    )
                    .bind(row.get::<sqlx::types::Uuid, _>("id"))
                    .bind(base)
                    .bind(indexed)
                    .bind(vector)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO entity_index_coverage
                             (entity_type, tenant_id, organization_id, with_deleted,
                              base_count, indexed_count, vector_indexed_count, refreshed_at)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                         ON CONFLICT (entity_type, tenant_id, organization_id, with_deleted)
                         DO UPDATE SET
                             base_count = GREATEST(entity_index_coverage.base_count + $5, 0),
                             indexed_count = GREATEST(entity_index_coverage.indexed_count + $6, 0),
                             vector_indexed_count =
                                 GREATEST(entity_index_coverage.vector_indexed_count + $7, 0)",
                    )
                    .bind(adj.entity_type.as_str())
                    .bind(&adj.scope.tenant_id)
                    .bind(adj.scope.storage_org())
                    .bind(adj.scope.with_deleted)
                    .bind(adj.delta_base.max(0))
                    .bind(adj.delta_index.max(0))
                    .bind(adj.delta_vector.max(0))
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Absolute overwrite of selected counts, keeping the rest. Used by
    /// the reindexer to zero a scope at pass start and to commit
    /// authoritative values afterwards.
    pub async fn write_counts(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
        update: CountsUpdate,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO entity_index_coverage
                 (entity_type, tenant_id, organization_id, with_deleted,
                  base_count, indexed_count, vector_indexed_count, refreshed_at)
             VALUES ($1, $2, $3, $4, COALESCE($5, 0), COALESCE($6, 0), COALESCE($7, 0), NOW())
             ON CONFLICT (entity_type, tenant_id, organization_id, with_deleted)
             DO UPDATE SET
                 base_count = COALESCE($5, entity_index_coverage.base_count),
                 indexed_count = COALESCE($6, entity_index_coverage.indexed_count),
                 vector_indexed_count =
                     COALESCE($7, entity_index_coverage.vector_indexed_count),
                 refreshed_at = NOW()",
        )
        .bind(entity_type.as_str())
        .bind(&scope.tenant_id)
        .bind(scope.storage_org())
        .bind(scope.with_deleted)
        .bind(update.base_count)
        .bind(update.indexed_count)
        .bind(update.vector_count)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Remove every snapshot of an entity. Only used by entity-wide wipes.
    pub async fn wipe_entity(&self, entity_type: &EntityType) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entity_index_coverage WHERE entity_type = $1")
            .bind(entity_type.as_str())
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected())
    }

    /// Reset throttle: whether a coverage reset may run for the scope now.
    /// A successful check arms the throttle.
    pub fn should_reset(&self, entity_type: &EntityType, scope: &Scope, force: bool) -> bool {
        let key = scope.cache_key(entity_type);
        let mut guard = self.last_reset.lock();
        let now = Instant::now();
        if !force {
            if let Some(last) = guard.get(&key) {
                if now.duration_since(*last) < self.config.coverage_refresh_throttle {
                    debug!(scope = %key, "Coverage reset throttled");
                    return false;
                }
            }
        }
        guard.insert(key, now);
        true
    }

    async fn write_snapshot(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
        base_count: i64,
        indexed_count: i64,
        vector_count: i64,
    ) -> Result<CoverageRow> {
        let mut tx = self.pool.inner().begin().await?;

        // A legacy unscoped row would collide with the sentinel row's
        // uniqueness; clear it first.
        if scope.organization_id.is_none() {
            sqlx::query(
                "DELETE FROM entity_index_coverage
                 WHERE entity_type = $1 AND tenant_id = $2
                   AND organization_id IS NULL AND with_deleted = $3",
            )
            .bind(entity_type.as_str())
            .bind(&scope.tenant_id)
            .bind(scope.with_deleted)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(
            "INSERT INTO entity_index_coverage
                 (entity_type, tenant_id, organization_id, with_deleted,
                  base_count, indexed_count, vector_indexed_count, refreshed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
             ON CONFLICT (entity_type, tenant_id, organization_id, with_deleted)
             DO UPDATE SET
                 base_count = EXCLUDED.base_count,
                 indexed_count = EXCLUDED.indexed_count,
                 vector_indexed_count = EXCLUDED.vector_indexed_count,
                 refreshed_at = NOW()
             RETURNING entity_type, tenant_id, organization_id, with_deleted,
                       base_count, indexed_count, vector_indexed_count, refreshed_at",
        )
        .bind(entity_type.as_str())
        .bind(&scope.tenant_id)
        .bind(scope.storage_org())
        .bind(scope.with_deleted)
        .bind(base_count)
        .bind(indexed_count)
        .bind(vector_count)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            entity_type = %entity_type,
            tenant_id = %scope.tenant_id,
            base_count,
            indexed_count,
            "Coverage snapshot refreshed"
        );

        Ok(coverage_row(&row))
    }
}

/// Aggregate adjustments per `(entity, scope)` and drop zero-sum results.
#[must_use]
pub fn aggregate_adjustments(adjustments: Vec<CoverageAdjustment>) -> Vec<CoverageAdjustment> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, CoverageAdjustment> = HashMap::new();

    for adj in adjustments {
        let key = adj.scope.cache_key(&adj.entity_type);
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.delta_base += adj.delta_base;
                existing.delta_index += adj.delta_index;
                existing.delta_vector += adj.delta_vector;
            }
            None => {
                order.push(key.clone());
                merged.insert(key, adj);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .filter(|adj| adj.delta_base != 0 || adj.delta_index != 0 || adj.delta_vector != 0)
        .collect()
}

fn coverage_row(row: &sqlx::postgres::PgRow) -> CoverageRow {
    CoverageRow {
        entity_type: row.get("entity_type"),
        tenant_id: row.get("tenant_id"),
        organization_id: row.get("organization_id"),
        with_deleted: row.get("with_deleted"),
        base_count: row.get("base_count"),
        indexed_count: row.get("indexed_count"),
        vector_indexed_count: row.get("vector_indexed_count"),
        refreshed_at: row.get("refreshed_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adj(entity: &str, org: Option<&str>, base: i64, index: i64) -> CoverageAdjustment {
        CoverageAdjustment {
            entity_type: EntityType::new(entity).unwrap(),
            scope: Scope::new("t1", org.map(ToString::to_string)),
            delta_base: base,
            delta_index: index,
            delta_vector: 0,
        }
    }

    #[test]
    fn test_aggregate_same_scope_sums() {
        let merged = aggregate_adjustments(vec![
            adj("example:todo", Some("o1"), 1, 1),
            adj("example:todo", Some("o1"), 2, -1),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].delta_base, 3);
        assert_eq!(merged[0].delta_index, 0);
    }

    #[test]
    fn test_aggregate_drops_zero_sum() {
        let merged = aggregate_adjustments(vec![
            adj("example:todo", Some("o1"), 1, 0),
            adj("example:todo", Some("o1"), -1, 0),
        ]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_aggregate_keeps_disjoint_scopes() {
        let merged = aggregate_adjustments(vec![
            adj("example:todo", Some("o1"), 1, 1),
            adj("example:todo", Some("o2"), 1, 1),
            adj("example:note", Some("o1"), 1, 1),
        ]);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_coverage_row_staleness() {
        let row = CoverageRow {
            entity_type: "example:todo".to_string(),
            tenant_id: "t1".to_string(),
            organization_id: Some("o1".to_string()),
            with_deleted: false,
            base_count: 10,
            indexed_count: 10,
            vector_indexed_count: 0,
            refreshed_at: Utc::now() - chrono::Duration::seconds(120),
        };
        assert!(row.is_stale(Duration::from_secs(60), Utc::now()));
        assert!(!row.is_stale(Duration::from_secs(300), Utc::now()));
        assert!(row.is_complete());
    }

    #[test]
    fn test_coverage_row_completeness() {
        let mut row = CoverageRow {
            entity_type: "example:todo".to_string(),
            tenant_id: "t1".to_string(),
            organization_id: None,
            with_deleted: false,
            base_count: 10,
            indexed_count: 1,
            vector_indexed_count: 0,
            refreshed_at: Utc::now(),
        };
        assert!(!row.is_complete());
        row.base_count = 0;
        assert!(row.is_complete());
    }
}
