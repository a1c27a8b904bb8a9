//! Table/column existence probing.
//!
//! Base tables are owned by the host application and vary in shape; every
//! scoping clause (`tenant_id`, `organization_id`, `deleted_at`) is gated
//! on the column actually existing. Probe results are cached for the
//! process lifetime.

use crate::pool::IndexPool;
use dashmap::DashMap;
use sqlx::Row;
use std::sync::Arc;
use tracing::info;

/// Process-lifetime cache over `information_schema.columns`.
#[derive(Debug, Clone, Default)]
pub struct ColumnCache {
    tables: Arc<DashMap<String, Arc<Vec<String>>>>,
}

impl ColumnCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Column names of a table, empty when the table does not exist.
    pub async fn columns(
        &self,
        pool: &IndexPool,
        table: &str,
    ) -> Result<Arc<Vec<String>>, sqlx::Error> {
        if let Some(cached) = self.tables.get(table) {
            return Ok(Arc::clone(cached.value()));
        }

        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table)
        .fetch_all(pool.inner())
        .await?;

        let columns: Vec<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("column_name"))
            .collect();

        if columns.is_empty() {
            info!(table, "Table has no columns or does not exist");
        }

        let columns = Arc::new(columns);
        self.tables.insert(table.to_string(), Arc::clone(&columns));
        Ok(columns)
    }

    /// Whether a table exists (has at least one column).
    pub async fn table_exists(&self, pool: &IndexPool, table: &str) -> Result<bool, sqlx::Error> {
        Ok(!self.columns(pool, table).await?.is_empty())
    }

    /// Whether a table has a column.
    pub async fn has_column(
        &self,
        pool: &IndexPool,
        table: &str,
        column: &str,
    ) -> Result<bool, sqlx::Error> {
        Ok(self
            .columns(pool, table)
            .await?
            .iter()
            .any(|c| c == column))
    }

    /// Drop cached probe results, forcing re-probing.
    pub fn invalidate(&self) {
        self.tables.clear();
    }

    /// Probe the scoping columns of a base table in one pass.
    pub async fn scope_columns(
        &self,
        pool: &IndexPool,
        table: &str,
    ) -> Result<ScopeColumns, sqlx::Error> {
        let columns = self.columns(pool, table).await?;
        let has = |name: &str| columns.iter().any(|c| c == name);
        Ok(ScopeColumns {
            has_organization: has("organization_id"),
            has_tenant: has("tenant_id"),
            has_deleted: has("deleted_at"),
            has_updated: has("updated_at"),
        })
    }
}

/// Which scoping columns a base table carries. Missing columns degrade the
/// corresponding clause instead of failing the query.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeColumns {
    /// `organization_id` present.
    pub has_organization: bool,
    /// `tenant_id` present.
    pub has_tenant: bool,
    /// `deleted_at` present.
    pub has_deleted: bool,
    /// `updated_at` present.
    pub has_updated: bool,
}
