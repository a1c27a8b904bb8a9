//! Append-only diagnostic log stores.
//!
//! `indexer_error_logs` and `indexer_status_logs` are observational tables
//! keyed by `(source, handler, occurred_at)`. Control logic never reads
//! them; the status aggregator exposes recent entries to administrative
//! callers. Writes are best-effort: a failed insert is logged and dropped
//! so diagnostics can never take down the paths they describe.

use chrono::{DateTime, Utc};
use qindex_migrations::IndexPool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tracing::warn;

/// One diagnostic entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagEntry {
    /// Component that produced the entry (e.g. `reindexer`).
    pub source: String,
    /// Handler or operation within the component.
    pub handler: String,
    /// Human-readable message.
    pub message: String,
    /// Structured payload, if any.
    pub detail: Option<Value>,
    /// When the entry was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl DiagEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        handler: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            handler: handler.into(),
            message: message.into(),
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Writer/reader over the two diagnostic tables.
#[derive(Debug, Clone)]
pub struct DiagStore {
    pool: IndexPool,
}

impl DiagStore {
    /// Create a store over the shared pool.
    #[must_use]
    pub fn new(pool: IndexPool) -> Self {
        Self { pool }
    }

    /// Record an error entry. Best-effort.
    pub async fn record_error(&self, entry: DiagEntry) {
        self.insert("indexer_error_logs", entry).await;
    }

    /// Record a status entry. Best-effort.
    pub async fn record_status(&self, entry: DiagEntry) {
        self.insert("indexer_status_logs", entry).await;
    }

    async fn insert(&self, table: &str, entry: DiagEntry) {
        let sql = format!(
            "INSERT INTO {table} (source, handler, message, detail, occurred_at)
             VALUES ($1, $2, $3, $4, $5)"
        );
        let result = sqlx::query(&sql)
            .bind(&entry.source)
            .bind(&entry.handler)
            .bind(&entry.message)
            .bind(&entry.detail)
            .bind(entry.occurred_at)
            .execute(self.pool.inner())
            .await;

        if let Err(e) = result {
            warn!(table, source = %entry.source, error = %e, "Failed to record diagnostic entry");
        }
    }

    /// Most recent error entries for a source, newest first.
    pub async fn recent_errors(
        &self,
        source: &str,
        limit: i64,
    ) -> Result<Vec<DiagEntry>, sqlx::Error> {
        self.fetch_recent("indexer_error_logs", source, limit).await
    }

    /// Most recent status entries for a source, newest first.
    pub async fn recent_statuses(
        &self,
        source: &str,
        limit: i64,
    ) -> Result<Vec<DiagEntry>, sqlx::Error> {
        self.fetch_recent("indexer_status_logs", source, limit)
            .await
    }

    async fn fetch_recent(
        &self,
        table: &str,
        source: &str,
        limit: i64,
    ) -> Result<Vec<DiagEntry>, sqlx::Error> {
        let sql = format!(
            "SELECT source, handler, message, detail, occurred_at
             FROM {table}
             WHERE source = $1
             ORDER BY occurred_at DESC
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(limit)
            .fetch_all(self.pool.inner())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| DiagEntry {
                source: row.get("source"),
                handler: row.get("handler"),
                message: row.get("message"),
                detail: row.get("detail"),
                occurred_at: row.get("occurred_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_builder() {
        let entry = DiagEntry::new("reindexer", "query_index.reindex", "pass completed")
            .with_detail(json!({"processed": 10}));
        assert_eq!(entry.source, "reindexer");
        assert_eq!(entry.detail, Some(json!({"processed": 10})));
    }
}
