//! Scope-wide index purge.
//!
//! Soft-deletes every matching index row under job bookkeeping. Coverage
//! is not touched here; the purge event handler schedules a refresh
//! afterwards.

use crate::error::Result;
use qindex_core::EntityType;
use qindex_coverage::{JobLedger, JobScope, JobStatus};
use qindex_migrations::IndexPool;
use sqlx::Row;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Rows soft-deleted.
    pub purged: u64,
}

/// Soft-deletes index rows for a whole scope.
pub struct Purger {
    pool: IndexPool,
    ledger: Arc<JobLedger>,
}

impl Purger {
    /// Create a purger over the shared pool.
    #[must_use]
    pub fn new(pool: IndexPool, ledger: Arc<JobLedger>) -> Self {
        Self { pool, ledger }
    }

    /// Soft-delete every active index row in the scope.
    pub async fn purge(
        &self,
        entity_type: &EntityType,
        organization_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<PurgeOutcome> {
        let total = self
            .count_active(entity_type, organization_id, tenant_id)
            .await?;

        let job_scope = JobScope::new(
            entity_type.clone(),
            organization_id.map(ToString::to_string),
            tenant_id.map(ToString::to_string),
        );
        self.ledger
            .prepare(&job_scope, JobStatus::Purging, total)
            .await?;

        let result = self
            .soft_delete(entity_type, organization_id, tenant_id)
            .await;

        match &result {
            Ok(purged) => {
                if let Err(e) = self.ledger.update_progress(&job_scope, *purged as i64).await {
                    warn!(entity_type = %entity_type, error = %e, "Purge progress update failed");
                }
            }
            Err(_) => {}
        }

        if let Err(e) = self.ledger.finalize(&job_scope).await {
            warn!(entity_type = %entity_type, error = %e, "Failed to finalize purge job");
        }

        let purged = result?;
        info!(entity_type = %entity_type, purged, "Purge completed");
        Ok(PurgeOutcome { purged })
    }

    async fn count_active(
        &self,
        entity_type: &EntityType,
        organization_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<i64> {
        let (predicate, binds) = scope_filter(organization_id, tenant_id);
        let sql = format!(
            "SELECT COUNT(*) AS n FROM entity_indexes
             WHERE entity_type = $1 AND deleted_at IS NULL{predicate}"
        );
        let mut query = sqlx::query(&sql).bind(entity_type.as_str());
        for bind in &binds {
            query = query.bind(bind);
        }
        let row = query.fetch_one(self.pool.inner()).await?;
        Ok(row.get::<i64, _>("n"))
    }

    async fn soft_delete(
        &self,
        entity_type: &EntityType,
        organization_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<u64> {
        let (predicate, binds) = scope_filter(organization_id, tenant_id);
        let sql = format!(
            "UPDATE entity_indexes
             SET deleted_at = NOW(), updated_at = NOW()
             WHERE entity_type = $1 AND deleted_at IS NULL{predicate}"
        );
        let mut query = sqlx::query(&sql).bind(entity_type.as_str());
        for bind in &binds {
            query = query.bind(bind);
        }
        let result = query.execute(self.pool.inner()).await?;
        Ok(result.rows_affected())
    }
}

fn scope_filter(
    organization_id: Option<&str>,
    tenant_id: Option<&str>,
) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(org) = organization_id {
        binds.push(org.to_string());
        sql.push_str(&format!(" AND organization_id = ${}", binds.len() + 1));
    }
    if let Some(tenant) = tenant_id {
        binds.push(tenant.to_string());
        sql.push_str(&format!(" AND tenant_id = ${}", binds.len() + 1));
    }
    (sql, binds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_filter_placeholders() {
        let (sql, binds) = scope_filter(Some("o1"), Some("t1"));
        assert!(sql.contains("organization_id = $2"));
        assert!(sql.contains("tenant_id = $3"));
        assert_eq!(binds, vec!["o1".to_string(), "t1".to_string()]);

        let (sql, binds) = scope_filter(None, None);
        assert!(sql.is_empty());
        assert!(binds.is_empty());
    }
}
