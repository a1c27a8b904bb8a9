//! The hybrid query planner.
//!
//! Stateless per request apart from its caches. Decides per query whether
//! to join `entity_indexes` (hybrid path) or stay on the base table
//! (naive path), guided by the coverage snapshot; coverage problems never
//! fail a read, they degrade it and schedule repair work.

use crate::caches::{PendingRefreshes, TtlCache};
use crate::error::{PlannerError, Result};
use crate::options::{
    IncludeCustomFields, PartialIndexWarning, QueryMeta, QueryOptions, QueryResult,
};
use crate::sql::{
    build_count, build_custom_entity_count, build_custom_entity_select, build_select, BindValue,
    PlanInputs, SqlQuery,
};
use qindex_config::QindexConfig;
use qindex_core::{events, EntityRegistry, EntityType, EventBus, Scope};
use qindex_coverage::{CoverageAccountant, CoverageRow};
use qindex_indexer::DocumentBuilder;
use qindex_migrations::{ColumnCache, IndexPool};
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, warn};

enum Path {
    Hybrid,
    Naive,
}

/// The planner.
pub struct Planner {
    pool: IndexPool,
    registry: Arc<dyn EntityRegistry>,
    columns: ColumnCache,
    accountant: Arc<CoverageAccountant>,
    builder: Arc<DocumentBuilder>,
    bus: Option<Arc<dyn EventBus>>,
    config: QindexConfig,
    coverage_cache: TtlCache<CoverageRow>,
    cf_keys_cache: TtlCache<Vec<String>>,
    pending_refreshes: PendingRefreshes,
}

impl Planner {
    /// Create a planner over the shared pool.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        pool: IndexPool,
        registry: Arc<dyn EntityRegistry>,
        columns: ColumnCache,
        accountant: Arc<CoverageAccountant>,
        builder: Arc<DocumentBuilder>,
        bus: Option<Arc<dyn EventBus>>,
        config: QindexConfig,
    ) -> Self {
        let coverage_cache = TtlCache::new(config.coverage_cache_ttl);
        let cf_keys_cache = TtlCache::new(config.cf_keys_cache_ttl);
        Self {
            pool,
            registry,
            columns,
            accountant,
            builder,
            bus,
            config,
            coverage_cache,
            cf_keys_cache,
            pending_refreshes: PendingRefreshes::new(),
        }
    }

    /// Run one query.
    pub async fn query(
        &self,
        entity_type: &EntityType,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        if options.tenant_id.is_empty() {
            return Err(PlannerError::InvalidArgument(
                "tenantId is required".to_string(),
            ));
        }

        // An empty organization set can never match; skip the database.
        if options.organization.is_empty_match() {
            return Ok(QueryResult::empty(options.page, options.page_size));
        }

        if self.registry.is_custom_entity(entity_type) {
            return self.query_custom_entity(entity_type, options).await;
        }

        let table = self
            .registry
            .table_name(entity_type)
            .ok_or_else(|| PlannerError::UnknownEntity(entity_type.to_string()))?;

        if !self.columns.table_exists(&self.pool, &table).await? {
            warn!(entity_type = %entity_type, table, "Base table missing, returning empty page");
            return Ok(QueryResult::empty(options.page, options.page_size));
        }
        let base_cols = self.columns.scope_columns(&self.pool, &table).await?;

        let (path, warning) = if options.touches_custom_fields() {
            self.decide_path(entity_type, options).await
        } else {
            // Without custom fields the base table answers everything.
            (Path::Naive, None)
        };

        let cf_keys = match &options.include_custom_fields {
            IncludeCustomFields::No => Vec::new(),
            IncludeCustomFields::Some(keys) => keys.clone(),
            IncludeCustomFields::All => self.resolve_cf_keys(entity_type, options).await,
        };

        let inputs = PlanInputs {
            entity_type: entity_type.as_str(),
            table: &table,
            base_cols,
            options,
            use_index: matches!(path, Path::Hybrid),
            cf_keys: &cf_keys,
        };

        let select = build_select(&inputs)?;
        let count = build_count(&inputs)?;
        self.debug_sql(&select);

        let items = self.fetch_items(&select).await?;
        let total = self.fetch_total(&count).await?;

        let meta = warning.map(|partial_index_warning| QueryMeta {
            partial_index_warning: Some(partial_index_warning),
        });

        Ok(QueryResult {
            items,
            page: options.page,
            page_size: options.page_size,
            total,
            meta,
        })
    }

    /// Coverage-aware path decision for queries that touch custom fields.
    async fn decide_path(
        &self,
        entity_type: &EntityType,
        options: &QueryOptions,
    ) -> (Path, Option<PartialIndexWarning>) {
        let scope = self.coverage_scope(options);
        let snapshot = self.lookup_coverage(entity_type, &scope).await;

        let Some(snapshot) = snapshot else {
            let has_rows = self.any_index_rows(entity_type, &scope).await;
            self.schedule_refresh(entity_type, &scope).await;
            if has_rows {
                warn!(
                    entity_type = %entity_type,
                    "Index rows present but coverage snapshot missing, proceeding through the index"
                );
                return (Path::Hybrid, None);
            }
            return (Path::Naive, None);
        };

        if snapshot.base_count > 0 && snapshot.indexed_count < snapshot.base_count {
            let warning = PartialIndexWarning {
                entity: entity_type.to_string(),
                base_count: snapshot.base_count,
                indexed_count: snapshot.indexed_count,
                scope: if scope.organization_id.is_some() {
                    "scoped".to_string()
                } else {
                    "global".to_string()
                },
            };
            if self.config.schedule_auto_reindex {
                self.schedule_reindex(entity_type, &scope).await;
            }
            if self.config.force_partial_index {
                warn!(
                    entity_type = %entity_type,
                    base_count = snapshot.base_count,
                    indexed_count = snapshot.indexed_count,
                    "Partial index coverage, proceeding through the index"
                );
                return (Path::Hybrid, Some(warning));
            }
            return (Path::Naive, Some(warning));
        }

        (Path::Hybrid, None)
    }

    fn coverage_scope(&self, options: &QueryOptions) -> Scope {
        let organization_id = match &options.organization {
            crate::options::OrganizationFilter::One(org) => Some(org.clone()),
            _ => None,
        };
        Scope::new(options.tenant_id.clone(), organization_id)
            .with_deleted(options.with_deleted)
    }

    /// Snapshot lookup through the TTL cache. When coverage-stat
    /// optimization is off, a stale snapshot is refreshed inline; when
    /// on, the stale value is used and a refresh is scheduled instead.
    async fn lookup_coverage(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
    ) -> Option<CoverageRow> {
        let key = scope.cache_key(entity_type);
        if let Some(cached) = self.coverage_cache.get(&key) {
            return Some(cached);
        }

        let snapshot = match self.accountant.read_snapshot(entity_type, scope).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Coverage lookup failed");
                return None;
            }
        };

        let snapshot = match snapshot {
            Some(snapshot)
                if snapshot.is_stale(self.config.coverage_stale_after, chrono::Utc::now()) =>
            {
                if self.config.optimize_coverage_stats {
                    self.schedule_refresh(entity_type, scope).await;
                    Some(snapshot)
                } else {
                    match self.accountant.refresh_snapshot(entity_type, scope, None).await {
                        Ok(fresh) => Some(fresh),
                        Err(e) => {
                            warn!(entity_type = %entity_type, error = %e, "Inline coverage refresh failed");
                            Some(snapshot)
                        }
                    }
                }
            }
            other => other,
        };

        if let Some(snapshot) = &snapshot {
            self.coverage_cache.insert(key, snapshot.clone());
        }
        snapshot
    }

    async fn any_index_rows(&self, entity_type: &EntityType, scope: &Scope) -> bool {
        let result = sqlx::query(
            "SELECT 1 AS one FROM entity_indexes
             WHERE entity_type = $1 AND tenant_id IS NOT DISTINCT FROM $2
             LIMIT 1",
        )
        .bind(entity_type.as_str())
        .bind(&scope.tenant_id)
        .fetch_optional(self.pool.inner())
        .await;

        match result {
            Ok(row) => row.is_some(),
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Index row probe failed");
                false
            }
        }
    }

    /// Emit a best-effort debounced refresh request, de-duplicated across
    /// concurrent requests for the same scope.
    async fn schedule_refresh(&self, entity_type: &EntityType, scope: &Scope) {
        let Some(bus) = &self.bus else {
            debug!(entity_type = %entity_type, "No bus wired, skipping refresh scheduling");
            return;
        };
        let key = format!("refresh|{}", scope.cache_key(entity_type));
        if !self.pending_refreshes.claim(&key) {
            return;
        }
        let payload = json!({
            "entityType": entity_type.as_str(),
            "tenantId": scope.tenant_id,
            "organizationId": scope.organization_id,
            "withDeleted": scope.with_deleted,
        });
        if let Err(e) = bus.emit(events::COVERAGE_REFRESH, payload, false).await {
            warn!(entity_type = %entity_type, error = %e, "Refresh scheduling failed");
        }
        self.pending_refreshes.release(&key);
        self.coverage_cache.invalidate(&scope.cache_key(entity_type));
    }

    /// Schedule a durable auto-reindex for a partially covered scope.
    async fn schedule_reindex(&self, entity_type: &EntityType, scope: &Scope) {
        let Some(bus) = &self.bus else { return };
        let key = format!("reindex|{}", scope.cache_key(entity_type));
        if !self.pending_refreshes.claim(&key) {
            return;
        }
        let payload = json!({
            "entityType": entity_type.as_str(),
            "tenantId": scope.tenant_id,
            "organizationId": scope.organization_id,
        });
        if let Err(e) = bus.emit(events::REINDEX, payload, true).await {
            warn!(entity_type = %entity_type, error = %e, "Auto-reindex scheduling failed");
        }
        self.pending_refreshes.release(&key);
    }

    /// Active custom-field keys for the entity and every joined source,
    /// cached per `(entities, tenant)`.
    async fn resolve_cf_keys(
        &self,
        entity_type: &EntityType,
        options: &QueryOptions,
    ) -> Vec<String> {
        let mut entities = vec![entity_type.clone()];
        for source in &options.custom_field_sources {
            if let Some(entity) = &source.entity_type {
                if let Ok(parsed) = EntityType::new(entity.clone()) {
                    entities.push(parsed);
                }
            }
        }

        let cache_key = format!(
            "{}|{}",
            entities
                .iter()
                .map(EntityType::as_str)
                .collect::<Vec<_>>()
                .join(","),
            options.tenant_id
        );
        if let Some(keys) = self.cf_keys_cache.get(&cache_key) {
            return keys;
        }

        let organization_id = match &options.organization {
            crate::options::OrganizationFilter::One(org) => Some(org.as_str()),
            _ => None,
        };
        match self
            .builder
            .active_custom_field_keys(&entities, &options.tenant_id, organization_id)
            .await
        {
            Ok(keys) => {
                self.cf_keys_cache.insert(cache_key, keys.clone());
                keys
            }
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Custom-field key lookup failed");
                Vec::new()
            }
        }
    }

    async fn query_custom_entity(
        &self,
        entity_type: &EntityType,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let select = build_custom_entity_select(entity_type.as_str(), options)?;
        let count = build_custom_entity_count(entity_type.as_str(), options);
        self.debug_sql(&select);

        let rows = bind_all(&select.sql, &select.binds)
            .fetch_all(self.pool.inner())
            .await?;
        let items = rows
            .into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let mut doc = match row.get::<Value, _>("doc") {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                doc.insert("id".to_string(), Value::String(id));
                Value::Object(doc)
            })
            .collect();

        let total = self.fetch_total(&count).await?;

        Ok(QueryResult {
            items,
            page: options.page,
            page_size: options.page_size,
            total,
            meta: None,
        })
    }

    async fn fetch_items(&self, query: &SqlQuery) -> Result<Vec<Value>> {
        // Wrapping keeps the dynamic column list out of the fetch layer.
        let wrapped = format!("SELECT row_to_json(q.*) AS item FROM ({}) q", query.sql);
        let rows = bind_all(&wrapped, &query.binds)
            .fetch_all(self.pool.inner())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row: PgRow| row.get::<Value, _>("item"))
            .collect())
    }

    async fn fetch_total(&self, query: &SqlQuery) -> Result<i64> {
        let row = bind_all(&query.sql, &query.binds)
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.get::<i64, _>("total"))
    }

    fn debug_sql(&self, query: &SqlQuery) {
        if std::env::var("QUERY_ENGINE_DEBUG_SQL")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false)
        {
            debug!(sql = %query.sql, binds = query.binds.len(), "Planner SQL");
        }
    }
}

/// Apply bind values to a statement in order.
fn bind_all<'q>(
    sql: &'q str,
    binds: &'q [BindValue],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(sql);
    for bind in binds {
        query = match bind {
            BindValue::Text(v) => query.bind(v),
            BindValue::Int(v) => query.bind(v),
            BindValue::Float(v) => query.bind(v),
            BindValue::Bool(v) => query.bind(v),
            BindValue::Json(v) => query.bind(v),
        };
    }
    query
}
