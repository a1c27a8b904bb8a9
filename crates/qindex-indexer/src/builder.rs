//! Document builder.
//!
//! Fuses a base row, an optional parent row (composite entities), active
//! custom-field values, and per-record translations into one ordered JSON
//! document. Layering order is fixed; later layers override earlier ones:
//!
//! 1. parent-entity columns (composite entities only)
//! 2. base-row columns
//! 3. `cf:<field_key>` custom-field values visible at the scope
//! 4. `l10n:<locale>:<field>` translations
//!
//! A missing base row is not an error: the builder returns `None` and the
//! indexer removes any stale index row.

use crate::error::{IndexerError, Result};
use qindex_core::doc::{doc_from_value, merge_over, Doc};
use qindex_core::{EntityType, EntityRegistry, RecordId, Scope};
use qindex_migrations::{ColumnCache, IndexPool};
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// How the effective organization is derived for rows of an entity when
/// no explicit override is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrgDerivation {
    /// The organization is the row's own primary key (e.g. the
    /// organization directory entity).
    RowId,
}

/// Composite-entity wiring: the parent row is merged underneath the
/// profile row so profile fields win on collision.
#[derive(Debug, Clone)]
pub struct CompositeSpec {
    /// Table holding the parent rows.
    pub parent_table: String,
    /// Column on the profile row referencing the parent's primary key.
    pub parent_id_column: String,
}

/// Builder configuration: external table names and per-entity wiring.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Table holding custom-field values (read-only for this subsystem).
    pub custom_field_values_table: String,
    /// Table holding custom-field definitions (read-only).
    pub custom_field_defs_table: String,
    /// Table holding per-record translations (read-only, optional).
    pub translations_table: String,
    /// Composite-entity specs keyed by entity type string.
    pub composites: HashMap<String, CompositeSpec>,
    /// Organization derivations keyed by entity type string.
    pub org_derivations: HashMap<String, OrgDerivation>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        let mut composites = HashMap::new();
        composites.insert(
            "crm:customer_person_profile".to_string(),
            CompositeSpec {
                parent_table: "customers".to_string(),
                parent_id_column: "customer_id".to_string(),
            },
        );
        composites.insert(
            "crm:customer_company_profile".to_string(),
            CompositeSpec {
                parent_table: "customers".to_string(),
                parent_id_column: "customer_id".to_string(),
            },
        );

        let mut org_derivations = HashMap::new();
        org_derivations.insert("directory:organization".to_string(), OrgDerivation::RowId);

        Self {
            custom_field_values_table: "custom_field_values".to_string(),
            custom_field_defs_table: "custom_field_defs".to_string(),
            translations_table: "entity_translations".to_string(),
            composites,
            org_derivations,
        }
    }
}

/// One custom-field value row, already collapsed to a JSON leaf.
#[derive(Debug, Clone)]
pub struct CustomFieldValue {
    /// The field key without the `cf:` prefix.
    pub field_key: String,
    /// The typed value as JSON.
    pub value: Value,
}

/// A custom-field value row with its own scoping columns, for per-row
/// visibility filtering in batch paths.
#[derive(Debug, Clone)]
pub struct RawCustomFieldValue {
    /// Owning record id.
    pub record_id: String,
    /// The field key without the `cf:` prefix.
    pub field_key: String,
    /// The typed value as JSON.
    pub value: Value,
    /// Organization the value is scoped to, if any.
    pub organization_id: Option<String>,
    /// Tenant the value is scoped to, if any.
    pub tenant_id: Option<String>,
}

impl RawCustomFieldValue {
    /// Visibility rule: a value is visible at a scope iff its organization
    /// and tenant are each null or equal to the scope's.
    #[must_use]
    pub fn visible_at(&self, scope: &Scope) -> bool {
        let org_ok = match &self.organization_id {
            None => true,
            Some(org) => scope.organization_id.as_deref() == Some(org.as_str()),
        };
        let tenant_ok = match &self.tenant_id {
            None => true,
            Some(tenant) => scope.tenant_id == *tenant,
        };
        org_ok && tenant_ok
    }
}

/// Builds index documents from base tables and their satellites.
pub struct DocumentBuilder {
    pool: IndexPool,
    registry: Arc<dyn EntityRegistry>,
    columns: ColumnCache,
    config: BuilderConfig,
}

impl DocumentBuilder {
    /// Create a builder over the shared pool.
    #[must_use]
    pub fn new(
        pool: IndexPool,
        registry: Arc<dyn EntityRegistry>,
        columns: ColumnCache,
        config: BuilderConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            columns,
            config,
        }
    }

    /// The builder configuration.
    #[must_use]
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Build the document for one record, or `None` when the base row is
    /// missing (or soft-deleted and the scope excludes deleted rows).
    pub async fn build(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<Option<Doc>> {
        let table = self
            .registry
            .table_name(entity_type)
            .ok_or_else(|| IndexerError::UnknownEntity(entity_type.to_string()))?;

        let Some(base) = self.fetch_base_row(&table, record_id, scope).await? else {
            return Ok(None);
        };

        let parent = self.fetch_parent_row(entity_type, &base).await;

        let custom_fields = match self.fetch_custom_fields(entity_type, record_id, scope).await {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    record_id = %record_id,
                    error = %e,
                    "Skipping custom-field layer"
                );
                Vec::new()
            }
        };

        let translations = match self.fetch_translations(entity_type, record_id, scope).await {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    record_id = %record_id,
                    error = %e,
                    "Skipping translation layer"
                );
                Vec::new()
            }
        };

        Ok(Some(compose(base, parent, custom_fields, translations)))
    }

    async fn fetch_base_row(
        &self,
        table: &str,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<Option<Doc>> {
        let scope_cols = self.columns.scope_columns(&self.pool, table).await?;

        let mut sql = format!(
            "SELECT row_to_json(t.*)::jsonb AS doc FROM {table} t WHERE t.id::text = $1"
        );
        if scope_cols.has_deleted && !scope.with_deleted {
            sql.push_str(" AND t.deleted_at IS NULL");
        }

        let row = sqlx::query(&sql)
            .bind(record_id.as_str())
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(row.and_then(|r| doc_from_value(r.get::<Value, _>("doc"))))
    }

    /// Fetch the parent row of a composite entity. Non-fatal: a lookup
    /// failure only drops the parent layer.
    async fn fetch_parent_row(&self, entity_type: &EntityType, base: &Doc) -> Option<Doc> {
        let spec = self.config.composites.get(entity_type.as_str())?;
        let parent_id = base.get(&spec.parent_id_column)?;
        let parent_id = match parent_id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };

        let sql = format!(
            "SELECT row_to_json(t.*)::jsonb AS doc FROM {} t WHERE t.id::text = $1",
            spec.parent_table
        );

        match sqlx::query(&sql)
            .bind(&parent_id)
            .fetch_optional(self.pool.inner())
            .await
        {
            Ok(row) => row.and_then(|r| doc_from_value(r.get::<Value, _>("doc"))),
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    parent_table = %spec.parent_table,
                    error = %e,
                    "Skipping parent-entity layer"
                );
                None
            }
        }
    }

    /// Fetch custom-field values visible at the scope for one record.
    pub async fn fetch_custom_fields(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<Vec<CustomFieldValue>> {
        let mut grouped = self
            .fetch_custom_fields_batch(entity_type, &[record_id.clone()], scope)
            .await?;
        Ok(grouped.remove(record_id.as_str()).unwrap_or_default())
    }

    /// Fetch custom-field values for many records in one query, grouped by
    /// record id. Used by the batch upserter.
    pub async fn fetch_custom_fields_batch(
        &self,
        entity_type: &EntityType,
        record_ids: &[RecordId],
        scope: &Scope,
    ) -> Result<HashMap<String, Vec<CustomFieldValue>>> {
        if record_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let table = &self.config.custom_field_values_table;
        if !self.columns.table_exists(&self.pool, table).await? {
            debug!(table, "Custom-field value table absent");
            return Ok(HashMap::new());
        }

        // Visibility: a value is visible when its org/tenant is null or
        // matches the scope exactly.
        let sql = format!(
            "SELECT record_id, field_key, value_text, value_int, value_float, value_bool
             FROM {table}
             WHERE entity_type = $1
               AND record_id = ANY($2)
               AND (organization_id IS NULL OR organization_id = $3)
               AND (tenant_id IS NULL OR tenant_id = $4)
               AND deleted_at IS NULL
             ORDER BY record_id, field_key, id"
        );

        let ids: Vec<String> = record_ids.iter().map(|r| r.as_str().to_string()).collect();
        let rows = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(&ids)
            .bind(scope.organization_id.as_deref())
            .bind(&scope.tenant_id)
            .fetch_all(self.pool.inner())
            .await?;

        let mut grouped: HashMap<String, Vec<CustomFieldValue>> = HashMap::new();
        for row in rows {
            let record_id: String = row.get("record_id");
            let field_key: String = row.get("field_key");
            let value = typed_value(&row);
            grouped
                .entry(record_id)
                .or_default()
                .push(CustomFieldValue { field_key, value });
        }
        Ok(grouped)
    }

    /// Fetch every custom-field value for a set of records, regardless of
    /// scope. Batch callers filter visibility per row with
    /// [`RawCustomFieldValue::visible_at`].
    pub async fn fetch_custom_fields_raw(
        &self,
        entity_type: &EntityType,
        record_ids: &[String],
    ) -> Result<Vec<RawCustomFieldValue>> {
        if record_ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = &self.config.custom_field_values_table;
        if !self.columns.table_exists(&self.pool, table).await? {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT record_id, field_key, value_text, value_int, value_float, value_bool,
                    organization_id, tenant_id
             FROM {table}
             WHERE entity_type = $1
               AND record_id = ANY($2)
               AND deleted_at IS NULL
             ORDER BY record_id, field_key, id"
        );

        let rows = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(record_ids)
            .fetch_all(self.pool.inner())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| RawCustomFieldValue {
                record_id: row.get("record_id"),
                field_key: row.get("field_key"),
                value: typed_value(&row),
                organization_id: row.get("organization_id"),
                tenant_id: row.get("tenant_id"),
            })
            .collect())
    }

    async fn fetch_translations(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<Vec<(String, Value)>> {
        let table = &self.config.translations_table;
        if !self.columns.table_exists(&self.pool, table).await? {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT locale, field, value
             FROM {table}
             WHERE entity_type = $1
               AND record_id = $2
               AND (organization_id IS NULL OR organization_id = $3)
               AND (tenant_id IS NULL OR tenant_id = $4)
             ORDER BY locale, field"
        );

        let rows = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(record_id.as_str())
            .bind(scope.organization_id.as_deref())
            .bind(&scope.tenant_id)
            .fetch_all(self.pool.inner())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let locale: String = row.get("locale");
                let field: String = row.get("field");
                let value: Option<String> = row.get("value");
                (
                    format!("l10n:{locale}:{field}"),
                    value.map_or(Value::Null, Value::String),
                )
            })
            .collect())
    }

    /// Whether the entity has at least one active custom-field definition
    /// visible at the scope. The CRUD bridge skips indexing otherwise.
    pub async fn has_active_custom_fields(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
    ) -> Result<bool> {
        let table = &self.config.custom_field_defs_table;
        if !self.columns.table_exists(&self.pool, table).await? {
            return Ok(false);
        }

        let sql = format!(
            "SELECT 1 FROM {table}
             WHERE entity_type = $1
               AND is_active = TRUE
               AND deleted_at IS NULL
               AND (organization_id IS NULL OR organization_id = $2)
               AND (tenant_id IS NULL OR tenant_id = $3)
             LIMIT 1"
        );

        let row = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(scope.organization_id.as_deref())
            .bind(&scope.tenant_id)
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(row.is_some())
    }

    /// Active custom-field keys for a set of entity types at a tenant.
    /// Used by the planner when `include_custom_fields = true`.
    pub async fn active_custom_field_keys(
        &self,
        entity_types: &[EntityType],
        tenant_id: &str,
        organization_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let table = &self.config.custom_field_defs_table;
        if entity_types.is_empty() || !self.columns.table_exists(&self.pool, table).await? {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT DISTINCT field_key FROM {table}
             WHERE entity_type = ANY($1)
               AND is_active = TRUE
               AND deleted_at IS NULL
               AND (organization_id IS NULL OR organization_id = $2)
               AND (tenant_id IS NULL OR tenant_id = $3)
             ORDER BY field_key"
        );

        let types: Vec<String> = entity_types.iter().map(|e| e.as_str().to_string()).collect();
        let rows = sqlx::query(&sql)
            .bind(&types)
            .bind(organization_id)
            .bind(tenant_id)
            .fetch_all(self.pool.inner())
            .await?;

        Ok(rows.into_iter().map(|r| r.get("field_key")).collect())
    }
}

/// Pure document composition. Parent under base, then custom fields,
/// then translations.
#[must_use]
pub fn compose(
    base: Doc,
    parent: Option<Doc>,
    custom_fields: Vec<CustomFieldValue>,
    translations: Vec<(String, Value)>,
) -> Doc {
    let mut doc = parent.unwrap_or_default();
    merge_over(&mut doc, base);

    for (key, value) in group_custom_fields(custom_fields) {
        doc.insert(format!("cf:{key}"), value);
    }

    for (key, value) in translations {
        doc.insert(key, value);
    }

    doc
}

/// Collapse custom-field rows per key: one value stays scalar, several
/// become an ordered array.
#[must_use]
pub fn group_custom_fields(values: Vec<CustomFieldValue>) -> Vec<(String, Value)> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();

    for value in values {
        if !grouped.contains_key(&value.field_key) {
            order.push(value.field_key.clone());
        }
        grouped.entry(value.field_key).or_default().push(value.value);
    }

    order
        .into_iter()
        .map(|key| {
            let mut values = grouped.remove(&key).unwrap_or_default();
            let collapsed = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            (key, collapsed)
        })
        .collect()
}

fn typed_value(row: &sqlx::postgres::PgRow) -> Value {
    if let Ok(Some(text)) = row.try_get::<Option<String>, _>("value_text") {
        return Value::String(text);
    }
    if let Ok(Some(int)) = row.try_get::<Option<i64>, _>("value_int") {
        return Value::from(int);
    }
    if let Ok(Some(float)) = row.try_get::<Option<f64>, _>("value_float") {
        return Value::from(float);
    }
    if let Ok(Some(boolean)) = row.try_get::<Option<bool>, _>("value_bool") {
        return Value::Bool(boolean);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cf(key: &str, value: Value) -> CustomFieldValue {
        CustomFieldValue {
            field_key: key.to_string(),
            value,
        }
    }

    #[test]
    fn test_compose_layering_order() {
        let base = doc_from_value(json!({"id": "p1", "name": "profile", "title": "Base"}))
            .unwrap();
        let parent =
            doc_from_value(json!({"id": "c1", "name": "parent", "email": "c@x"})).unwrap();
        let doc = compose(
            base,
            Some(parent),
            vec![cf("priority", json!("high"))],
            vec![("l10n:de:title".to_string(), json!("Basis"))],
        );

        // Profile wins over parent; parent-only fields survive.
        assert_eq!(doc.get("id"), Some(&json!("p1")));
        assert_eq!(doc.get("name"), Some(&json!("profile")));
        assert_eq!(doc.get("email"), Some(&json!("c@x")));
        assert_eq!(doc.get("cf:priority"), Some(&json!("high")));
        assert_eq!(doc.get("l10n:de:title"), Some(&json!("Basis")));
    }

    #[test]
    fn test_group_custom_fields_scalar_vs_array() {
        let grouped = group_custom_fields(vec![
            cf("priority", json!("high")),
            cf("tags", json!("red")),
            cf("tags", json!("blue")),
        ]);

        assert_eq!(
            grouped,
            vec![
                ("priority".to_string(), json!("high")),
                ("tags".to_string(), json!(["red", "blue"])),
            ]
        );
    }

    #[test]
    fn test_group_custom_fields_preserves_first_seen_order() {
        let grouped = group_custom_fields(vec![
            cf("b", json!(1)),
            cf("a", json!(2)),
            cf("b", json!(3)),
        ]);
        assert_eq!(grouped[0].0, "b");
        assert_eq!(grouped[0].1, json!([1, 3]));
        assert_eq!(grouped[1].0, "a");
    }

    #[test]
    fn test_visibility_rule() {
        let value = RawCustomFieldValue {
            record_id: "r1".to_string(),
            field_key: "priority".to_string(),
            value: json!("high"),
            organization_id: Some("o1".to_string()),
            tenant_id: None,
        };
        assert!(value.visible_at(&Scope::new("t1", Some("o1".to_string()))));
        assert!(!value.visible_at(&Scope::new("t1", Some("o2".to_string()))));
        // Scoped value is invisible at the global scope.
        assert!(!value.visible_at(&Scope::new("t1", None)));

        let global = RawCustomFieldValue {
            organization_id: None,
            tenant_id: None,
            ..value
        };
        assert!(global.visible_at(&Scope::new("t1", None)));
        assert!(global.visible_at(&Scope::new("t2", Some("o9".to_string()))));
    }

    #[test]
    fn test_default_config_wiring() {
        let config = BuilderConfig::default();
        assert!(config.composites.contains_key("crm:customer_person_profile"));
        assert_eq!(
            config.org_derivations.get("directory:organization"),
            Some(&OrgDerivation::RowId)
        );
    }
}
