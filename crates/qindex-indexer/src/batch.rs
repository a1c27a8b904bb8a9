//! Vectorized index upserts.
//!
//! The reindexer hands over whole scan chunks; the batch upserter composes
//! every document, then writes all rows with a single multi-row upsert.
//! When the coalesced conflict target is missing it falls back to a
//! transaction of per-row update-then-insert, tolerating concurrent
//! insert races.

use crate::builder::{DocumentBuilder, OrgDerivation};
use crate::error::Result;
use crate::indexer::{is_missing_conflict_target, is_unique_violation};
use crate::tokens::TokenExtractor;
use qindex_core::doc::{doc_from_value, Doc};
use qindex_core::{DocCipher, EntityType, RecordId, Scope};
use qindex_migrations::IndexPool;
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Forces a tenant/organization onto every row of a batch.
#[derive(Debug, Clone, Default)]
pub struct ScopeOverrides {
    /// Force this tenant.
    pub tenant_id: Option<String>,
    /// Force this organization.
    pub organization_id: Option<String>,
}

/// Batch tuning knobs.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Replace search tokens after the upsert.
    pub replace_tokens: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            replace_tokens: true,
        }
    }
}

struct PreparedRow {
    record_id: RecordId,
    scope: Scope,
    doc: Doc,
}

/// Upserts many index rows in one statement.
pub struct BatchUpserter {
    pool: IndexPool,
    builder: Arc<DocumentBuilder>,
    tokens: Arc<TokenExtractor>,
    cipher: Option<Arc<dyn DocCipher>>,
}

impl BatchUpserter {
    /// Create a batch upserter over the shared pool.
    #[must_use]
    pub fn new(
        pool: IndexPool,
        builder: Arc<DocumentBuilder>,
        tokens: Arc<TokenExtractor>,
        cipher: Option<Arc<dyn DocCipher>>,
    ) -> Self {
        Self {
            pool,
            builder,
            tokens,
            cipher,
        }
    }

    /// Upsert a chunk of base rows (as JSON objects) into the index.
    /// Returns the scopes and row counts written, for coverage deltas.
    pub async fn upsert_many(
        &self,
        entity_type: &EntityType,
        base_rows: Vec<Doc>,
        overrides: Option<&ScopeOverrides>,
        options: &BatchOptions,
    ) -> Result<HashMap<Scope, u64>> {
        if base_rows.is_empty() {
            return Ok(HashMap::new());
        }

        let record_ids: Vec<String> = base_rows
            .iter()
            .filter_map(|row| row_id(row))
            .collect();

        let custom_fields = self
            .builder
            .fetch_custom_fields_raw(entity_type, &record_ids)
            .await
            .unwrap_or_else(|e| {
                warn!(entity_type = %entity_type, error = %e, "Skipping custom-field layer for batch");
                Vec::new()
            });

        let parents = self.prefetch_parents(entity_type, &base_rows).await;

        let mut prepared = Vec::with_capacity(base_rows.len());
        for base in base_rows {
            let Some(id) = row_id(&base) else {
                warn!(entity_type = %entity_type, "Skipping base row without id");
                continue;
            };
            let scope = effective_scope(
                &base,
                overrides,
                self.builder.config().org_derivations.get(entity_type.as_str()),
            );

            let row_fields = custom_fields
                .iter()
                .filter(|cf| cf.record_id == id && cf.visible_at(&scope))
                .map(|cf| crate::builder::CustomFieldValue {
                    field_key: cf.field_key.clone(),
                    value: cf.value.clone(),
                })
                .collect();

            let parent = parent_for(entity_type, &base, &parents, self.builder.config());
            let doc = crate::builder::compose(base, parent, row_fields, Vec::new());

            let record_id = RecordId::new(id);
            let doc = self.apply_encrypt(entity_type, &record_id, doc).await;
            prepared.push(PreparedRow {
                record_id,
                scope,
                doc,
            });
        }

        if prepared.is_empty() {
            return Ok(HashMap::new());
        }

        self.write_rows(entity_type, &prepared).await?;

        if options.replace_tokens {
            self.replace_tokens_batch(entity_type, &prepared).await;
        }

        let mut counts: HashMap<Scope, u64> = HashMap::new();
        for row in &prepared {
            *counts.entry(row.scope.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn write_rows(&self, entity_type: &EntityType, rows: &[PreparedRow]) -> Result<()> {
        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO entity_indexes (entity_type, record_id, organization_id, tenant_id, doc) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(entity_type.as_str())
                .push_bind(row.record_id.as_str())
                .push_bind(row.scope.organization_id.as_deref())
                .push_bind(&row.scope.tenant_id)
                .push_bind(Value::Object(row.doc.clone()));
        });
        builder.push(
            " ON CONFLICT (entity_type, record_id, organization_id_coalesced)
              DO UPDATE SET
                  doc = EXCLUDED.doc,
                  tenant_id = EXCLUDED.tenant_id,
                  index_version = entity_indexes.index_version + 1,
                  updated_at = NOW(),
                  deleted_at = NULL",
        );

        match builder.build().execute(self.pool.inner()).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_conflict_target(&e) => {
                debug!(entity_type = %entity_type, "Batch conflict target missing, using per-row fallback");
                self.write_rows_fallback(entity_type, rows).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Per-row update-then-insert inside one transaction, tolerating
    /// concurrent insert races on the unique key.
    async fn write_rows_fallback(
        &self,
        entity_type: &EntityType,
        rows: &[PreparedRow],
    ) -> Result<()> {
        let mut tx = self.pool.inner().begin().await?;

        for row in rows {
            let doc_value = Value::Object(row.doc.clone());
            let updated = sqlx::query(
                "UPDATE entity_indexes
                 SET doc = $4, tenant_id = $5, index_version = index_version + 1,
                     updated_at = NOW(), deleted_at = NULL
                 WHERE entity_type = $1 AND record_id = $2
                   AND organization_id IS NOT DISTINCT FROM $3",
            )
            .bind(entity_type.as_str())
            .bind(row.record_id.as_str())
            .bind(row.scope.organization_id.as_deref())
            .bind(&doc_value)
            .bind(&row.scope.tenant_id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() > 0 {
                continue;
            }

            let inserted = sqlx::query(
                "INSERT INTO entity_indexes
                     (entity_type, record_id, organization_id, tenant_id, doc)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(entity_type.as_str())
            .bind(row.record_id.as_str())
            .bind(row.scope.organization_id.as_deref())
            .bind(&row.scope.tenant_id)
            .bind(&doc_value)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn prefetch_parents(
        &self,
        entity_type: &EntityType,
        base_rows: &[Doc],
    ) -> HashMap<String, Doc> {
        let Some(spec) = self.builder.config().composites.get(entity_type.as_str()) else {
            return HashMap::new();
        };

        let parent_ids: Vec<String> = base_rows
            .iter()
            .filter_map(|row| match row.get(&spec.parent_id_column) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        if parent_ids.is_empty() {
            return HashMap::new();
        }

        let sql = format!(
            "SELECT t.id::text AS parent_id, row_to_json(t.*)::jsonb AS doc
             FROM {} t WHERE t.id::text = ANY($1)",
            spec.parent_table
        );

        match sqlx::query(&sql)
            .bind(&parent_ids)
            .fetch_all(self.pool.inner())
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let id: String = row.get("parent_id");
                    doc_from_value(row.get::<Value, _>("doc")).map(|doc| (id, doc))
                })
                .collect(),
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Skipping parent-entity layer for batch");
                HashMap::new()
            }
        }
    }

    async fn apply_encrypt(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        doc: Doc,
    ) -> Doc {
        let Some(cipher) = &self.cipher else {
            return doc;
        };
        match cipher
            .encrypt_doc(entity_type, record_id, doc.clone())
            .await
        {
            Ok(encrypted) => encrypted,
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    record_id = %record_id,
                    error = %e,
                    "Encrypt hook failed, storing plaintext document"
                );
                doc
            }
        }
    }

    async fn replace_tokens_batch(&self, entity_type: &EntityType, rows: &[PreparedRow]) {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let doc = match &self.cipher {
                Some(cipher) => cipher
                    .decrypt_doc(entity_type, &row.record_id, row.doc.clone())
                    .await
                    .unwrap_or_else(|e| {
                        warn!(
                            entity_type = %entity_type,
                            record_id = %row.record_id,
                            error = %e,
                            "Decrypt hook failed, extracting tokens from stored values"
                        );
                        row.doc.clone()
                    }),
                None => row.doc.clone(),
            };
            records.push((row.record_id.clone(), row.scope.clone(), doc));
        }

        if let Err(e) = self.tokens.replace_for_batch(entity_type, &records).await {
            warn!(entity_type = %entity_type, error = %e, "Batch token replacement failed");
        }
    }
}

fn parent_for(
    entity_type: &EntityType,
    base: &Doc,
    parents: &HashMap<String, Doc>,
    config: &crate::builder::BuilderConfig,
) -> Option<Doc> {
    let spec = config.composites.get(entity_type.as_str())?;
    let parent_id = string_field(base, &spec.parent_id_column)?;
    parents.get(&parent_id).cloned()
}

fn row_id(row: &Doc) -> Option<String> {
    match row.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(row: &Doc, field: &str) -> Option<String> {
    match row.get(field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Effective scope for one row: explicit overrides win, then the entity's
/// organization derivation, then the row's own scoping columns.
fn effective_scope(
    row: &Doc,
    overrides: Option<&ScopeOverrides>,
    derivation: Option<&OrgDerivation>,
) -> Scope {
    let row_tenant = string_field(row, "tenant_id");
    let row_org = match derivation {
        Some(OrgDerivation::RowId) => row_id(row),
        None => string_field(row, "organization_id"),
    };

    let tenant_id = overrides
        .and_then(|o| o.tenant_id.clone())
        .or(row_tenant)
        .unwrap_or_default();
    let organization_id = overrides
        .and_then(|o| o.organization_id.clone())
        .or(row_org);

    Scope::new(tenant_id, organization_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_row(value: Value) -> Doc {
        doc_from_value(value).unwrap()
    }

    #[test]
    fn test_effective_scope_from_row_columns() {
        let row = base_row(json!({"id": "r1", "tenant_id": "t1", "organization_id": "o1"}));
        let scope = effective_scope(&row, None, None);
        assert_eq!(scope.tenant_id, "t1");
        assert_eq!(scope.organization_id.as_deref(), Some("o1"));
    }

    #[test]
    fn test_effective_scope_overrides_win() {
        let row = base_row(json!({"id": "r1", "tenant_id": "t1", "organization_id": "o1"}));
        let overrides = ScopeOverrides {
            tenant_id: Some("t2".to_string()),
            organization_id: Some("o2".to_string()),
        };
        let scope = effective_scope(&row, Some(&overrides), None);
        assert_eq!(scope.tenant_id, "t2");
        assert_eq!(scope.organization_id.as_deref(), Some("o2"));
    }

    #[test]
    fn test_effective_scope_row_id_derivation() {
        let row = base_row(json!({"id": "org-9", "tenant_id": "t1"}));
        let scope = effective_scope(&row, None, Some(&OrgDerivation::RowId));
        assert_eq!(scope.organization_id.as_deref(), Some("org-9"));
    }

    #[test]
    fn test_row_id_accepts_numbers() {
        let row = base_row(json!({"id": 42}));
        assert_eq!(row_id(&row).as_deref(), Some("42"));
    }
}
