//! Search-token extraction and replacement.
//!
//! Tokens are derived from string-valued document fields and written to
//! `search_tokens`. Replacement is per `(record, field)`: only fields that
//! appear in the new document are replaced, so a partial document update
//! cannot erase tokens for untouched fields.

use crate::error::Result;
use qindex_core::doc::{is_tokenizable, Doc};
use qindex_core::{EntityType, RecordId, Scope};
use qindex_migrations::IndexPool;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

/// Field names never tokenized regardless of value shape.
const RESERVED_FIELDS: [&str; 6] = [
    "id",
    "tenant_id",
    "organization_id",
    "created_at",
    "updated_at",
    "deleted_at",
];

/// One token derived from a document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRow {
    /// Source field name.
    pub field: String,
    /// Lowercased token text.
    pub token: String,
    /// Hex SHA-256 of the token text.
    pub token_hash: String,
}

/// Extracts and persists search tokens.
pub struct TokenExtractor {
    pool: IndexPool,
    store_raw: bool,
    blocklist: Vec<String>,
}

impl TokenExtractor {
    /// Create an extractor over the shared pool.
    #[must_use]
    pub fn new(pool: IndexPool, store_raw: bool, blocklist: Vec<String>) -> Self {
        Self {
            pool,
            store_raw,
            blocklist: blocklist
                .into_iter()
                .map(|f| f.to_lowercase())
                .collect(),
        }
    }

    /// Derive the token rows for a document. Duplicate `(field, hash)`
    /// pairs are dropped.
    #[must_use]
    pub fn extract(&self, doc: &Doc) -> Vec<TokenRow> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut rows = Vec::new();

        for (field, value) in doc {
            if !self.field_included(field) || !is_tokenizable(value) {
                continue;
            }
            for text in string_values(value) {
                for token in tokenize(text) {
                    let token_hash = hash_token(&token);
                    if seen.insert((field.clone(), token_hash.clone())) {
                        rows.push(TokenRow {
                            field: field.clone(),
                            token,
                            token_hash,
                        });
                    }
                }
            }
        }

        rows
    }

    /// Replace the tokens of one record inside a single transaction.
    ///
    /// Only `(record, field)` pairs present in `doc` are replaced; an
    /// empty document deletes every token of the record at the scope.
    pub async fn replace_for_record(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
        doc: &Doc,
    ) -> Result<()> {
        let mut tx = self.pool.inner().begin().await?;
        self.replace_in_tx(&mut tx, entity_type, record_id, scope, doc)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace tokens for many records inside one transaction.
    pub async fn replace_for_batch(
        &self,
        entity_type: &EntityType,
        records: &[(RecordId, Scope, Doc)],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.inner().begin().await?;
        for (record_id, scope, doc) in records {
            self.replace_in_tx(&mut tx, entity_type, record_id, scope, doc)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
        doc: &Doc,
    ) -> Result<()> {
        let rows = self.extract(doc);

        if doc.is_empty() {
            sqlx::query(
                "DELETE FROM search_tokens
                 WHERE entity_type = $1 AND record_id = $2
                   AND organization_id IS NOT DISTINCT FROM $3
                   AND tenant_id IS NOT DISTINCT FROM $4",
            )
            .bind(entity_type.as_str())
            .bind(record_id.as_str())
            .bind(scope.organization_id.as_deref())
            .bind(&scope.tenant_id)
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }

        let fields: Vec<String> = doc.keys().cloned().collect();
        sqlx::query(
            "DELETE FROM search_tokens
             WHERE entity_type = $1 AND record_id = $2
               AND field = ANY($3)
               AND organization_id IS NOT DISTINCT FROM $4
               AND tenant_id IS NOT DISTINCT FROM $5",
        )
        .bind(entity_type.as_str())
        .bind(record_id.as_str())
        .bind(&fields)
        .bind(scope.organization_id.as_deref())
        .bind(&scope.tenant_id)
        .execute(&mut **tx)
        .await?;

        if rows.is_empty() {
            return Ok(());
        }

        debug!(
            entity_type = %entity_type,
            record_id = %record_id,
            tokens = rows.len(),
            "Replacing search tokens"
        );

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO search_tokens (entity_type, record_id, field, token_hash, token, organization_id, tenant_id) ",
        );
        builder.push_values(&rows, |mut b, row| {
            b.push_bind(entity_type.as_str())
                .push_bind(record_id.as_str())
                .push_bind(&row.field)
                .push_bind(&row.token_hash)
                .push_bind(self.store_raw.then(|| row.token.clone()))
                .push_bind(scope.organization_id.as_deref())
                .push_bind(&scope.tenant_id);
        });
        builder.push(" ON CONFLICT DO NOTHING");
        builder.build().execute(&mut **tx).await?;

        Ok(())
    }

    fn field_included(&self, field: &str) -> bool {
        let lowered = field.to_lowercase();
        if RESERVED_FIELDS.contains(&lowered.as_str()) {
            return false;
        }
        if lowered.ends_with("_id") || lowered.ends_with("_at") {
            return false;
        }
        !self.blocklist.contains(&lowered)
    }
}

/// Lowercase and split on non-alphanumeric boundaries.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Hex SHA-256 of a token.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn string_values(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qindex_core::doc::doc_from_value;
    use serde_json::json;

    fn extractor() -> TokenExtractor {
        // Tests only exercise the pure extraction path; the pool is never
        // touched, so a lazy unconnected pool is enough.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/qindex_test")
            .unwrap();
        TokenExtractor::new(
            qindex_migrations::IndexPool::from_pg_pool(pool),
            true,
            vec!["internal_notes".to_string()],
        )
    }

    #[test]
    fn test_tokenize_splits_and_lowercases() {
        assert_eq!(tokenize("Hello, World-42"), vec!["hello", "world", "42"]);
        assert!(tokenize("---").is_empty());
    }

    #[tokio::test]
    async fn test_extract_field_rules() {
        let doc = doc_from_value(json!({
            "id": "r1",
            "tenant_id": "t1",
            "customer_id": "c9",
            "created_at": "2024-06-01",
            "title": "Red Bicycle",
            "internal_notes": "secret",
            "labels": ["Fast", "fast", "red"],
            "count": 42
        }))
        .unwrap();

        let rows = extractor().extract(&doc);
        let fields: HashSet<&str> = rows.iter().map(|r| r.field.as_str()).collect();

        assert_eq!(fields, HashSet::from(["title", "labels"]));

        // "fast" appears twice under labels but is stored once.
        let label_tokens: Vec<&str> = rows
            .iter()
            .filter(|r| r.field == "labels")
            .map(|r| r.token.as_str())
            .collect();
        assert_eq!(label_tokens, vec!["fast", "red"]);
    }

    #[tokio::test]
    async fn test_extract_dedupes_within_field_only() {
        let doc = doc_from_value(json!({"title": "red", "summary": "red"})).unwrap();
        let rows = extractor().extract(&doc);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].token_hash, rows[1].token_hash);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_token("red"), hash_token("red"));
        assert_ne!(hash_token("red"), hash_token("blue"));
        assert_eq!(hash_token("red").len(), 64);
    }
}
