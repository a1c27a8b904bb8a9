//! Single-record index maintenance.
//!
//! The indexer owns the `entity_indexes` write path for one record at a
//! time: build the document, upsert (or remove) the row, then refresh the
//! record's search tokens. Transition flags are returned so the coverage
//! accountant can derive deltas without re-reading the row.

use crate::builder::DocumentBuilder;
use crate::error::Result;
use crate::tokens::TokenExtractor;
use qindex_core::doc::Doc;
use qindex_core::{DeleteOutcome, DocCipher, EntityType, RecordId, Scope, UpsertOutcome};
use qindex_migrations::IndexPool;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, warn};

struct PriorState {
    existed: bool,
    was_deleted: bool,
}

/// Writes one index row at a time.
pub struct Indexer {
    pool: IndexPool,
    builder: Arc<DocumentBuilder>,
    tokens: Arc<TokenExtractor>,
    cipher: Option<Arc<dyn DocCipher>>,
}

impl Indexer {
    /// Create an indexer over the shared pool.
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

    /// The document builder used by this indexer.
    #[must_use]
    pub fn builder(&self) -> &Arc<DocumentBuilder> {
        &self.builder
    }

    /// Build and upsert the index row for one record.
    ///
    /// When the base row is missing, any stale index row and its tokens
    /// are removed instead.
    pub async fn upsert(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<UpsertOutcome> {
        let prior = self.prior_state(entity_type, record_id, scope).await?;

        let Some(doc) = self.builder.build(entity_type, record_id, scope).await? else {
            self.remove_row(entity_type, record_id, scope).await?;
            self.replace_tokens(entity_type, record_id, scope, &Doc::new())
                .await;
            return Ok(UpsertOutcome::removed(prior.existed, prior.was_deleted));
        };

        let stored_doc = self.apply_encrypt(entity_type, record_id, doc).await;
        self.upsert_row(entity_type, record_id, scope, &stored_doc)
            .await?;

        let token_doc = self.apply_decrypt(entity_type, record_id, stored_doc).await;
        self.replace_tokens(entity_type, record_id, scope, &token_doc)
            .await;

        Ok(UpsertOutcome {
            existed: prior.existed,
            was_deleted: prior.was_deleted,
            created: !prior.existed,
            revived: prior.existed && prior.was_deleted,
        })
    }

    /// Physically remove the index row and its tokens.
    ///
    /// Returns whether an active row was removed, so the accountant can
    /// decide whether the indexed count decreases.
    pub async fn mark_deleted(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<DeleteOutcome> {
        let row = sqlx::query(
            "DELETE FROM entity_indexes
             WHERE entity_type = $1 AND record_id = $2
               AND organization_id IS NOT DISTINCT FROM $3
             RETURNING deleted_at",
        )
        .bind(entity_type.as_str())
        .bind(record_id.as_str())
        .bind(scope.organization_id.as_deref())
        .fetch_optional(self.pool.inner())
        .await?;

        let was_active = match row {
            Some(row) => row
                .get::<Option<chrono::DateTime<chrono::Utc>>, _>("deleted_at")
                .is_none(),
            None => false,
        };

        self.replace_tokens(entity_type, record_id, scope, &Doc::new())
            .await;

        Ok(DeleteOutcome { was_active })
    }

    async fn prior_state(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<PriorState> {
        let row = sqlx::query(
            "SELECT deleted_at FROM entity_indexes
             WHERE entity_type = $1 AND record_id = $2
               AND organization_id IS NOT DISTINCT FROM $3",
        )
        .bind(entity_type.as_str())
        .bind(record_id.as_str())
        .bind(scope.organization_id.as_deref())
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(match row {
            Some(row) => PriorState {
                existed: true,
                was_deleted: row
                    .get::<Option<chrono::DateTime<chrono::Utc>>, _>("deleted_at")
                    .is_some(),
            },
            None => PriorState {
                existed: false,
                was_deleted: false,
            },
        })
    }

    async fn upsert_row(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
        doc: &Doc,
    ) -> Result<()> {
        let doc_value = serde_json::Value::Object(doc.clone());

        let result = sqlx::query(
            "INSERT INTO entity_indexes
                 (entity_type, record_id, organization_id, tenant_id, doc)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (entity_type, record_id, organization_id_coalesced)
             DO UPDATE SET
                 doc = EXCLUDED.doc,
                 tenant_id = EXCLUDED.tenant_id,
                 index_version = entity_indexes.index_version + 1,
                 updated_at = NOW(),
                 deleted_at = NULL",
        )
        .bind(entity_type.as_str())
        .bind(record_id.as_str())
        .bind(scope.organization_id.as_deref())
        .bind(&scope.tenant_id)
        .bind(&doc_value)
        .execute(self.pool.inner())
        .await;

        match result {
            Ok(_) => Ok(()),
            // The coalesced unique index may not exist yet on a freshly
            // provisioned database; converge via update-then-insert.
            Err(e) if is_missing_conflict_target(&e) => {
                debug!(entity_type = %entity_type, "Upsert conflict target missing, using fallback");
                self.update_or_insert(entity_type, record_id, scope, &doc_value)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_or_insert(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
        doc_value: &serde_json::Value,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE entity_indexes
             SET doc = $4, tenant_id = $5, index_version = index_version + 1,
                 updated_at = NOW(), deleted_at = NULL
             WHERE entity_type = $1 AND record_id = $2
               AND organization_id IS NOT DISTINCT FROM $3",
        )
        .bind(entity_type.as_str())
        .bind(record_id.as_str())
        .bind(scope.organization_id.as_deref())
        .bind(doc_value)
        .bind(&scope.tenant_id)
        .execute(self.pool.inner())
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let inserted = sqlx::query(
            "INSERT INTO entity_indexes
                 (entity_type, record_id, organization_id, tenant_id, doc)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entity_type.as_str())
        .bind(record_id.as_str())
        .bind(scope.organization_id.as_deref())
        .bind(&scope.tenant_id)
        .bind(doc_value)
        .execute(self.pool.inner())
        .await;

        match inserted {
            Ok(_) => Ok(()),
            // A concurrent insert won the race; the row is there.
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_row(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM entity_indexes
             WHERE entity_type = $1 AND record_id = $2
               AND organization_id IS NOT DISTINCT FROM $3",
        )
        .bind(entity_type.as_str())
        .bind(record_id.as_str())
        .bind(scope.organization_id.as_deref())
        .execute(self.pool.inner())
        .await?;
        Ok(())
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
                // Indexing stays available when the encryption service is
                // down; the plaintext document is stored.
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

    async fn apply_decrypt(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        doc: Doc,
    ) -> Doc {
        let Some(cipher) = &self.cipher else {
            return doc;
        };
        match cipher
            .decrypt_doc(entity_type, record_id, doc.clone())
            .await
        {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    record_id = %record_id,
                    error = %e,
                    "Decrypt hook failed, extracting tokens from stored values"
                );
                doc
            }
        }
    }

    async fn replace_tokens(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        scope: &Scope,
        doc: &Doc,
    ) {
        if let Err(e) = self
            .tokens
            .replace_for_record(entity_type, record_id, scope, doc)
            .await
        {
            warn!(
                entity_type = %entity_type,
                record_id = %record_id,
                error = %e,
                "Search-token replacement failed"
            );
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

pub(crate) fn is_missing_conflict_target(err: &sqlx::Error) -> bool {
    // 42P10: invalid column reference / no matching unique index for the
    // ON CONFLICT specification.
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42P10")
    )
}
