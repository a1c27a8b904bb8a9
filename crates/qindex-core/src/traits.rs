//! Capability traits for external collaborators.
//!
//! The subsystem never resolves collaborators from a service locator; every
//! component takes the capabilities it needs as explicit constructor
//! parameters behind these traits.

use crate::doc::Doc;
use crate::entity::{EntityType, RecordId, Scope};
use crate::error::QindexResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

/// A handler invoked by the event bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one delivery of `event` with `payload`.
    ///
    /// Handlers for durable events may return an error to request
    /// redelivery; handlers for best-effort events must swallow failures
    /// after recording them.
    async fn handle(&self, event: &str, payload: Value) -> QindexResult<()>;
}

/// The minimal event-bus surface the subsystem consumes.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Emit an event. `persistent` selects at-least-once delivery with
    /// retries; non-persistent events are best-effort fire-and-forget.
    async fn emit(&self, event: &str, payload: Value, persistent: bool) -> QindexResult<()>;

    /// Register a handler for an event name.
    fn on(&self, event: &str, handler: Arc<dyn EventHandler>);
}

/// Entity/table-name registration, owned by the host application.
pub trait EntityRegistry: Send + Sync {
    /// Resolve the base table owning an entity's rows.
    fn table_name(&self, entity_type: &EntityType) -> Option<String>;

    /// All registered entity types, in registration order.
    fn entity_types(&self) -> Vec<EntityType>;

    /// Whether the entity's rows live in the shared custom-entity storage
    /// table instead of a dedicated base table.
    fn is_custom_entity(&self, entity_type: &EntityType) -> bool;

    /// Human-readable label for status reports.
    fn label(&self, entity_type: &EntityType) -> String;
}

/// The minimal coverage/count interface of the vector-embedding subsystem.
#[async_trait]
pub trait VectorService: Send + Sync {
    /// Number of vector-indexed records for a scope.
    async fn indexed_count(&self, entity_type: &EntityType, scope: &Scope) -> QindexResult<i64>;

    /// Remove vector entries whose index row was not touched since
    /// `older_than`. Returns the number removed.
    async fn remove_orphans(
        &self,
        entity_type: &EntityType,
        scope: &Scope,
        older_than: DateTime<Utc>,
    ) -> QindexResult<u64>;
}

/// Opaque per-document encrypt/decrypt hooks.
///
/// Failures are swallowed by callers: indexing stays available when the
/// encryption service is down, at a documented loss of search precision.
#[async_trait]
pub trait DocCipher: Send + Sync {
    /// Encrypt a finished document before storage; returns the replacement.
    async fn encrypt_doc(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        doc: Doc,
    ) -> QindexResult<Doc>;

    /// Decrypt a stored document for token extraction.
    async fn decrypt_doc(
        &self,
        entity_type: &EntityType,
        record_id: &RecordId,
        doc: Doc,
    ) -> QindexResult<Doc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCipher;

    #[async_trait]
    impl DocCipher for NoopCipher {
        async fn encrypt_doc(
            &self,
            _entity_type: &EntityType,
            _record_id: &RecordId,
            doc: Doc,
        ) -> QindexResult<Doc> {
            Ok(doc)
        }

        async fn decrypt_doc(
            &self,
            _entity_type: &EntityType,
            _record_id: &RecordId,
            doc: Doc,
        ) -> QindexResult<Doc> {
            Ok(doc)
        }
    }

    #[tokio::test]
    async fn test_cipher_object_safety() {
        let cipher: Arc<dyn DocCipher> = Arc::new(NoopCipher);
        let et = EntityType::new("example:todo").unwrap();
        let doc = Doc::new();
        let out = cipher
            .encrypt_doc(&et, &RecordId::new("r1"), doc)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
