//! Event names and payload contracts.
//!
//! All payloads are JSON objects with string keys; unknown keys are ignored
//! on deserialization. Events prefixed `query_index.` are owned by this
//! subsystem; `<module>.<entity>.<action>` events come from producers.

use crate::entity::EntityType;
use serde::{Deserialize, Serialize};

/// Upsert a single record into the index. Best-effort.
pub const UPSERT_ONE: &str = "query_index.upsert_one";
/// Remove a single record from the index. Best-effort.
pub const DELETE_ONE: &str = "query_index.delete_one";
/// Run a (possibly partitioned) reindex. Durable, at-least-once.
pub const REINDEX: &str = "query_index.reindex";
/// Soft-delete every index row in a scope. Durable, at-least-once.
pub const PURGE: &str = "query_index.purge";
/// Debounced coverage snapshot refresh. Best-effort.
pub const COVERAGE_REFRESH: &str = "query_index.coverage.refresh";
/// Fan out coverage refreshes for every registered entity. Best-effort.
pub const COVERAGE_WARMUP: &str = "query_index.coverage.warmup";
/// Forwarded to the external vector service. Best-effort.
pub const VECTORIZE_ONE: &str = "query_index.vectorize_one";
/// Forwarded to the external vector service. Best-effort.
pub const VECTORIZE_PURGE: &str = "query_index.vectorize_purge";

/// The CRUD action that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudAction {
    /// Record created.
    Created,
    /// Record updated.
    Updated,
    /// Record deleted.
    Deleted,
}

impl CrudAction {
    /// Parse the trailing segment of a `<module>.<entity>.<action>` event.
    #[must_use]
    pub fn from_event_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Payload of [`UPSERT_ONE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOnePayload {
    /// Entity type to index.
    pub entity_type: EntityType,
    /// Record primary key, stringified.
    pub record_id: String,
    /// Organization scope; `None` means global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Tenant scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Skip coverage delta accounting for this upsert.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub suppress_coverage: bool,
    /// Explicit base-count delta overriding the derived one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_base_delta: Option<i64>,
    /// Explicit index-count delta overriding the derived one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_index_delta: Option<i64>,
    /// Debounce delay for the follow-up coverage refresh, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_delay_ms: Option<u64>,
    /// CRUD action that triggered the upsert, when bridged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crud_action: Option<CrudAction>,
}

/// Payload of [`DELETE_ONE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOnePayload {
    /// Entity type to remove from the index.
    pub entity_type: EntityType,
    /// Record primary key, stringified.
    pub record_id: String,
    /// Organization scope; `None` means global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Tenant scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Payload of [`REINDEX`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexPayload {
    /// Entity type to reindex.
    pub entity_type: EntityType,
    /// Restrict to one tenant; `None` reindexes every tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Restrict to one organization; `None` covers all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Bypass the active-job preflight and allow physical resets.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
    /// Rows per scan chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    /// Number of hash partitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_count: Option<u32>,
    /// Partition this task is responsible for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_index: Option<u32>,
    /// Zero coverage snapshots before the pass.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reset_coverage: bool,
}

/// Payload of [`PURGE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgePayload {
    /// Entity type to purge.
    pub entity_type: EntityType,
    /// Organization scope; `None` means global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Tenant scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Payload of [`COVERAGE_REFRESH`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageRefreshPayload {
    /// Entity type whose snapshot should refresh.
    pub entity_type: EntityType,
    /// Tenant scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Organization scope; `None` means global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Count soft-deleted base rows too.
    #[serde(default)]
    pub with_deleted: bool,
    /// Debounce delay before the refresh runs, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

/// Payload of [`COVERAGE_WARMUP`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupPayload {
    /// Tenant to warm up; `None` warms the global scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Payload of [`VECTORIZE_ONE`], forwarded to the vector service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorizeOnePayload {
    /// Entity type of the record.
    pub entity_type: EntityType,
    /// Record primary key, stringified.
    pub record_id: String,
    /// Organization scope; `None` means global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Tenant scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_payload_round_trip() {
        let raw = json!({
            "entityType": "example:todo",
            "recordId": "r1",
            "organizationId": "o1",
            "tenantId": "t1",
            "suppressCoverage": true,
            "coverageIndexDelta": -1,
            "someFutureKey": "ignored"
        });
        let payload: UpsertOnePayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.entity_type.as_str(), "example:todo");
        assert_eq!(payload.record_id, "r1");
        assert!(payload.suppress_coverage);
        assert_eq!(payload.coverage_index_delta, Some(-1));
        assert_eq!(payload.coverage_base_delta, None);
    }

    #[test]
    fn test_reindex_payload_defaults() {
        let payload: ReindexPayload =
            serde_json::from_value(json!({"entityType": "example:todo"})).unwrap();
        assert!(!payload.force);
        assert!(!payload.reset_coverage);
        assert_eq!(payload.batch_size, None);
        assert_eq!(payload.partition_count, None);
    }

    #[test]
    fn test_crud_action_suffix() {
        assert_eq!(
            CrudAction::from_event_suffix("created"),
            Some(CrudAction::Created)
        );
        assert_eq!(CrudAction::from_event_suffix("upserted"), None);
    }

    #[test]
    fn test_serialized_keys_are_camel_case() {
        let payload = CoverageRefreshPayload {
            entity_type: EntityType::new("example:todo").unwrap(),
            tenant_id: Some("t1".to_string()),
            organization_id: None,
            with_deleted: false,
            delay_ms: Some(250),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("entityType").is_some());
        assert!(value.get("delayMs").is_some());
        assert!(value.get("organizationId").is_none());
    }
}
