//! Event contracts and in-process bus dispatch.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use qindex_core::{events, EventBus, EventHandler, QindexResult, ReindexPayload, UpsertOnePayload};
use qindex_events::{InProcessBus, ANY_EVENT};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Recorder {
    calls: AtomicU32,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, _event: &str, _payload: Value) -> QindexResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn crud_events_reach_the_catch_all_subscriber() {
    let bus = InProcessBus::new();
    let bridge = Arc::new(Recorder {
        calls: AtomicU32::new(0),
    });
    bus.on(ANY_EVENT, bridge.clone());

    bus.emit("example.todo.created", json!({"id": "r1"}), false)
        .await
        .unwrap();
    bus.emit("example.todo.updated", json!({"id": "r1"}), false)
        .await
        .unwrap();
    bus.emit(events::UPSERT_ONE, json!({}), false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    // The catch-all sees every event, including internal ones.
    assert_eq!(bridge.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn upsert_payload_contract_ignores_unknown_keys() {
    let payload: UpsertOnePayload = serde_json::from_value(json!({
        "entityType": "example:todo",
        "recordId": "r1",
        "organizationId": "o1",
        "tenantId": "t1",
        "crudAction": "created",
        "futureFlag": true
    }))
    .unwrap();

    assert_eq!(payload.entity_type.as_str(), "example:todo");
    assert_eq!(payload.crud_action, Some(qindex_core::CrudAction::Created));
    assert!(!payload.suppress_coverage);
}

#[test]
fn reindex_payload_contract_round_trips() {
    let payload = ReindexPayload {
        entity_type: qindex_core::EntityType::new("example:todo").unwrap(),
        tenant_id: Some("t1".to_string()),
        organization_id: None,
        force: true,
        batch_size: Some(100),
        partition_count: Some(2),
        partition_index: Some(1),
        reset_coverage: true,
    };

    let value = serde_json::to_value(&payload).unwrap();
    assert_eq!(value.get("entityType"), Some(&json!("example:todo")));
    assert_eq!(value.get("partitionCount"), Some(&json!(2)));
    assert_eq!(value.get("organizationId"), None);

    let back: ReindexPayload = serde_json::from_value(value).unwrap();
    assert_eq!(back.partition_index, Some(1));
    assert!(back.force);
    assert!(back.reset_coverage);
}
