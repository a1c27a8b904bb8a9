//! Debounced coverage refresh behavior under paused time.

use async_trait::async_trait;
use qindex_core::{EntityType, EventHandler, QindexResult, Scope};
use qindex_events::{CoverageRefreshDebouncer, CoverageRefresher};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountingRefresher {
    calls: AtomicU32,
}

#[async_trait]
impl CoverageRefresher for CountingRefresher {
    async fn refresh(&self, _entity_type: &EntityType, _scope: &Scope) -> QindexResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn three_requests_within_the_window_run_once() {
    let refresher = Arc::new(CountingRefresher {
        calls: AtomicU32::new(0),
    });
    let debouncer = CoverageRefreshDebouncer::new(refresher.clone());

    // Three requests for the same scope inside 100 ms.
    for _ in 0..3 {
        debouncer
            .handle(
                "query_index.coverage.refresh",
                json!({
                    "entityType": "example:todo",
                    "tenantId": "t1",
                    "organizationId": "o1",
                    "delayMs": 150,
                }),
            )
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn a_late_request_runs_separately() {
    let refresher = Arc::new(CountingRefresher {
        calls: AtomicU32::new(0),
    });
    let debouncer = CoverageRefreshDebouncer::new(refresher.clone());

    let payload = json!({
        "entityType": "example:todo",
        "tenantId": "t1",
        "delayMs": 50,
    });

    debouncer
        .handle("query_index.coverage.refresh", payload.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    debouncer
        .handle("query_index.coverage.refresh", payload)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn with_deleted_scopes_debounce_independently() {
    let refresher = Arc::new(CountingRefresher {
        calls: AtomicU32::new(0),
    });
    let debouncer = CoverageRefreshDebouncer::new(refresher.clone());

    for with_deleted in [false, true] {
        debouncer
            .handle(
                "query_index.coverage.refresh",
                json!({
                    "entityType": "example:todo",
                    "tenantId": "t1",
                    "withDeleted": with_deleted,
                    "delayMs": 50,
                }),
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
}
