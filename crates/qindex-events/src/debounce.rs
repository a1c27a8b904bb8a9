//! Debounced coverage refresh.
//!
//! Bursts of `query_index.coverage.refresh` events for the same scope
//! collapse into a single snapshot refresh: every event re-arms the
//! scope's timer, and only the last timer fires.

use async_trait::async_trait;
use dashmap::DashMap;
use qindex_core::{
    CoverageRefreshPayload, EntityType, EventHandler, QindexResult, Scope,
};
use qindex_coverage::CoverageAccountant;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// The refresh operation behind the debouncer, abstracted for tests.
#[async_trait]
pub trait CoverageRefresher: Send + Sync {
    /// Refresh one scope's snapshot.
    async fn refresh(&self, entity_type: &EntityType, scope: &Scope) -> QindexResult<()>;
}

/// Production refresher delegating to the accountant.
pub struct AccountantRefresher {
    accountant: Arc<CoverageAccountant>,
}

impl AccountantRefresher {
    /// Wrap the accountant.
    #[must_use]
    pub fn new(accountant: Arc<CoverageAccountant>) -> Self {
        Self { accountant }
    }
}

#[async_trait]
impl CoverageRefresher for AccountantRefresher {
    async fn refresh(&self, entity_type: &EntityType, scope: &Scope) -> QindexResult<()> {
        self.accountant
            .refresh_snapshot(entity_type, scope, None)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }
}

/// Handles [`qindex_core::events::COVERAGE_REFRESH`] with per-scope
/// debouncing.
pub struct CoverageRefreshDebouncer {
    refresher: Arc<dyn CoverageRefresher>,
    timers: Arc<DashMap<String, JoinHandle<()>>>,
}

impl CoverageRefreshDebouncer {
    /// Create a debouncer.
    #[must_use]
    pub fn new(refresher: Arc<dyn CoverageRefresher>) -> Self {
        Self {
            refresher,
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Pending timers, for observability.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

#[async_trait]
impl EventHandler for CoverageRefreshDebouncer {
    async fn handle(&self, _event: &str, payload: Value) -> QindexResult<()> {
        let payload: CoverageRefreshPayload = serde_json::from_value(payload)?;
        let scope = Scope::new(
            payload.tenant_id.clone().unwrap_or_default(),
            payload.organization_id.clone(),
        )
        .with_deleted(payload.with_deleted);
        let key = scope.cache_key(&payload.entity_type);
        let delay = Duration::from_millis(payload.delay_ms.unwrap_or(0));

        let refresher = Arc::clone(&self.refresher);
        let timers = Arc::clone(&self.timers);
        let entity_type = payload.entity_type.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.remove(&task_key);
            if let Err(e) = refresher.refresh(&entity_type, &scope).await {
                warn!(entity_type = %entity_type, error = %e, "Debounced refresh failed");
            }
        });

        // Re-arm: the previous timer for this scope never fires.
        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

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

    fn payload(delay_ms: u64) -> Value {
        json!({
            "entityType": "example:todo",
            "tenantId": "t1",
            "organizationId": "o1",
            "delayMs": delay_ms,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_refresh() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
        });
        let debouncer = CoverageRefreshDebouncer::new(refresher.clone());

        for _ in 0..3 {
            debouncer.handle("query_index.coverage.refresh", payload(100)).await.unwrap();
            tokio::time::advance(Duration::from_millis(30)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_scopes_refresh_independently() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
        });
        let debouncer = CoverageRefreshDebouncer::new(refresher.clone());

        debouncer.handle("query_index.coverage.refresh", payload(50)).await.unwrap();
        debouncer
            .handle(
                "query_index.coverage.refresh",
                json!({"entityType": "example:note", "tenantId": "t1", "delayMs": 50}),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_fires_immediately() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
        });
        let debouncer = CoverageRefreshDebouncer::new(refresher.clone());

        debouncer.handle("query_index.coverage.refresh", payload(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }
}
