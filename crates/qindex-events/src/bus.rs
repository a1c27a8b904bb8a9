//! In-process event bus.
//!
//! Implements the [`EventBus`] capability for single-process workers and
//! tests. Handlers run in spawned tasks; events emitted as persistent are
//! redelivered with bounded backoff while a handler keeps failing with a
//! retryable error. The durable production bus lives outside this
//! subsystem.

use async_trait::async_trait;
use dashmap::DashMap;
use qindex_core::{EventBus, EventHandler, QindexResult};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Subscription key receiving every event.
pub const ANY_EVENT: &str = "*";

const MAX_DELIVERIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Dispatches events to registered handlers inside the process.
#[derive(Default)]
pub struct InProcessBus {
    handlers: DashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl InProcessBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers_for(&self, event: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut matched: Vec<Arc<dyn EventHandler>> = Vec::new();
        if let Some(exact) = self.handlers.get(event) {
            matched.extend(exact.iter().cloned());
        }
        if let Some(any) = self.handlers.get(ANY_EVENT) {
            matched.extend(any.iter().cloned());
        }
        matched
    }

    async fn deliver(
        handler: Arc<dyn EventHandler>,
        event: String,
        payload: Value,
        persistent: bool,
    ) {
        let max = if persistent { MAX_DELIVERIES } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match handler.handle(&event, payload.clone()).await {
                Ok(()) => return,
                Err(e) if persistent && e.is_retryable() && attempt < max => {
                    let delay = RETRY_BASE_DELAY * 2_u32.saturating_pow(attempt - 1);
                    warn!(event = %event, attempt, error = %e, "Handler failed, redelivering");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(event = %event, attempt, error = %e, "Handler failed, dropping event");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn emit(&self, event: &str, payload: Value, persistent: bool) -> QindexResult<()> {
        let matched = self.handlers_for(event);
        if matched.is_empty() {
            debug!(event, "No handlers registered");
            return Ok(());
        }

        for handler in matched {
            tokio::spawn(Self::deliver(
                handler,
                event.to_string(),
                payload.clone(),
                persistent,
            ));
        }
        Ok(())
    }

    fn on(&self, event: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qindex_core::QindexError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _event: &str, _payload: Value) -> QindexResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(QindexError::database("transient"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_reaches_exact_and_catch_all() {
        let bus = InProcessBus::new();
        let exact = Arc::new(Counter {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let any = Arc::new(Counter {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        bus.on("query_index.upsert_one", exact.clone());
        bus.on(ANY_EVENT, any.clone());

        bus.emit("query_index.upsert_one", json!({}), false)
            .await
            .unwrap();
        bus.emit("example.todo.created", json!({}), false)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(exact.calls.load(Ordering::SeqCst), 1);
        assert_eq!(any.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_events_are_redelivered() {
        let bus = InProcessBus::new();
        let handler = Arc::new(Counter {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        bus.on("query_index.reindex", handler.clone());

        bus.emit("query_index.reindex", json!({}), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_events_are_not_redelivered() {
        let bus = InProcessBus::new();
        let handler = Arc::new(Counter {
            calls: AtomicU32::new(0),
            fail_first: 5,
        });
        bus.on("query_index.vectorize_one", handler.clone());

        bus.emit("query_index.vectorize_one", json!({}), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
