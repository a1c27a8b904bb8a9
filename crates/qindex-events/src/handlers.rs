//! Handlers behind the `query_index.*` events.
//!
//! Each handler is a short-lived unit of work. Handlers for durable
//! events propagate retryable failures so the bus can redeliver;
//! best-effort handlers record failures and let the bus drop the event.

use async_trait::async_trait;
use qindex_core::{
    events, DeleteOnePayload, EntityRegistry, EventBus, EventHandler, PurgePayload, QindexError,
    QindexResult, RecordId, ReindexPayload, Scope, UpsertOnePayload, WarmupPayload,
};
use qindex_config::QindexConfig;
use qindex_core::entity::PartitionSpec;
use qindex_coverage::{CoverageAccountant, CoverageAdjustment};
use qindex_indexer::Indexer;
use qindex_telemetry::{DiagEntry, DiagStore};
use qindex_worker::{Purger, ReindexOptions, Reindexer};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Handles [`events::UPSERT_ONE`].
pub struct UpsertOneHandler {
    indexer: Arc<Indexer>,
    accountant: Arc<CoverageAccountant>,
    bus: Arc<dyn EventBus>,
}

impl UpsertOneHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        indexer: Arc<Indexer>,
        accountant: Arc<CoverageAccountant>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            indexer,
            accountant,
            bus,
        }
    }
}

#[async_trait]
impl EventHandler for UpsertOneHandler {
    async fn handle(&self, _event: &str, payload: Value) -> QindexResult<()> {
        let payload: UpsertOnePayload = serde_json::from_value(payload)?;
        let scope = Scope::new(
            payload.tenant_id.clone().unwrap_or_default(),
            payload.organization_id.clone(),
        );
        let record_id = RecordId::new(payload.record_id.clone());

        let outcome = self
            .indexer
            .upsert(&payload.entity_type, &record_id, &scope)
            .await
            .map_err(QindexError::from)?;

        if !payload.suppress_coverage {
            let base_delta = payload.coverage_base_delta.unwrap_or(match payload.crud_action {
                Some(qindex_core::CrudAction::Created) => 1,
                Some(qindex_core::CrudAction::Deleted) => -1,
                _ => 0,
            });
            let index_delta = payload
                .coverage_index_delta
                .unwrap_or_else(|| outcome.index_delta());

            self.accountant
                .apply_adjustments(vec![CoverageAdjustment {
                    entity_type: payload.entity_type.clone(),
                    scope: scope.clone(),
                    delta_base: base_delta,
                    delta_index: index_delta,
                    delta_vector: 0,
                }])
                .await
                .map_err(QindexError::from)?;

            if let Some(delay_ms) = payload.coverage_delay_ms {
                let refresh = json!({
                    "entityType": payload.entity_type.as_str(),
                    "tenantId": scope.tenant_id,
                    "organizationId": scope.organization_id,
                    "delayMs": delay_ms,
                });
                if let Err(e) = self.bus.emit(events::COVERAGE_REFRESH, refresh, false).await {
                    warn!(error = %e, "Coverage refresh scheduling failed");
                }
            }
        }

        let vectorize = json!({
            "entityType": payload.entity_type.as_str(),
            "recordId": payload.record_id,
            "tenantId": scope.tenant_id,
            "organizationId": scope.organization_id,
        });
        if let Err(e) = self.bus.emit(events::VECTORIZE_ONE, vectorize, false).await {
            debug!(error = %e, "Vectorize emit failed");
        }

        Ok(())
    }
}

/// Handles [`events::DELETE_ONE`].
pub struct DeleteOneHandler {
    indexer: Arc<Indexer>,
    accountant: Arc<CoverageAccountant>,
}

impl DeleteOneHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(indexer: Arc<Indexer>, accountant: Arc<CoverageAccountant>) -> Self {
        Self {
            indexer,
            accountant,
        }
    }
}

#[async_trait]
impl EventHandler for DeleteOneHandler {
    async fn handle(&self, _event: &str, payload: Value) -> QindexResult<()> {
        let payload: DeleteOnePayload = serde_json::from_value(payload)?;
        let scope = Scope::new(
            payload.tenant_id.clone().unwrap_or_default(),
            payload.organization_id.clone(),
        );
        let record_id = RecordId::new(payload.record_id.clone());

        let outcome = self
            .indexer
            .mark_deleted(&payload.entity_type, &record_id, &scope)
            .await
            .map_err(QindexError::from)?;

        // Only removing an active row shrinks the indexed count; the base
        // count converges on the next refresh.
        if outcome.was_active {
            self.accountant
                .apply_adjustments(vec![CoverageAdjustment {
                    entity_type: payload.entity_type,
                    scope,
                    delta_base: 0,
                    delta_index: -1,
                    delta_vector: 0,
                }])
                .await
                .map_err(QindexError::from)?;
        }

        Ok(())
    }
}

/// Handles [`events::REINDEX`]. Durable: failures propagate for
/// redelivery.
pub struct ReindexHandler {
    reindexer: Arc<Reindexer>,
    config: QindexConfig,
    vectorize: bool,
}

impl ReindexHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(reindexer: Arc<Reindexer>, config: QindexConfig, vectorize: bool) -> Self {
        Self {
            reindexer,
            config,
            vectorize,
        }
    }

    fn options_for(
        &self,
        payload: &ReindexPayload,
        partition: Option<PartitionSpec>,
    ) -> ReindexOptions {
        ReindexOptions {
            tenant_id: payload.tenant_id.clone(),
            organization_id: payload.organization_id.clone(),
            force: payload.force,
            batch_size: payload.batch_size.unwrap_or(self.config.reindex_batch_size),
            partition,
            reset_coverage: payload.reset_coverage,
            vectorize: self.vectorize,
            on_progress: None,
        }
    }
}

#[async_trait]
impl EventHandler for ReindexHandler {
    async fn handle(&self, _event: &str, payload: Value) -> QindexResult<()> {
        let payload: ReindexPayload = serde_json::from_value(payload)?;

        match (payload.partition_count, payload.partition_index) {
            // Pinned partition: run exactly that slice.
            (Some(count), Some(index)) => {
                let partition = PartitionSpec::new(count, index)?;
                self.reindexer
                    .reindex(
                        &payload.entity_type,
                        &self.options_for(&payload, Some(partition)),
                        None,
                    )
                    .await
                    .map_err(QindexError::from)?;
            }
            // Partition count without an index: fan out one task per
            // partition and await the group.
            (Some(count), None) if count > 1 => {
                let mut tasks: JoinSet<QindexResult<()>> = JoinSet::new();
                for index in 0..count {
                    let partition = PartitionSpec::new(count, index)?;
                    let reindexer = Arc::clone(&self.reindexer);
                    let entity_type = payload.entity_type.clone();
                    let options = self.options_for(&payload, Some(partition));
                    tasks.spawn(async move {
                        reindexer
                            .reindex(&entity_type, &options, None)
                            .await
                            .map_err(QindexError::from)?;
                        Ok(())
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    joined.map_err(|e| QindexError::bus(e.to_string()))??;
                }
            }
            _ => {
                self.reindexer
                    .reindex(&payload.entity_type, &self.options_for(&payload, None), None)
                    .await
                    .map_err(QindexError::from)?;
            }
        }

        Ok(())
    }
}

/// Handles [`events::PURGE`]. Durable: failures propagate for redelivery.
pub struct PurgeHandler {
    purger: Arc<Purger>,
    accountant: Arc<CoverageAccountant>,
    diag: DiagStore,
}

impl PurgeHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(purger: Arc<Purger>, accountant: Arc<CoverageAccountant>, diag: DiagStore) -> Self {
        Self {
            purger,
            accountant,
            diag,
        }
    }
}

#[async_trait]
impl EventHandler for PurgeHandler {
    async fn handle(&self, _event: &str, payload: Value) -> QindexResult<()> {
        let payload: PurgePayload = serde_json::from_value(payload)?;

        self.diag
            .record_status(
                DiagEntry::new("purger", events::PURGE, "purge started")
                    .with_detail(json!({"entityType": payload.entity_type.as_str()})),
            )
            .await;

        let result = self
            .purger
            .purge(
                &payload.entity_type,
                payload.organization_id.as_deref(),
                payload.tenant_id.as_deref(),
            )
            .await;

        match result {
            Ok(outcome) => {
                if let Some(tenant_id) = &payload.tenant_id {
                    let scope =
                        Scope::new(tenant_id.clone(), payload.organization_id.clone());
                    if let Err(e) = self
                        .accountant
                        .refresh_snapshot(&payload.entity_type, &scope, None)
                        .await
                    {
                        warn!(error = %e, "Post-purge coverage refresh failed");
                    }
                }
                self.diag
                    .record_status(
                        DiagEntry::new("purger", events::PURGE, "purge completed").with_detail(
                            json!({
                                "entityType": payload.entity_type.as_str(),
                                "purged": outcome.purged,
                            }),
                        ),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(entity_type = %payload.entity_type, error = %e, "Purge failed");
                self.diag
                    .record_error(
                        DiagEntry::new("purger", events::PURGE, e.to_string())
                            .with_detail(json!({"entityType": payload.entity_type.as_str()})),
                    )
                    .await;
                Err(e.into())
            }
        }
    }
}

/// Handles [`events::COVERAGE_WARMUP`]: fans out one debounced refresh
/// per registered entity, throttled per entity.
pub struct WarmupHandler {
    registry: Arc<dyn EntityRegistry>,
    bus: Arc<dyn EventBus>,
    config: QindexConfig,
    last_warmup: Mutex<HashMap<String, Instant>>,
}

impl WarmupHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        registry: Arc<dyn EntityRegistry>,
        bus: Arc<dyn EventBus>,
        config: QindexConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            config,
            last_warmup: Mutex::new(HashMap::new()),
        }
    }

    fn should_warm(&self, key: &str) -> bool {
        let mut guard = self.last_warmup.lock();
        let now = Instant::now();
        if let Some(last) = guard.get(key) {
            if now.duration_since(*last) < self.config.coverage_refresh_throttle {
                return false;
            }
        }
        guard.insert(key.to_string(), now);
        true
    }
}

#[async_trait]
impl EventHandler for WarmupHandler {
    async fn handle(&self, _event: &str, payload: Value) -> QindexResult<()> {
        let payload: WarmupPayload = serde_json::from_value(payload)?;

        let mut scheduled = 0_usize;
        for entity_type in self.registry.entity_types() {
            let key = format!(
                "{}|{}",
                entity_type,
                payload.tenant_id.as_deref().unwrap_or_default()
            );
            if !self.should_warm(&key) {
                continue;
            }
            let refresh = json!({
                "entityType": entity_type.as_str(),
                "tenantId": payload.tenant_id,
            });
            if let Err(e) = self.bus.emit(events::COVERAGE_REFRESH, refresh, false).await {
                warn!(entity_type = %entity_type, error = %e, "Warmup refresh emit failed");
                continue;
            }
            scheduled += 1;
        }

        info!(scheduled, "Coverage warmup fan-out");
        Ok(())
    }
}
