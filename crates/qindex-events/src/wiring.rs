//! Handler registration.

use crate::bridge::CrudBridge;
use crate::bus::ANY_EVENT;
use crate::debounce::{AccountantRefresher, CoverageRefreshDebouncer};
use crate::handlers::{
    DeleteOneHandler, PurgeHandler, ReindexHandler, UpsertOneHandler, WarmupHandler,
};
use qindex_config::QindexConfig;
use qindex_core::{events, EntityRegistry, EventBus};
use qindex_coverage::CoverageAccountant;
use qindex_indexer::{DocumentBuilder, Indexer};
use qindex_migrations::{ColumnCache, IndexPool};
use qindex_telemetry::DiagStore;
use qindex_worker::{Purger, Reindexer};
use std::sync::Arc;

/// Everything the handlers need, built once at startup.
pub struct HandlerDeps {
    /// Shared pool.
    pub pool: IndexPool,
    /// Entity registration.
    pub registry: Arc<dyn EntityRegistry>,
    /// Column probe cache.
    pub columns: ColumnCache,
    /// Document builder.
    pub builder: Arc<DocumentBuilder>,
    /// Single-record indexer.
    pub indexer: Arc<Indexer>,
    /// Coverage accountant.
    pub accountant: Arc<CoverageAccountant>,
    /// Reindex driver.
    pub reindexer: Arc<Reindexer>,
    /// Purge driver.
    pub purger: Arc<Purger>,
    /// Diagnostic log store.
    pub diag: DiagStore,
    /// Shared tunables.
    pub config: QindexConfig,
    /// Emit vectorize events during reindex passes.
    pub vectorize: bool,
}

/// Register every handler of the subsystem on a bus.
pub fn register_handlers(bus: &Arc<dyn EventBus>, deps: &HandlerDeps) {
    bus.on(
        events::UPSERT_ONE,
        Arc::new(UpsertOneHandler::new(
            Arc::clone(&deps.indexer),
            Arc::clone(&deps.accountant),
            Arc::clone(bus),
        )),
    );

    bus.on(
        events::DELETE_ONE,
        Arc::new(DeleteOneHandler::new(
            Arc::clone(&deps.indexer),
            Arc::clone(&deps.accountant),
        )),
    );

    bus.on(
        events::REINDEX,
        Arc::new(ReindexHandler::new(
            Arc::clone(&deps.reindexer),
            deps.config.clone(),
            deps.vectorize,
        )),
    );

    bus.on(
        events::PURGE,
        Arc::new(PurgeHandler::new(
            Arc::clone(&deps.purger),
            Arc::clone(&deps.accountant),
            deps.diag.clone(),
        )),
    );

    bus.on(
        events::COVERAGE_REFRESH,
        Arc::new(CoverageRefreshDebouncer::new(Arc::new(
            AccountantRefresher::new(Arc::clone(&deps.accountant)),
        ))),
    );

    bus.on(
        events::COVERAGE_WARMUP,
        Arc::new(WarmupHandler::new(
            Arc::clone(&deps.registry),
            Arc::clone(bus),
            deps.config.clone(),
        )),
    );

    bus.on(
        ANY_EVENT,
        Arc::new(CrudBridge::new(
            deps.pool.clone(),
            Arc::clone(&deps.registry),
            deps.columns.clone(),
            Arc::clone(&deps.builder),
            Arc::clone(bus),
        )),
    );
}
