//! # Query Index Worker
//!
//! Single-process worker for the tenant-scoped query-index subsystem.
//!
//! On startup it connects the database pool, applies the subsystem's
//! schema migrations, wires every event handler onto the in-process bus,
//! and emits a coverage warmup. It then idles until SIGINT/SIGTERM,
//! propagating cancellation into any running reindex pass.
//!
//! ## Usage
//!
//! ```bash
//! # Required
//! DATABASE_URL=postgres://localhost/app query-index-worker
//!
//! # Entity registration: <module>:<entity>=<table>[,...]
//! QUERY_INDEX_ENTITIES="example:todo=todos,crm:customer=customers" \
//!     DATABASE_URL=postgres://localhost/app query-index-worker
//! ```

use qindex_config::{QindexConfig, WorkerConfig};
use qindex_core::{events, EntityRegistry, EntityType, EventBus, StaticRegistry};
use qindex_coverage::{CoverageAccountant, JobLedger};
use qindex_events::{register_handlers, HandlerDeps, InProcessBus};
use qindex_indexer::{BatchUpserter, BuilderConfig, DocumentBuilder, Indexer, TokenExtractor};
use qindex_migrations::{all_migrations, ColumnCache, IndexPool, MigrationConfig, Migrator};
use qindex_telemetry::{init_logging, DiagStore, LoggingConfig};
use qindex_worker::{Purger, Reindexer};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = init_logging(&LoggingConfig::new()) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting query-index worker"
    );

    if let Err(e) = run().await {
        error!(error = %e, "Worker failed");
        std::process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let worker_config =
        WorkerConfig::from_env().ok_or("DATABASE_URL is required")?;
    let config = QindexConfig::from_env();

    let migration_config = MigrationConfig::new(&worker_config.database_url)
        .with_max_connections(worker_config.max_connections);
    let pool = IndexPool::connect(&migration_config).await?;
    pool.test_connection().await?;
    info!(stats = ?pool.stats(), "Database pool connected");

    let mut migrator = Migrator::new(pool.clone(), migration_config);
    migrator.add_migrations(all_migrations());
    let applied = migrator.run_pending().await?;
    info!(applied = applied.len(), "Schema migrations up to date");

    let registry = Arc::new(registry_from_env()?);
    info!(entities = registry.entity_types().len(), "Entity registry loaded");

    let columns = ColumnCache::new();
    let diag = DiagStore::new(pool.clone());
    let bus: Arc<dyn EventBus> = Arc::new(InProcessBus::new());

    let builder = Arc::new(DocumentBuilder::new(
        pool.clone(),
        registry.clone(),
        columns.clone(),
        BuilderConfig::default(),
    ));
    let tokens = Arc::new(TokenExtractor::new(
        pool.clone(),
        config.store_raw_tokens,
        config.token_field_blocklist.clone(),
    ));
    let indexer = Arc::new(Indexer::new(
        pool.clone(),
        builder.clone(),
        tokens.clone(),
        None,
    ));
    let batch = Arc::new(BatchUpserter::new(
        pool.clone(),
        builder.clone(),
        tokens,
        None,
    ));
    let accountant = Arc::new(CoverageAccountant::new(
        pool.clone(),
        registry.clone(),
        columns.clone(),
        config.clone(),
    ));
    let ledger = Arc::new(JobLedger::new(pool.clone()));

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let reindexer = Arc::new(Reindexer::new(
        pool.clone(),
        registry.clone(),
        columns.clone(),
        batch,
        accountant.clone(),
        ledger.clone(),
        diag.clone(),
        Some(bus.clone()),
        cancel_rx,
    ));
    let purger = Arc::new(Purger::new(pool.clone(), ledger));

    let deps = HandlerDeps {
        pool: pool.clone(),
        registry: registry.clone(),
        columns,
        builder,
        indexer,
        accountant,
        reindexer,
        purger,
        diag,
        config,
        vectorize: false,
    };
    register_handlers(&bus, &deps);
    info!("Event handlers registered");

    let warmup = json!({ "tenantId": worker_config.warmup_tenant_id });
    if let Err(e) = bus.emit(events::COVERAGE_WARMUP, warmup, false).await {
        warn!(error = %e, "Startup warmup emit failed");
    }

    wait_for_shutdown().await;
    info!("Shutdown signal received, cancelling workers");
    let _ = cancel_tx.send(true);

    // Give in-flight chunks a moment to land their ledger updates.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    pool.close().await;
    info!("Worker stopped");

    Ok(())
}

/// Parse `QUERY_INDEX_ENTITIES="module:entity=table,..."`.
fn registry_from_env() -> Result<StaticRegistry, Box<dyn std::error::Error>> {
    let raw = std::env::var("QUERY_INDEX_ENTITIES").unwrap_or_default();
    let mut registry = StaticRegistry::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (entity, table) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid entity registration '{pair}'"))?;
        let entity_type = EntityType::new(entity.trim())?;
        let label = entity_type.entity().replace('_', " ");
        registry = registry.with_entity(entity_type, table.trim(), label);
    }
    Ok(registry)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            () = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
