//! # Query Index Migrations
//!
//! Connection pool management and versioned schema migrations for the
//! tables owned by the query-index subsystem: `entity_indexes`,
//! `entity_index_jobs`, `entity_index_coverage`, `search_tokens`, and the
//! diagnostic log tables.
//!
//! The subsystem reads base tables and custom-field tables but never
//! creates them; only its own tables are migrated here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod columns;
pub mod config;
pub mod error;
pub mod migration;
pub mod migrator;
pub mod pool;
pub mod schema;

pub use columns::{ColumnCache, ScopeColumns};
pub use config::MigrationConfig;
pub use error::{MigrationError, Result};
pub use migration::{Migration, MigrationRecord, MigrationStatus};
pub use migrator::Migrator;
pub use pool::{IndexPool, PoolStats};
pub use schema::all_migrations;
