//! # Query Index Telemetry
//!
//! Structured logging initialization and the append-only diagnostic log
//! stores (`indexer_error_logs`, `indexer_status_logs`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod diag;
pub mod logging;

pub use diag::{DiagEntry, DiagStore};
pub use logging::{debug_sql_enabled, indexer_verbose, init_logging, LoggingConfig, LoggingError};
