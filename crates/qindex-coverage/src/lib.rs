//! # Query Index Coverage
//!
//! The bookkeeping side of the query-index subsystem:
//! - [`accountant`] maintains coverage snapshots (base/indexed/vector
//!   counts per scope) through authoritative refreshes and incremental
//!   deltas
//! - [`jobs`] is the partitioned reindex/purge job ledger
//! - [`status`] rolls both up into per-entity reports for administrative
//!   callers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accountant;
pub mod error;
pub mod jobs;
pub mod status;

pub use accountant::{
    aggregate_adjustments, CountsUpdate, CoverageAccountant, CoverageAdjustment, CoverageRow,
};
pub use error::{CoverageError, Result};
pub use jobs::{JobLedger, JobRecord, JobScope, JobStatus};
pub use status::{
    roll_up_jobs, AggregateStatus, EntityStatus, JobSummary, StatusAggregator, StatusReport,
};
