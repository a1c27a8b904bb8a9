//! # Query Index Worker
//!
//! Long-running index maintenance:
//! - [`reindexer`] drives partitioned full/scoped reindex passes
//! - [`purger`] soft-deletes every index row in a scope
//!
//! Both keep the job ledger current and leave coverage snapshots
//! authoritative on completion.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod purger;
pub mod reindexer;

pub use error::{Result, WorkerError};
pub use purger::{PurgeOutcome, Purger};
pub use reindexer::{ReindexOptions, ReindexOutcome, Reindexer};
