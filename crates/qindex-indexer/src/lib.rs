//! # Query Index Indexer
//!
//! The write side of the query-index subsystem:
//! - [`builder`] fuses base rows, custom-field values, and translations
//!   into JSON index documents
//! - [`tokens`] derives search-token rows from documents
//! - [`indexer`] upserts/deletes single index rows and reports transition
//!   flags
//! - [`batch`] vectorizes the upsert path for reindex chunks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod builder;
pub mod error;
pub mod indexer;
pub mod tokens;

pub use batch::{BatchOptions, BatchUpserter, ScopeOverrides};
pub use builder::{
    BuilderConfig, CompositeSpec, CustomFieldValue, DocumentBuilder, OrgDerivation,
    RawCustomFieldValue,
};
pub use error::{IndexerError, Result};
pub use indexer::Indexer;
pub use tokens::{TokenExtractor, TokenRow};
