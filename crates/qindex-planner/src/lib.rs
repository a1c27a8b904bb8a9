//! # Query Index Planner
//!
//! The read side of the query-index subsystem. Per request the planner
//! decides whether to serve from the denormalized index (joined to the
//! base table) or to fall through to the naive base-only engine, guided
//! by coverage snapshots.
//!
//! The SQL builder layer is pure: it turns parsed options into
//! `(sql, binds)` pairs and is tested without a database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod caches;
pub mod error;
pub mod options;
pub mod planner;
pub mod sql;

pub use error::{PlannerError, Result};
pub use options::{
    parse_filters, parse_sort, CustomFieldSource, FieldFilter, FilterOp, IncludeCustomFields,
    OrganizationFilter, PartialIndexWarning, QueryMeta, QueryOptions, QueryResult, SortSpec,
};
pub use planner::Planner;
pub use sql::{BindValue, SqlQuery};
