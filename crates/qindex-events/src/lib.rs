//! # Query Index Events
//!
//! Glue between the event bus and the rest of the subsystem:
//! - [`bus`] is an in-process dispatcher for single-process deployments
//!   and tests (the durable production bus is external)
//! - [`handlers`] are the short-lived units of work behind each
//!   `query_index.*` event
//! - [`bridge`] translates producer CRUD events into index maintenance
//! - [`debounce`] collapses bursts of coverage-refresh requests
//! - [`wiring`] registers everything on a bus

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod bus;
pub mod debounce;
pub mod handlers;
pub mod wiring;

pub use bridge::CrudBridge;
pub use bus::{InProcessBus, ANY_EVENT};
pub use debounce::{AccountantRefresher, CoverageRefreshDebouncer, CoverageRefresher};
pub use handlers::{
    DeleteOneHandler, PurgeHandler, ReindexHandler, UpsertOneHandler, WarmupHandler,
};
pub use wiring::{register_handlers, HandlerDeps};
