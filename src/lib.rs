//! Quarry: a secondary-index query engine.
//!
//! Queries are parsed and compiled into range-scan plans, executed as
//! merging id streams with resumable cursors, and reconciled against the
//! authoritative store before results are returned. The [`graph`] module
//! carries the repairs that keep edge storage consistent with its commit log.

#![warn(missing_docs)]

pub mod config;
pub mod graph;
pub mod pipeline;
pub mod query;
pub mod reconcile;
pub mod storage;
pub mod types;

pub use config::{ConfigError, QuarryConfig};
pub use reconcile::{Reconciler, SearchPage, VerifiedRecord};
pub use types::{EntityId, QuarryError, Result, Version};
