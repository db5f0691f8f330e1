//! Core engine of a local-first issue tracker.
//!
//! `beads_core` maintains two representations of the same issue graph and
//! keeps them convergent:
//!
//! - a relational, content-addressed store (SQLite) with a first-class
//!   dependency graph and a materialized blocked-work view;
//! - an append-only JSONL mirror (`issues.jsonl`) suitable for tracking in
//!   the user's version-control workflow.
//!
//! The crate deliberately has no command-line surface, spawns no processes,
//! starts no background work, and never touches a version-control tool.
//! Callers drive every operation explicitly.
//!
//! Module map:
//! - [`model`] — entities and open enum sets
//! - [`storage`] — schema, entity store, audit events, graph engine
//! - [`sync`] — mirror export/import, collision resolution, freshness
//! - [`util`] — content hashing, ID generation and resolution, time parsing
//! - [`validation`] — field and relation validators
//! - [`config`] — environment-carried configuration and workspace paths

pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;
pub mod util;
pub mod validation;

pub use config::{CoreConfig, OrphanMode};
pub use error::{BeadsError, ErrorKind, Result};
pub use model::{
    Comment, Dependency, DependencyType, Event, EventType, Issue, IssueType, Priority, Status,
};
pub use storage::sqlite::{IssuePatch, SqliteStorage};
pub use storage::{ReadyFilters, ReadySortPolicy, TreeDirection, TreeOptions};
pub use sync::{ExportOptions, ExportSummary, ImportOptions, ImportOutcome};
