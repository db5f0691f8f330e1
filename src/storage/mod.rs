//! Relational storage: schema, entity store, audit events, graph engine.

pub mod events;
pub mod graph;
pub mod schema;
pub mod sqlite;

pub use graph::{
    ExternalResolver, NoExternalResolution, ReadyFilters, ReadySortPolicy, TreeDirection,
    TreeNode, TreeOptions,
};
pub use sqlite::{IssuePatch, MutationContext, SqliteStorage};
