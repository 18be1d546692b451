//! Relational persistence for Corral entities.
//!
//! The store is the single source of truth shared by all conductor
//! processes: every status transition, credential reference, and lock
//! passes through it. SQLite is accessed through one connection guarded
//! by a mutex; statements are short and never held across await points.

mod filters;
mod objects;
mod schema;
mod store;

pub use filters::{
    ClusterFilters, ListQuery, NodeGroupFilters, QuotaFilters, SortDir, TemplateFilters,
    X509Filters,
};
pub use objects::{
    Cluster, ClusterLockRow, ClusterStats, ClusterTemplate, Federation, NodeGroup, Quota,
    ServiceRecord, X509KeyPair,
};
pub use store::SqliteStore;
