//! Embedded in-memory property graph datastore for XO.
//!
//! Entities are labelled nodes, relations are typed relationships. Each
//! session transaction works on a snapshot of the graph and publishes it on
//! commit. Queries are resolved against handlers registered with
//! [`MemoryDatastore::define_query`].

pub mod datastore;
pub mod graph;
pub mod session;

pub use datastore::{Flushed, MemoryDatastore, QueryHandler};
pub use graph::{Graph, Node, Relationship, UniqueConstraint};
pub use session::{MemorySession, MemoryTransaction};
