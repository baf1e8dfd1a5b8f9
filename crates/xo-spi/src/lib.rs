//! Service provider interface for XO datastores.
//!
//! A datastore adapter plugs a concrete storage engine into the XO core by
//! implementing three traits:
//!
//! - [`Datastore`] -- the long-lived store; hands out sessions
//! - [`DatastoreSession`] -- record level operations for one XO session
//! - [`DatastoreTransaction`] -- the store's native transaction handle
//!
//! Records cross the boundary as opaque [`Entity`] and [`Relation`] handles.
//! The core never reads their payload directly; every property or endpoint
//! access goes back through the session.
//!
//! # Contract
//!
//! 1. Handles are identity only. Two handles with equal ids denote the same record.
//! 2. `flush_entity` / `flush_relation` must fully persist pending changes of
//!    the record before the native commit proceeds.
//! 3. `migrate_entity` rewrites all type markers of a record in one
//!    operation, or none of them.
//! 4. Cursors release their resources on `close` and on drop.

pub mod cursor;
pub mod datastore;
pub mod metadata;
pub mod record;

pub use cursor::{ResultIterator, Row, VecCursor};
pub use datastore::{Datastore, DatastoreSession, DatastoreTransaction, EntityCursor, RowCursor};
pub use metadata::{DatastoreEntityMetadata, DatastoreRelationMetadata, Direction};
pub use record::{Entity, Record, Relation};
