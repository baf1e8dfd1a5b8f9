//! JSON file document datastore for XO.
//!
//! Every entity is a document `{ "id", "types", "properties" }` stored as
//! `<id>.json` in one directory. Ids are UUID v7 strings. Writes are
//! buffered per session and hit the disk on `flush_entity`; deletes are
//! applied on commit.

pub mod datastore;
pub mod document;
pub mod session;

pub use datastore::{JsonFileDatastore, DIRECTORY_PROPERTY};
pub use document::{Document, DocumentDirectory};
pub use session::{JsonFileSession, JsonTransaction};
