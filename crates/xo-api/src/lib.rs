//! Public types for the XO object mapper.
//!
//! XO maps plain typed declarations onto heterogeneous datastores (an
//! embedded property graph, a directory of JSON documents, ...). This crate
//! holds everything application code and datastore adapters share:
//!
//! - [`Value`] -- property and query values, including references to records
//! - [`RecordId`] -- the datastore-assigned identity of an entity or relation
//! - [`XoError`] -- the single root error category of every XO operation
//! - [`DatastoreError`] -- failures reported by datastore adapters
//! - [`TransactionAttribute`] / [`TransactionState`] -- ambient transaction model
//! - [`ConstraintViolation`] / [`ValidationMode`] -- validation contract
//! - [`XoUnit`] -- configuration of one XO unit (datastore binding + policies)

pub mod error;
pub mod transaction;
pub mod unit;
pub mod validation;
pub mod value;

pub use error::{DatastoreError, DatastoreResult, XoError, XoResult};
pub use transaction::{TransactionAttribute, TransactionState};
pub use unit::XoUnit;
pub use validation::{ConstraintViolation, Severity, ValidationMode};
pub use value::{FromValue, RecordId, Value};
