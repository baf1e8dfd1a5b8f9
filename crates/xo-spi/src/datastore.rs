use std::collections::{BTreeMap, BTreeSet};

use xo_api::{DatastoreResult, Value};

use crate::cursor::{ResultIterator, Row};
use crate::metadata::{DatastoreEntityMetadata, DatastoreRelationMetadata, Direction};
use crate::record::{Entity, Relation};

/// Boxed entity cursor returned by lookups.
pub type EntityCursor = Box<dyn ResultIterator<Item = Entity>>;

/// Boxed row cursor returned by query execution.
pub type RowCursor = Box<dyn ResultIterator<Item = Row>>;

/// A storage engine XO sessions can be opened against.
///
/// The datastore is shared by every session of a unit and must be safe to
/// use from several threads. Sessions themselves are single threaded.
pub trait Datastore: Send + Sync {
    /// Called once with the metadata of every registered type before the
    /// first session is created (index setup, schema checks, ...).
    fn init(
        &self,
        entities: &[DatastoreEntityMetadata],
        relations: &[DatastoreRelationMetadata],
    ) -> DatastoreResult<()>;

    fn create_session(&self) -> DatastoreResult<Box<dyn DatastoreSession>>;

    fn close(&self) -> DatastoreResult<()>;
}

/// Native transaction of a datastore session.
pub trait DatastoreTransaction {
    fn begin(&self) -> DatastoreResult<()>;

    fn commit(&self) -> DatastoreResult<()>;

    fn rollback(&self) -> DatastoreResult<()>;

    fn is_active(&self) -> bool;
}

/// Record level operations for one XO session.
///
/// Every method works on opaque handles. Implementations decide whether
/// writes are applied immediately or buffered until the matching
/// `flush_*` call; the core flushes every touched record before commit.
pub trait DatastoreSession {
    /// The native transaction handle of this session.
    fn transaction(&self) -> &dyn DatastoreTransaction;

    // ---------------------------------------------------------------
    // Entities
    // ---------------------------------------------------------------

    /// Find entities carrying `discriminator` whose indexed property equals
    /// `value`.
    fn find_entities(
        &self,
        metadata: &DatastoreEntityMetadata,
        discriminator: &str,
        value: &Value,
    ) -> DatastoreResult<EntityCursor>;

    /// Create an entity carrying all `discriminators`.
    fn create_entity(&self, discriminators: &BTreeSet<String>) -> DatastoreResult<Entity>;

    fn delete_entity(&self, entity: &Entity) -> DatastoreResult<()>;

    fn entity_discriminators(&self, entity: &Entity) -> DatastoreResult<BTreeSet<String>>;

    /// Replace the type markers of `entity` in one operation.
    ///
    /// On error the entity must keep its previous markers.
    fn migrate_entity(
        &self,
        entity: &Entity,
        old_discriminators: &BTreeSet<String>,
        new_discriminators: &BTreeSet<String>,
    ) -> DatastoreResult<()>;

    fn flush_entity(&self, entity: &Entity) -> DatastoreResult<()>;

    fn entity_property(&self, entity: &Entity, name: &str) -> DatastoreResult<Option<Value>>;

    fn set_entity_property(&self, entity: &Entity, name: &str, value: Value) -> DatastoreResult<()>;

    fn remove_entity_property(&self, entity: &Entity, name: &str) -> DatastoreResult<()>;

    // ---------------------------------------------------------------
    // Relations
    // ---------------------------------------------------------------

    fn create_relation(
        &self,
        from: &Entity,
        discriminator: &str,
        to: &Entity,
    ) -> DatastoreResult<Relation>;

    fn delete_relation(&self, relation: &Relation) -> DatastoreResult<()>;

    /// Relations of type `discriminator` attached to `entity` in the given
    /// direction, in creation order.
    fn relations(
        &self,
        entity: &Entity,
        discriminator: &str,
        direction: Direction,
    ) -> DatastoreResult<Vec<Relation>>;

    fn relation_discriminator(&self, relation: &Relation) -> DatastoreResult<String>;

    fn relation_from(&self, relation: &Relation) -> DatastoreResult<Entity>;

    fn relation_to(&self, relation: &Relation) -> DatastoreResult<Entity>;

    fn flush_relation(&self, relation: &Relation) -> DatastoreResult<()>;

    fn relation_property(&self, relation: &Relation, name: &str) -> DatastoreResult<Option<Value>>;

    fn set_relation_property(
        &self,
        relation: &Relation,
        name: &str,
        value: Value,
    ) -> DatastoreResult<()>;

    fn remove_relation_property(&self, relation: &Relation, name: &str) -> DatastoreResult<()>;

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    /// Execute a query expression. Managed instances have already been
    /// replaced by [`Value::Entity`] / [`Value::Relation`] identities.
    fn execute_query(
        &self,
        expression: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> DatastoreResult<RowCursor>;

    fn close(&self) -> DatastoreResult<()>;
}
