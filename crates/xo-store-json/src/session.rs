use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use tracing::{debug, warn};
use xo_api::{DatastoreError, DatastoreResult, Value};
use xo_spi::{
    DatastoreEntityMetadata, DatastoreSession, DatastoreTransaction, Direction, Entity,
    EntityCursor, Record, Relation, RowCursor, VecCursor,
};

use crate::document::{Document, DocumentDirectory};

/// Changes buffered by a session until flush or commit.
#[derive(Default)]
struct Pending {
    active: bool,
    documents: HashMap<String, Document>,
    dirty: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

impl Pending {
    fn reset(&mut self) {
        self.active = false;
        self.documents.clear();
        self.dirty.clear();
        self.deleted.clear();
    }
}

/// Transaction of a [`JsonFileSession`].
///
/// Property writes are buffered per document and written by
/// `flush_entity`. Deletes are applied on commit. Rollback discards all
/// unflushed changes; documents already flushed stay on disk.
pub struct JsonTransaction {
    directory: DocumentDirectory,
    pending: Rc<RefCell<Pending>>,
}

impl JsonTransaction {
    fn apply(&self, pending: &Pending) -> DatastoreResult<()> {
        for id in &pending.dirty {
            if let Some(document) = pending.documents.get(id) {
                self.directory.write(document)?;
            }
        }
        for id in &pending.deleted {
            self.directory.remove(id)?;
        }
        Ok(())
    }
}

impl DatastoreTransaction for JsonTransaction {
    fn begin(&self) -> DatastoreResult<()> {
        let mut pending = self.pending.borrow_mut();
        if pending.active {
            return Err(DatastoreError::TransactionActive);
        }
        pending.active = true;
        debug!(directory = %self.directory.root().display(), "json transaction begin");
        Ok(())
    }

    fn commit(&self) -> DatastoreResult<()> {
        let mut pending = self.pending.borrow_mut();
        if !pending.active {
            return Err(DatastoreError::NoTransaction);
        }
        let result = self.apply(&pending);
        debug!(
            written = pending.dirty.len(),
            deleted = pending.deleted.len(),
            "json transaction commit"
        );
        pending.reset();
        result
    }

    fn rollback(&self) -> DatastoreResult<()> {
        let mut pending = self.pending.borrow_mut();
        if !pending.active {
            return Err(DatastoreError::NoTransaction);
        }
        debug!(discarded = pending.dirty.len(), "json transaction rollback");
        pending.reset();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.pending.borrow().active
    }
}

/// Session of a [`JsonFileDatastore`](crate::JsonFileDatastore).
///
/// Only entities are supported. Relation operations and queries fail with
/// [`DatastoreError::Unsupported`].
pub struct JsonFileSession {
    directory: DocumentDirectory,
    pending: Rc<RefCell<Pending>>,
    transaction: JsonTransaction,
}

impl JsonFileSession {
    pub(crate) fn new(directory: DocumentDirectory) -> Self {
        let pending = Rc::new(RefCell::new(Pending::default()));
        Self {
            transaction: JsonTransaction {
                directory: directory.clone(),
                pending: pending.clone(),
            },
            directory,
            pending,
        }
    }

    /// Current state of a document: buffered copy first, then disk.
    fn load(&self, id: &str) -> DatastoreResult<Option<Document>> {
        let pending = self.pending.borrow();
        if pending.deleted.contains(id) {
            return Ok(None);
        }
        if let Some(document) = pending.documents.get(id) {
            return Ok(Some(document.clone()));
        }
        self.directory.read(id)
    }

    /// Apply `f` to the buffered copy of `entity`, marking it dirty.
    fn modify<T>(
        &self,
        entity: &Entity,
        f: impl FnOnce(&mut Document) -> DatastoreResult<T>,
    ) -> DatastoreResult<T> {
        let id = DocumentDirectory::document_id(entity.id())?;
        if !self.pending.borrow().active {
            return Err(DatastoreError::NoTransaction);
        }
        let document = self
            .load(&id)?
            .ok_or_else(|| DatastoreError::RecordNotFound(entity.id().clone()))?;
        let mut pending = self.pending.borrow_mut();
        let buffered = pending.documents.entry(id.clone()).or_insert(document);
        let result = f(buffered)?;
        pending.dirty.insert(id);
        Ok(result)
    }

    fn document(&self, entity: &Entity) -> DatastoreResult<Document> {
        let id = DocumentDirectory::document_id(entity.id())?;
        self.load(&id)?
            .ok_or_else(|| DatastoreError::RecordNotFound(entity.id().clone()))
    }

    fn unsupported<T>(operation: &str) -> DatastoreResult<T> {
        Err(DatastoreError::Unsupported(format!(
            "json file datastore does not support {operation}"
        )))
    }
}

impl DatastoreSession for JsonFileSession {
    fn transaction(&self) -> &dyn DatastoreTransaction {
        &self.transaction
    }

    fn find_entities(
        &self,
        metadata: &DatastoreEntityMetadata,
        discriminator: &str,
        value: &Value,
    ) -> DatastoreResult<EntityCursor> {
        let property = metadata.indexed_property.as_deref().ok_or_else(|| {
            DatastoreError::Unsupported(format!(
                "type '{}' has no indexed property",
                metadata.type_name
            ))
        })?;

        let mut candidates: BTreeMap<String, Document> = self
            .directory
            .scan()?
            .into_iter()
            .map(|document| (document.id.clone(), document))
            .collect();
        {
            let pending = self.pending.borrow();
            for id in &pending.deleted {
                candidates.remove(id);
            }
            for (id, document) in &pending.documents {
                candidates.insert(id.clone(), document.clone());
            }
        }

        let found: Vec<Entity> = candidates
            .into_values()
            .filter(|document| document.types.contains(discriminator))
            .filter(|document| document.properties.get(property) == Some(value))
            .map(|document| Entity::new(document.id))
            .collect();
        Ok(Box::new(VecCursor::new(found)))
    }

    fn create_entity(&self, discriminators: &BTreeSet<String>) -> DatastoreResult<Entity> {
        let mut pending = self.pending.borrow_mut();
        if !pending.active {
            return Err(DatastoreError::NoTransaction);
        }
        let document = Document::new(discriminators.clone());
        let id = document.id.clone();
        debug!(id = %id, "json document created");
        pending.documents.insert(id.clone(), document);
        pending.dirty.insert(id.clone());
        Ok(Entity::new(id))
    }

    fn delete_entity(&self, entity: &Entity) -> DatastoreResult<()> {
        // Resolve first so deleting an unknown entity fails.
        self.document(entity)?;
        let id = DocumentDirectory::document_id(entity.id())?;
        let mut pending = self.pending.borrow_mut();
        if !pending.active {
            return Err(DatastoreError::NoTransaction);
        }
        pending.documents.remove(&id);
        pending.dirty.remove(&id);
        pending.deleted.insert(id);
        Ok(())
    }

    fn entity_discriminators(&self, entity: &Entity) -> DatastoreResult<BTreeSet<String>> {
        Ok(self.document(entity)?.types)
    }

    fn migrate_entity(
        &self,
        entity: &Entity,
        old_discriminators: &BTreeSet<String>,
        new_discriminators: &BTreeSet<String>,
    ) -> DatastoreResult<()> {
        if new_discriminators.is_empty() {
            return Err(DatastoreError::Backend(format!(
                "cannot migrate document {} to an empty type set",
                entity.id()
            )));
        }
        self.modify(entity, |document| {
            if &document.types != old_discriminators {
                return Err(DatastoreError::Backend(format!(
                    "document {} types {:?} do not match expected {:?}",
                    document.id, document.types, old_discriminators
                )));
            }
            document.types = new_discriminators.clone();
            Ok(())
        })
    }

    fn flush_entity(&self, entity: &Entity) -> DatastoreResult<()> {
        let id = DocumentDirectory::document_id(entity.id())?;
        let mut pending = self.pending.borrow_mut();
        if !pending.dirty.remove(&id) {
            return Ok(());
        }
        match pending.documents.get(&id) {
            Some(document) => self.directory.write(document),
            None => Ok(()),
        }
    }

    fn entity_property(&self, entity: &Entity, name: &str) -> DatastoreResult<Option<Value>> {
        Ok(self.document(entity)?.properties.get(name).cloned())
    }

    fn set_entity_property(&self, entity: &Entity, name: &str, value: Value) -> DatastoreResult<()> {
        self.modify(entity, |document| {
            if value.is_null() {
                document.properties.remove(name);
            } else {
                document.properties.insert(name.to_string(), value);
            }
            Ok(())
        })
    }

    fn remove_entity_property(&self, entity: &Entity, name: &str) -> DatastoreResult<()> {
        self.modify(entity, |document| {
            document.properties.remove(name);
            Ok(())
        })
    }

    fn create_relation(&self, _: &Entity, _: &str, _: &Entity) -> DatastoreResult<Relation> {
        Self::unsupported("relations")
    }

    fn delete_relation(&self, _: &Relation) -> DatastoreResult<()> {
        Self::unsupported("relations")
    }

    fn relations(&self, _: &Entity, _: &str, _: Direction) -> DatastoreResult<Vec<Relation>> {
        Self::unsupported("relations")
    }

    fn relation_discriminator(&self, _: &Relation) -> DatastoreResult<String> {
        Self::unsupported("relations")
    }

    fn relation_from(&self, _: &Relation) -> DatastoreResult<Entity> {
        Self::unsupported("relations")
    }

    fn relation_to(&self, _: &Relation) -> DatastoreResult<Entity> {
        Self::unsupported("relations")
    }

    fn flush_relation(&self, _: &Relation) -> DatastoreResult<()> {
        Self::unsupported("relations")
    }

    fn relation_property(&self, _: &Relation, _: &str) -> DatastoreResult<Option<Value>> {
        Self::unsupported("relations")
    }

    fn set_relation_property(&self, _: &Relation, _: &str, _: Value) -> DatastoreResult<()> {
        Self::unsupported("relations")
    }

    fn remove_relation_property(&self, _: &Relation, _: &str) -> DatastoreResult<()> {
        Self::unsupported("relations")
    }

    fn execute_query(&self, _: &str, _: &BTreeMap<String, Value>) -> DatastoreResult<RowCursor> {
        Self::unsupported("queries")
    }

    fn close(&self) -> DatastoreResult<()> {
        if self.transaction.is_active() {
            warn!("json session closed with an active transaction; rolling back");
            self.transaction.rollback()?;
        }
        Ok(())
    }
}
