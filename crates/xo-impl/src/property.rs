//! Property and relation access against datastore records.
//!
//! The property managers translate instance level reads and writes into
//! datastore session calls and map the records they get back into
//! canonical instances. Every mutation registers the touched instances in
//! the transactional cache.

use std::rc::Rc;

use tracing::debug;
use xo_api::{Value, XoError, XoResult};
use xo_spi::{DatastoreSession, Direction, Entity, Record, Relation};

use crate::instance::{EntityInstance, InstanceManager, RelationInstance};
use crate::metadata::RelationRef;

/// Scalar properties, references and relation edges of entities.
pub struct EntityPropertyManager {
    datastore: Rc<dyn DatastoreSession>,
    entities: Rc<InstanceManager<Entity>>,
    relations: Rc<InstanceManager<Relation>>,
}

impl EntityPropertyManager {
    pub(crate) fn new(
        datastore: Rc<dyn DatastoreSession>,
        entities: Rc<InstanceManager<Entity>>,
        relations: Rc<InstanceManager<Relation>>,
    ) -> Self {
        Self {
            datastore,
            entities,
            relations,
        }
    }

    /// Current value of `property`; absent properties read as null.
    pub fn get_property(&self, instance: &EntityInstance, property: &str) -> XoResult<Value> {
        let record = self.entities.get_datastore_type(instance)?;
        Ok(self
            .datastore
            .entity_property(&record, property)?
            .unwrap_or(Value::Null))
    }

    /// Write `property`; null removes it.
    pub fn set_property(&self, instance: &EntityInstance, property: &str, value: Value) -> XoResult<()> {
        let record = self.entities.get_datastore_type(instance)?;
        if value.is_null() {
            self.datastore.remove_entity_property(&record, property)?;
        } else {
            self.datastore.set_entity_property(&record, property, value)?;
        }
        self.entities.touch(instance);
        Ok(())
    }

    /// Relation records of `relation` attached to `instance`.
    pub fn relation_records(&self, instance: &EntityInstance, relation: &RelationRef) -> XoResult<Vec<Relation>> {
        let record = self.entities.get_datastore_type(instance)?;
        Ok(self
            .datastore
            .relations(&record, &relation.discriminator, relation.direction)?)
    }

    /// Relation instances of `relation` attached to `instance`.
    pub fn relations(&self, instance: &EntityInstance, relation: &RelationRef) -> XoResult<Vec<RelationInstance>> {
        self.relation_records(instance, relation)?
            .iter()
            .map(|record| self.relations.get_instance(record))
            .collect()
    }

    /// Entity at the far end of `record`, seen from an entity holding it
    /// in `direction`.
    pub fn opposite(&self, record: &Relation, direction: Direction) -> XoResult<EntityInstance> {
        let entity = match direction {
            Direction::From => self.datastore.relation_to(record)?,
            Direction::To => self.datastore.relation_from(record)?,
        };
        self.entities.get_instance(&entity)
    }

    /// Entities referenced by `instance` through `relation`.
    pub fn references(&self, instance: &EntityInstance, relation: &RelationRef) -> XoResult<Vec<EntityInstance>> {
        self.relation_records(instance, relation)?
            .iter()
            .map(|record| self.opposite(record, relation.direction))
            .collect()
    }

    /// The one entity referenced through `relation`, if any.
    pub fn get_single_reference(
        &self,
        instance: &EntityInstance,
        relation: &RelationRef,
    ) -> XoResult<Option<EntityInstance>> {
        let mut references = self.references(instance, relation)?;
        match references.len() {
            0 => Ok(None),
            1 => Ok(references.pop()),
            n => Err(XoError::NotSingleResult(format!(
                "{n} {} relations on {instance}",
                relation.relation
            ))),
        }
    }

    /// Replace the reference held through `relation`.
    pub fn set_single_reference(
        &self,
        instance: &EntityInstance,
        relation: &RelationRef,
        target: Option<&EntityInstance>,
    ) -> XoResult<()> {
        self.remove_references(instance, relation)?;
        if let Some(target) = target {
            self.create_reference(instance, relation, target)?;
        }
        Ok(())
    }

    /// Create one edge of `relation` between `instance` and `target`.
    pub fn create_reference(
        &self,
        instance: &EntityInstance,
        relation: &RelationRef,
        target: &EntityInstance,
    ) -> XoResult<RelationInstance> {
        let (from, to) = match relation.direction {
            Direction::From => (instance, target),
            Direction::To => (target, instance),
        };
        let from_record = self.entities.get_datastore_type(from)?;
        let to_record = self.entities.get_datastore_type(to)?;
        let record = self
            .datastore
            .create_relation(&from_record, &relation.discriminator, &to_record)?;
        debug!(
            relation = %relation.relation,
            id = %record.id(),
            from = %from_record.id(),
            to = %to_record.id(),
            "relation created"
        );
        self.entities.touch(from);
        self.entities.touch(to);
        self.relations.get_instance(&record)
    }

    /// Remove the first edge of `relation` leading to `target`.
    ///
    /// Returns whether an edge was removed.
    pub fn remove_reference(
        &self,
        instance: &EntityInstance,
        relation: &RelationRef,
        target: &EntityInstance,
    ) -> XoResult<bool> {
        let target_record = self.entities.get_datastore_type(target)?;
        for record in self.relation_records(instance, relation)? {
            let far_end = match relation.direction {
                Direction::From => self.datastore.relation_to(&record)?,
                Direction::To => self.datastore.relation_from(&record)?,
            };
            if far_end == target_record {
                self.delete_relation_record(&record)?;
                self.entities.touch(instance);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove every edge of `relation` attached to `instance`.
    pub fn remove_references(&self, instance: &EntityInstance, relation: &RelationRef) -> XoResult<usize> {
        let records = self.relation_records(instance, relation)?;
        for record in &records {
            self.delete_relation_record(record)?;
        }
        if !records.is_empty() {
            self.entities.touch(instance);
        }
        Ok(records.len())
    }

    /// Delete a relation instance and retire it.
    pub fn delete_relation(&self, instance: &RelationInstance) -> XoResult<()> {
        let record = self.relations.get_datastore_type(instance)?;
        self.datastore.delete_relation(&record)?;
        self.relations.remove_instance(instance);
        self.relations.destroy_instance(instance);
        debug!(id = %record.id(), "relation deleted");
        Ok(())
    }

    fn delete_relation_record(&self, record: &Relation) -> XoResult<()> {
        match self.relations.instance_for_record(record.id()) {
            Some(instance) => self.delete_relation(&instance),
            None => {
                self.datastore.delete_relation(record)?;
                debug!(id = %record.id(), "relation deleted");
                Ok(())
            }
        }
    }
}

/// Scalar properties and endpoints of relations.
pub struct RelationPropertyManager {
    datastore: Rc<dyn DatastoreSession>,
    entities: Rc<InstanceManager<Entity>>,
    relations: Rc<InstanceManager<Relation>>,
}

impl RelationPropertyManager {
    pub(crate) fn new(
        datastore: Rc<dyn DatastoreSession>,
        entities: Rc<InstanceManager<Entity>>,
        relations: Rc<InstanceManager<Relation>>,
    ) -> Self {
        Self {
            datastore,
            entities,
            relations,
        }
    }

    pub fn get_property(&self, instance: &RelationInstance, property: &str) -> XoResult<Value> {
        let record = self.relations.get_datastore_type(instance)?;
        Ok(self
            .datastore
            .relation_property(&record, property)?
            .unwrap_or(Value::Null))
    }

    pub fn set_property(&self, instance: &RelationInstance, property: &str, value: Value) -> XoResult<()> {
        let record = self.relations.get_datastore_type(instance)?;
        if value.is_null() {
            self.datastore.remove_relation_property(&record, property)?;
        } else {
            self.datastore.set_relation_property(&record, property, value)?;
        }
        self.relations.touch(instance);
        Ok(())
    }

    pub fn from(&self, instance: &RelationInstance) -> XoResult<EntityInstance> {
        let record = self.relations.get_datastore_type(instance)?;
        let entity = self.datastore.relation_from(&record)?;
        self.entities.get_instance(&entity)
    }

    pub fn to(&self, instance: &RelationInstance) -> XoResult<EntityInstance> {
        let record = self.relations.get_datastore_type(instance)?;
        let entity = self.datastore.relation_to(&record)?;
        self.entities.get_instance(&entity)
    }
}
