//! Session facade and its factory.
//!
//! [`XoManagerFactory`] binds a unit, a datastore and a metadata registry.
//! It initializes the datastore once and hands out [`XoManager`] sessions.
//! Each manager owns one [`SessionContext`] and must stay on the thread
//! that created it.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use xo_api::{ConstraintViolation, RecordId, Value, XoError, XoResult, XoUnit};
use xo_spi::{Datastore, Entity, Record, ResultIterator};

use crate::instance::{
    CompositeObject, EntityInstance, EntityProxy, ManagedObject, RelationInstance, RelationProxy,
};
use crate::interceptor::Interceptor;
use crate::metadata::{MetadataRegistry, RelationRef};
use crate::query::XoQuery;
use crate::session::SessionContext;
use crate::sync::SharedCursor;
use crate::transaction::XoTransaction;
use crate::validation::ConstraintValidator;

type InterceptorFactory = Arc<dyn Fn() -> Box<dyn Interceptor> + Send + Sync>;

/// Creates managers sharing one datastore and one metadata registry.
pub struct XoManagerFactory {
    unit: Arc<XoUnit>,
    datastore: Arc<dyn Datastore>,
    registry: Arc<MetadataRegistry>,
    validators: Vec<Arc<dyn ConstraintValidator>>,
    interceptors: Vec<InterceptorFactory>,
    closed: AtomicBool,
}

impl XoManagerFactory {
    /// Bind `unit` to `datastore` and register all declared types with it.
    pub fn new(
        unit: XoUnit,
        datastore: Arc<dyn Datastore>,
        registry: Arc<MetadataRegistry>,
    ) -> XoResult<Self> {
        datastore.init(
            &registry.datastore_entity_metadata(),
            &registry.datastore_relation_metadata(),
        )?;
        info!(
            unit = %unit.name,
            transaction_attribute = ?unit.transaction_attribute,
            validation_mode = ?unit.validation_mode,
            "xo unit initialized"
        );
        Ok(Self {
            unit: Arc::new(unit),
            datastore,
            registry,
            validators: Vec::new(),
            interceptors: Vec::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Add a constraint validator to every session.
    pub fn with_validator(mut self, validator: impl ConstraintValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Add a user interceptor to every session, inside the transaction
    /// interceptor.
    pub fn with_interceptor(
        mut self,
        factory: impl Fn() -> Box<dyn Interceptor> + Send + Sync + 'static,
    ) -> Self {
        self.interceptors.push(Arc::new(factory));
        self
    }

    pub fn unit(&self) -> &XoUnit {
        &self.unit
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn create_manager(&self) -> XoResult<XoManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(XoError::SessionClosed);
        }
        let session = SessionContext::new(
            self.unit.clone(),
            self.registry.clone(),
            self.datastore.create_session()?,
            self.validators.clone(),
            self.interceptors.iter().map(|factory| factory()).collect(),
        );
        Ok(XoManager { session })
    }

    pub fn close(&self) -> XoResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.datastore.close()?;
        info!(unit = %self.unit.name, "xo unit closed");
        Ok(())
    }
}

/// One session: typed access to entities, relations and queries.
pub struct XoManager {
    session: Rc<SessionContext>,
}

impl XoManager {
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn unit(&self) -> &XoUnit {
        self.session.unit()
    }

    pub fn current_transaction(&self) -> &XoTransaction {
        self.session.transaction()
    }

    /// Entities of `type_name` whose indexed property equals `value`.
    pub fn find(&self, type_name: &str, value: impl Into<Value>) -> XoResult<FindResult> {
        self.session.ensure_open()?;
        let metadata = self.session.registry().entity_type(type_name)?;
        let discriminator = metadata
            .discriminator()
            .ok_or_else(|| XoError::MissingDiscriminator(type_name.to_string()))?;
        if metadata.indexed_property().is_none() {
            return Err(XoError::MissingIndexedProperty(type_name.to_string()));
        }
        let value = value.into();
        let cursor = self.session.intercept("find", || {
            Ok(self.session.datastore().find_entities(
                &metadata.datastore_entity_metadata(),
                discriminator,
                &value,
            )?)
        })?;
        let cursor = Rc::new(RefCell::new(cursor));
        self.session.track_cursor(&cursor);
        Ok(FindResult {
            session: self.session.clone(),
            cursor,
            done: false,
        })
    }

    /// Create an entity of `type_name` that also has the `others` types.
    pub fn create(&self, type_name: &str, others: &[&str]) -> XoResult<CompositeObject> {
        self.session.ensure_open()?;
        self.session.intercept("create", || {
            let registry = self.session.registry();
            let types = registry.effective_types(type_name, others)?;
            let discriminators = registry.entity_discriminators(&types);
            if discriminators.is_empty() {
                return Err(XoError::MissingDiscriminator(type_name.to_string()));
            }
            let record = self.session.datastore().create_entity(&discriminators)?;
            let instance = self.session.entity_instances().get_instance(&record)?;
            debug!(id = %record.id(), types = ?instance.type_names(), "entity created");
            Ok(CompositeObject::new(instance))
        })
    }

    pub fn create_typed<T: EntityProxy>(&self) -> XoResult<T> {
        self.create(T::TYPE, &[])?.as_type()
    }

    /// Connect `source` and `target` through `relation_type`.
    ///
    /// The direction follows from which end of the relation type each
    /// instance satisfies.
    pub fn create_relation(
        &self,
        source: &EntityInstance,
        relation_type: &str,
        target: &EntityInstance,
    ) -> XoResult<RelationInstance> {
        self.session.ensure_open()?;
        self.session.intercept("createRelation", || {
            let registry = self.session.registry();
            let metadata = registry.relation_type(relation_type)?;
            let direction = registry.relation_direction(source.types(), &metadata, target.types())?;
            let relation = RelationRef {
                relation: metadata.name().to_string(),
                discriminator: metadata.datastore_relation_metadata().discriminator,
                direction,
            };
            self.session
                .entity_properties()
                .create_reference(source, &relation, target)
        })
    }

    pub fn create_relation_typed<T: RelationProxy>(
        &self,
        source: &EntityInstance,
        target: &EntityInstance,
    ) -> XoResult<T> {
        self.create_relation(source, T::TYPE, target)?.as_type()
    }

    /// Delete a managed entity or relation.
    pub fn delete(&self, object: impl Into<ManagedObject>) -> XoResult<()> {
        self.session.ensure_open()?;
        let object = object.into();
        self.session.intercept("delete", || match &object {
            ManagedObject::Entity(entity) => {
                let instances = self.session.entity_instances();
                if !instances.is_instance(entity) {
                    return Err(XoError::UnmanagedInstance(entity.to_string()));
                }
                let record = instances.get_datastore_type(entity)?;
                self.session.datastore().delete_entity(&record)?;
                instances.remove_instance(entity);
                instances.destroy_instance(entity);
                debug!(id = %record.id(), "entity deleted");
                Ok(())
            }
            ManagedObject::Relation(relation) => {
                if !self.session.relation_instances().is_instance(relation) {
                    return Err(XoError::UnmanagedInstance(relation.to_string()));
                }
                self.session.entity_properties().delete_relation(relation)
            }
        })
    }

    /// Change the types of `entity`, keeping its record.
    pub fn migrate(&self, entity: &EntityInstance, type_name: &str, others: &[&str]) -> XoResult<CompositeObject> {
        self.migrate_with(entity, type_name, others, |_, _| Ok(()))
    }

    /// Like [`migrate`](Self::migrate), running `strategy` with the old and
    /// the new instance before the old one is retired.
    pub fn migrate_with(
        &self,
        entity: &EntityInstance,
        type_name: &str,
        others: &[&str],
        strategy: impl FnOnce(&EntityInstance, &CompositeObject) -> XoResult<()>,
    ) -> XoResult<CompositeObject> {
        self.session.ensure_open()?;
        self.session.intercept("migrate", || {
            let instances = self.session.entity_instances();
            if !instances.is_instance(entity) {
                return Err(XoError::UnmanagedInstance(entity.to_string()));
            }
            let record = instances.get_datastore_type(entity)?;
            let registry = self.session.registry();
            let old = self.session.datastore().entity_discriminators(&record)?;
            let types = registry.effective_types(type_name, others)?;
            let new = registry.entity_discriminators(&types);
            if new.is_empty() {
                return Err(XoError::MissingDiscriminator(type_name.to_string()));
            }
            self.session.datastore().migrate_entity(&record, &old, &new)?;

            instances.remove_instance(entity);
            let outcome = instances
                .get_instance(&record)
                .map(CompositeObject::new)
                .and_then(|migrated| strategy(entity, &migrated).map(|()| migrated));
            match outcome {
                Ok(migrated) => {
                    instances.destroy_instance(entity);
                    debug!(id = %record.id(), from = ?old, to = ?new, "entity migrated");
                    Ok(migrated)
                }
                Err(e) => {
                    if let Some(replacement) = instances.instance_for_record(record.id()) {
                        instances.remove_instance(&replacement);
                        instances.destroy_instance(&replacement);
                    }
                    match self.session.datastore().migrate_entity(&record, &new, &old) {
                        Ok(()) => instances.restore_instance(entity),
                        Err(revert) => {
                            warn!(id = %record.id(), error = %revert, "could not restore types after failed migration");
                            instances.destroy_instance(entity);
                        }
                    }
                    debug!(id = %record.id(), error = %e, "migration abandoned");
                    Err(e)
                }
            }
        })
    }

    pub fn migrate_typed<T: EntityProxy>(&self, entity: &EntityInstance) -> XoResult<T> {
        self.migrate(entity, T::TYPE, &[])?.as_type()
    }

    pub fn migrate_typed_with<T: EntityProxy>(
        &self,
        entity: &EntityInstance,
        strategy: impl FnOnce(&EntityInstance, &T) -> XoResult<()>,
    ) -> XoResult<T> {
        self.migrate_with(entity, T::TYPE, &[], |old, new| strategy(old, &new.as_type::<T>()?))?
            .as_type()
    }

    /// Query with an expression the datastore understands.
    pub fn create_query(&self, expression: impl Into<String>) -> XoQuery {
        XoQuery::new(self.session.weak(), expression, Vec::new(), None)
    }

    /// Query whose rows hold instances of `result_type`.
    pub fn create_query_typed(&self, expression: impl Into<String>, result_type: &str) -> XoResult<XoQuery> {
        let registry = self.session.registry();
        registry
            .entity_type(result_type)
            .or_else(|_| registry.relation_type(result_type))?;
        Ok(XoQuery::new(
            self.session.weak(),
            expression,
            vec![result_type.to_string()],
            None,
        ))
    }

    /// Query declared as a named query type.
    pub fn create_typed_query(&self, query_type: &str) -> XoResult<XoQuery> {
        let metadata = self.session.registry().query_type(query_type)?;
        let columns = (!metadata.columns.is_empty()).then(|| metadata.columns.clone());
        Ok(XoQuery::new(
            self.session.weak(),
            metadata.expression.clone(),
            vec![metadata.name.clone()],
            columns,
        ))
    }

    /// Write pending changes of cached entities, then relations.
    pub fn flush(&self) -> XoResult<()> {
        self.session.ensure_open()?;
        self.session.intercept("flush", || {
            self.session.entity_synchronization().flush()?;
            self.session.relation_synchronization().flush()?;
            Ok(())
        })
    }

    /// Violations of the instances touched in the current transaction.
    pub fn validate(&self) -> XoResult<Vec<ConstraintViolation>> {
        self.session.ensure_open()?;
        self.session
            .intercept("validate", || self.session.validator().validate())
    }

    pub fn get_id(&self, object: impl Into<ManagedObject>) -> XoResult<RecordId> {
        match object.into() {
            ManagedObject::Entity(entity) => Ok(self
                .session
                .entity_instances()
                .get_datastore_type(&entity)?
                .id()
                .clone()),
            ManagedObject::Relation(relation) => Ok(self
                .session
                .relation_instances()
                .get_datastore_type(&relation)?
                .id()
                .clone()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Close the session. An active transaction is rolled back.
    pub fn close(&self) -> XoResult<()> {
        self.session.close()
    }
}

impl Drop for XoManager {
    fn drop(&mut self) {
        if !self.session.is_closed() {
            if let Err(e) = self.session.close() {
                warn!(error = %e, "closing dropped manager failed");
            }
        }
    }
}

/// Lazy result of [`XoManager::find`].
pub struct FindResult {
    session: Rc<SessionContext>,
    cursor: SharedCursor<Entity>,
    done: bool,
}

impl FindResult {
    pub fn close(&mut self) {
        self.done = true;
        self.cursor.borrow_mut().close();
    }

    /// The only match.
    pub fn single(mut self) -> XoResult<EntityInstance> {
        let first = match self.next() {
            Some(entity) => entity?,
            None => return Err(XoError::NotSingleResult("no entity found".into())),
        };
        let more = self.next().is_some();
        self.close();
        if more {
            return Err(XoError::NotSingleResult("more than one entity found".into()));
        }
        Ok(first)
    }

    /// Matches viewed as proxy type `T`.
    pub fn typed<T: EntityProxy>(self) -> impl Iterator<Item = XoResult<T>> {
        self.map(|entity| entity.and_then(|e| e.as_type::<T>()))
    }

    fn fetch(&mut self) -> XoResult<Option<EntityInstance>> {
        self.session.ensure_open()?;
        let session = &self.session;
        let cursor = &self.cursor;
        session.intercept("next", || match cursor.borrow_mut().next() {
            Some(record) => Ok(Some(session.entity_instances().get_instance(&record)?)),
            None => Ok(None),
        })
    }
}

impl Iterator for FindResult {
    type Item = XoResult<EntityInstance>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fetch() {
            Ok(Some(entity)) => Some(Ok(entity)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}
