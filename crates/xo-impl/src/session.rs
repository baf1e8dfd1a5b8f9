//! Composition root of one XO session.
//!
//! A [`SessionContext`] owns every per-session component: the datastore
//! session, both instance managers and their caches, the property managers,
//! the transaction with its default synchronizations and the interceptor
//! chain. Instances and views refer back to it weakly, so dropping the
//! owning manager releases the whole graph.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::debug;
use xo_api::{XoError, XoResult, XoUnit};
use xo_spi::{DatastoreSession, Entity, Relation};

use crate::cache::TransactionalCache;
use crate::instance::InstanceManager;
use crate::interceptor::{Interceptor, InterceptorChain, InvocationContext, TransactionInterceptor};
use crate::metadata::MetadataRegistry;
use crate::property::{EntityPropertyManager, RelationPropertyManager};
use crate::sync::{
    CloseCursor, CursorSynchronization, EntityCacheSynchronization, RelationCacheSynchronization, SharedCursor,
    ValidatorSynchronization,
};
use crate::transaction::XoTransaction;
use crate::validation::{ConstraintValidator, InstanceValidator};

pub struct SessionContext {
    unit: Arc<XoUnit>,
    registry: Arc<MetadataRegistry>,
    datastore: Rc<dyn DatastoreSession>,
    entities: Rc<InstanceManager<Entity>>,
    relations: Rc<InstanceManager<Relation>>,
    entity_sync: Rc<EntityCacheSynchronization>,
    relation_sync: Rc<RelationCacheSynchronization>,
    cursors: Rc<CursorSynchronization>,
    validator: Rc<InstanceValidator>,
    transaction: Rc<XoTransaction>,
    interceptors: InterceptorChain,
    entity_properties: EntityPropertyManager,
    relation_properties: RelationPropertyManager,
    this: Weak<SessionContext>,
    closed: Cell<bool>,
}

impl SessionContext {
    pub(crate) fn new(
        unit: Arc<XoUnit>,
        registry: Arc<MetadataRegistry>,
        datastore: Box<dyn DatastoreSession>,
        validators: Vec<Arc<dyn ConstraintValidator>>,
        interceptors: Vec<Box<dyn Interceptor>>,
    ) -> Rc<Self> {
        let datastore: Rc<dyn DatastoreSession> = Rc::from(datastore);
        Rc::new_cyclic(|this| {
            let entities = Rc::new(InstanceManager::new(
                registry.clone(),
                datastore.clone(),
                Rc::new(RefCell::new(TransactionalCache::new())),
                this.clone(),
            ));
            let relations = Rc::new(InstanceManager::new(
                registry.clone(),
                datastore.clone(),
                Rc::new(RefCell::new(TransactionalCache::new())),
                this.clone(),
            ));
            let validator = Rc::new(InstanceValidator::new(
                entities.cache().clone(),
                relations.cache().clone(),
                validators,
            ));
            let entity_sync = Rc::new(EntityCacheSynchronization::new(
                "entity cache",
                entities.clone(),
                datastore.clone(),
            ));
            let relation_sync = Rc::new(RelationCacheSynchronization::new(
                "relation cache",
                relations.clone(),
                datastore.clone(),
            ));

            let transaction = Rc::new(XoTransaction::new(datastore.clone()));
            transaction.register_default_synchronization(Rc::new(ValidatorSynchronization::new(
                validator.clone(),
                unit.validation_mode,
            )));
            transaction.register_default_synchronization(entity_sync.clone());
            transaction.register_default_synchronization(relation_sync.clone());
            let cursors = Rc::new(CursorSynchronization::default());
            transaction.register_default_synchronization(cursors.clone());

            let mut chain = InterceptorChain::new(vec![Box::new(TransactionInterceptor::new(
                transaction.clone(),
            ))]);
            for interceptor in interceptors {
                chain.push(interceptor);
            }

            debug!(unit = %unit.name, interceptors = ?chain.names(), "session opened");
            Self {
                entity_properties: EntityPropertyManager::new(
                    datastore.clone(),
                    entities.clone(),
                    relations.clone(),
                ),
                relation_properties: RelationPropertyManager::new(
                    datastore.clone(),
                    entities.clone(),
                    relations.clone(),
                ),
                unit,
                registry,
                datastore,
                entities,
                relations,
                entity_sync,
                relation_sync,
                cursors,
                validator,
                transaction,
                interceptors: chain,
                this: this.clone(),
                closed: Cell::new(false),
            }
        })
    }

    pub fn unit(&self) -> &XoUnit {
        &self.unit
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn datastore(&self) -> &dyn DatastoreSession {
        self.datastore.as_ref()
    }

    pub fn entity_instances(&self) -> &InstanceManager<Entity> {
        &self.entities
    }

    pub fn relation_instances(&self) -> &InstanceManager<Relation> {
        &self.relations
    }

    pub fn entity_properties(&self) -> &EntityPropertyManager {
        &self.entity_properties
    }

    pub fn relation_properties(&self) -> &RelationPropertyManager {
        &self.relation_properties
    }

    pub fn entity_synchronization(&self) -> &EntityCacheSynchronization {
        &self.entity_sync
    }

    pub fn relation_synchronization(&self) -> &RelationCacheSynchronization {
        &self.relation_sync
    }

    pub fn cursors(&self) -> &CursorSynchronization {
        &self.cursors
    }

    /// Tie `cursor` to the active transaction, if any, so that it is closed
    /// when the transaction completes.
    pub(crate) fn track_cursor<T: 'static>(&self, cursor: &SharedCursor<T>) {
        if self.transaction.is_active() {
            let cursor: Rc<dyn CloseCursor> = cursor.clone();
            self.cursors.track(Rc::downgrade(&cursor));
        }
    }

    pub fn validator(&self) -> &InstanceValidator {
        &self.validator
    }

    pub fn transaction(&self) -> &Rc<XoTransaction> {
        &self.transaction
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub(crate) fn weak(&self) -> Weak<SessionContext> {
        self.this.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn ensure_open(&self) -> XoResult<()> {
        if self.closed.get() {
            return Err(XoError::SessionClosed);
        }
        Ok(())
    }

    /// Run `f` through the interceptor chain under the unit's transaction
    /// attribute.
    pub fn intercept<T>(&self, operation: &str, f: impl FnOnce() -> XoResult<T>) -> XoResult<T> {
        let context = InvocationContext {
            operation,
            attribute: self.unit.transaction_attribute,
        };
        self.interceptors.invoke(&context, f)
    }

    /// Release the session. An active transaction is rolled back.
    pub(crate) fn close(&self) -> XoResult<()> {
        if self.closed.get() {
            return Ok(());
        }
        let rollback = if self.transaction.is_active() {
            tracing::warn!(unit = %self.unit.name, "session closed with an active transaction; rolling back");
            self.transaction.rollback()
        } else {
            Ok(())
        };
        self.entities.close();
        self.relations.close();
        self.closed.set(true);
        let datastore = self.datastore.close();
        debug!(unit = %self.unit.name, "session closed");
        rollback?;
        Ok(datastore?)
    }
}
