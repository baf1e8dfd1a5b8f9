//! Managed instances and the identity map binding them to records.
//!
//! An [`Instance`] wraps exactly one datastore record together with the
//! type tags it was resolved to. The [`InstanceManager`] of a session
//! hands out at most one live instance per record, so equality of
//! instances is pointer equality.
//!
//! # Lifecycle
//!
//! 1. `get_instance` creates the instance on first access and registers it
//!    in the identity map and in the transactional cache.
//! 2. `remove_instance` unregisters it. The instance stays readable so a
//!    migration strategy can still copy data out of it.
//! 3. `destroy_instance` retires it for good. Every later access fails
//!    with [`XoError::UnmanagedInstance`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::debug;
use xo_api::{FromValue, RecordId, Value, XoError, XoResult};
use xo_spi::{DatastoreSession, Entity, Record, Relation};

use crate::cache::TransactionalCache;
use crate::metadata::{accessor, MetadataRegistry, TypeMetadata};
use crate::proxy::{self, Argument, EntityCollection, Return};
use crate::session::SessionContext;

/// Record kinds the core can manage.
pub trait ManagedRecord: Record {
    /// Resolve the declared types a record currently represents.
    fn resolve_types(
        datastore: &dyn DatastoreSession,
        registry: &MetadataRegistry,
        record: &Self,
    ) -> XoResult<Vec<Arc<TypeMetadata>>>;

    /// Persist pending changes of the record.
    fn flush(datastore: &dyn DatastoreSession, record: &Self) -> XoResult<()>;

    fn object(instance: Instance<Self>) -> ManagedObject;
}

impl ManagedRecord for Entity {
    fn resolve_types(
        datastore: &dyn DatastoreSession,
        registry: &MetadataRegistry,
        record: &Self,
    ) -> XoResult<Vec<Arc<TypeMetadata>>> {
        let discriminators = datastore.entity_discriminators(record)?;
        let types = registry.types_for_discriminators(&discriminators);
        if types.is_empty() {
            return Err(XoError::UnknownType(format!(
                "no entity type matches discriminators {discriminators:?} of {record:?}"
            )));
        }
        Ok(types)
    }

    fn flush(datastore: &dyn DatastoreSession, record: &Self) -> XoResult<()> {
        Ok(datastore.flush_entity(record)?)
    }

    fn object(instance: Instance<Self>) -> ManagedObject {
        ManagedObject::Entity(instance)
    }
}

impl ManagedRecord for Relation {
    fn resolve_types(
        datastore: &dyn DatastoreSession,
        registry: &MetadataRegistry,
        record: &Self,
    ) -> XoResult<Vec<Arc<TypeMetadata>>> {
        let discriminator = datastore.relation_discriminator(record)?;
        Ok(vec![registry.relation_type_for_discriminator(&discriminator)?])
    }

    fn flush(datastore: &dyn DatastoreSession, record: &Self) -> XoResult<()> {
        Ok(datastore.flush_relation(record)?)
    }

    fn object(instance: Instance<Self>) -> ManagedObject {
        ManagedObject::Relation(instance)
    }
}

struct InstanceInner<R> {
    record: R,
    types: Vec<Arc<TypeMetadata>>,
    session: Weak<SessionContext>,
    destroyed: Cell<bool>,
}

/// A typed view of one datastore record.
///
/// Cloning is cheap and yields the same logical instance.
pub struct Instance<R> {
    inner: Rc<InstanceInner<R>>,
}

pub type EntityInstance = Instance<Entity>;
pub type RelationInstance = Instance<Relation>;

impl<R> Clone for Instance<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<R> PartialEq for Instance<R> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<R> Eq for Instance<R> {}

impl<R: ManagedRecord> Instance<R> {
    fn new(record: R, types: Vec<Arc<TypeMetadata>>, session: Weak<SessionContext>) -> Self {
        Self {
            inner: Rc::new(InstanceInner {
                record,
                types,
                session,
                destroyed: Cell::new(false),
            }),
        }
    }

    pub fn id(&self) -> &RecordId {
        self.inner.record.id()
    }

    pub(crate) fn record(&self) -> &R {
        &self.inner.record
    }

    /// Type tags of this instance, most specific first.
    pub fn types(&self) -> &[Arc<TypeMetadata>] {
        &self.inner.types
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.inner.types.iter().map(|t| t.name()).collect()
    }

    /// Whether the instance carries `type_name` or one of its sub types.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.inner.types.iter().any(|t| t.is_a(type_name))
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    pub(crate) fn belongs_to(&self, session: &Weak<SessionContext>) -> bool {
        Weak::ptr_eq(&self.inner.session, session)
    }

    pub(crate) fn session(&self) -> XoResult<Rc<SessionContext>> {
        let session = self.inner.session.upgrade().ok_or(XoError::SessionClosed)?;
        session.ensure_open()?;
        Ok(session)
    }

    pub fn to_object(&self) -> ManagedObject {
        R::object(self.clone())
    }

    /// Invoke a declared method by name.
    pub fn call(&self, method: &str, args: &[Argument]) -> XoResult<Return> {
        let session = self.session()?;
        proxy::invoke(&session, &self.to_object(), method, args)
    }

    /// Read scalar property `property`. Absent values read as `None`.
    pub fn get<T: FromValue>(&self, property: &str) -> XoResult<Option<T>> {
        let value = self.call(&accessor("get", property), &[])?.into_value()?;
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(&value)
            .map(Some)
            .ok_or_else(|| XoError::UnsupportedPropertyType {
                property: property.to_string(),
                type_name: format!("{} (stored value is {})", T::TYPE_NAME, value.type_name()),
            })
    }

    /// Write scalar property `property`. Writing null removes it.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> XoResult<()> {
        self.call(&accessor("set", property), &[Argument::Value(value.into())])?;
        Ok(())
    }
}

impl Instance<Entity> {
    /// Entity referenced by the single valued property `property`.
    pub fn reference(&self, property: &str) -> XoResult<Option<EntityInstance>> {
        self.call(&accessor("get", property), &[])?.into_entity()
    }

    /// Replace the reference held by `property`; `None` clears it.
    pub fn set_reference(&self, property: &str, target: Option<&EntityInstance>) -> XoResult<()> {
        self.call(&accessor("set", property), &[Argument::Entity(target.cloned())])?;
        Ok(())
    }

    /// Live view of the collection property `property`.
    pub fn collection(&self, property: &str) -> XoResult<EntityCollection> {
        self.call(&accessor("get", property), &[])?.into_collection()
    }

    /// Replace every element of `property` with `targets`, in order.
    pub fn set_collection(&self, property: &str, targets: &[EntityInstance]) -> XoResult<()> {
        self.call(&accessor("set", property), &[Argument::Entities(targets.to_vec())])?;
        Ok(())
    }

    /// View this instance as proxy type `T`.
    pub fn as_type<T: EntityProxy>(&self) -> XoResult<T> {
        if !self.has_type(T::TYPE) {
            return Err(XoError::invalid_argument(
                "as_type",
                format!("{self} is not a {}", T::TYPE),
            ));
        }
        Ok(T::wrap(self.clone()))
    }
}

impl Instance<Relation> {
    pub fn from(&self) -> XoResult<EntityInstance> {
        self.call("getFrom", &[])?
            .into_entity()?
            .ok_or_else(|| XoError::UnmanagedInstance(format!("source of {self}")))
    }

    pub fn to(&self) -> XoResult<EntityInstance> {
        self.call("getTo", &[])?
            .into_entity()?
            .ok_or_else(|| XoError::UnmanagedInstance(format!("target of {self}")))
    }

    pub fn as_type<T: RelationProxy>(&self) -> XoResult<T> {
        if !self.has_type(T::TYPE) {
            return Err(XoError::invalid_argument(
                "as_type",
                format!("{self} is not a {}", T::TYPE),
            ));
        }
        Ok(T::wrap(self.clone()))
    }
}

impl<R: ManagedRecord> fmt::Display for Instance<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, id={}", self.type_names().join("|"), self.id())
    }
}

impl<R: ManagedRecord> fmt::Debug for Instance<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("kind", &R::KIND)
            .field("id", self.id())
            .field("types", &self.type_names())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Either kind of managed instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagedObject {
    Entity(EntityInstance),
    Relation(RelationInstance),
}

impl ManagedObject {
    pub fn id(&self) -> &RecordId {
        match self {
            Self::Entity(e) => e.id(),
            Self::Relation(r) => r.id(),
        }
    }

    pub fn types(&self) -> &[Arc<TypeMetadata>] {
        match self {
            Self::Entity(e) => e.types(),
            Self::Relation(r) => r.types(),
        }
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.types().iter().map(|t| t.name()).collect()
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.types().iter().any(|t| t.is_a(type_name))
    }

    pub fn call(&self, method: &str, args: &[Argument]) -> XoResult<Return> {
        match self {
            Self::Entity(e) => e.call(method, args),
            Self::Relation(r) => r.call(method, args),
        }
    }

    pub fn get<T: FromValue>(&self, property: &str) -> XoResult<Option<T>> {
        match self {
            Self::Entity(e) => e.get(property),
            Self::Relation(r) => r.get(property),
        }
    }

    pub fn set(&self, property: &str, value: impl Into<Value>) -> XoResult<()> {
        match self {
            Self::Entity(e) => e.set(property, value),
            Self::Relation(r) => r.set(property, value),
        }
    }

    pub fn as_entity(&self) -> Option<&EntityInstance> {
        match self {
            Self::Entity(e) => Some(e),
            Self::Relation(_) => None,
        }
    }

    pub fn as_relation(&self) -> Option<&RelationInstance> {
        match self {
            Self::Relation(r) => Some(r),
            Self::Entity(_) => None,
        }
    }

    pub(crate) fn session(&self) -> XoResult<Rc<SessionContext>> {
        match self {
            Self::Entity(e) => e.session(),
            Self::Relation(r) => r.session(),
        }
    }
}

impl fmt::Display for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(e) => fmt::Display::fmt(e, f),
            Self::Relation(r) => fmt::Display::fmt(r, f),
        }
    }
}

impl From<EntityInstance> for ManagedObject {
    fn from(instance: EntityInstance) -> Self {
        Self::Entity(instance)
    }
}

impl From<&EntityInstance> for ManagedObject {
    fn from(instance: &EntityInstance) -> Self {
        Self::Entity(instance.clone())
    }
}

impl From<RelationInstance> for ManagedObject {
    fn from(instance: RelationInstance) -> Self {
        Self::Relation(instance)
    }
}

impl From<&RelationInstance> for ManagedObject {
    fn from(instance: &RelationInstance) -> Self {
        Self::Relation(instance.clone())
    }
}

impl From<CompositeObject> for ManagedObject {
    fn from(object: CompositeObject) -> Self {
        object.0
    }
}

impl From<&CompositeObject> for ManagedObject {
    fn from(object: &CompositeObject) -> Self {
        object.0.clone()
    }
}

/// An instance satisfying every type it was created or migrated with.
///
/// `as_type` is a capability check against the instance's type tags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeObject(ManagedObject);

impl CompositeObject {
    pub fn new(object: impl Into<ManagedObject>) -> Self {
        Self(object.into())
    }

    pub fn id(&self) -> &RecordId {
        self.0.id()
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.0.type_names()
    }

    pub fn object(&self) -> &ManagedObject {
        &self.0
    }

    pub fn as_entity(&self) -> XoResult<&EntityInstance> {
        self.0
            .as_entity()
            .ok_or_else(|| XoError::invalid_argument("as_entity", format!("{} is a relation", self.0)))
    }

    pub fn as_relation(&self) -> XoResult<&RelationInstance> {
        self.0
            .as_relation()
            .ok_or_else(|| XoError::invalid_argument("as_relation", format!("{} is an entity", self.0)))
    }

    pub fn as_type<T: EntityProxy>(&self) -> XoResult<T> {
        self.as_entity()?.as_type()
    }

    pub fn as_relation_type<T: RelationProxy>(&self) -> XoResult<T> {
        self.as_relation()?.as_type()
    }
}

impl fmt::Display for CompositeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Typed Rust handle over an entity instance of declared type `TYPE`.
pub trait EntityProxy: Sized {
    const TYPE: &'static str;

    fn wrap(instance: EntityInstance) -> Self;

    fn instance(&self) -> &EntityInstance;
}

/// Typed Rust handle over a relation instance of declared type `TYPE`.
pub trait RelationProxy: Sized {
    const TYPE: &'static str;

    fn wrap(instance: RelationInstance) -> Self;

    fn instance(&self) -> &RelationInstance;
}

/// Identity map of one session for one record kind.
pub struct InstanceManager<R: ManagedRecord> {
    registry: Arc<MetadataRegistry>,
    datastore: Rc<dyn DatastoreSession>,
    cache: Rc<RefCell<TransactionalCache<Instance<R>>>>,
    session: Weak<SessionContext>,
    instances: RefCell<HashMap<RecordId, Instance<R>>>,
    closed: Cell<bool>,
}

impl<R: ManagedRecord> InstanceManager<R> {
    pub(crate) fn new(
        registry: Arc<MetadataRegistry>,
        datastore: Rc<dyn DatastoreSession>,
        cache: Rc<RefCell<TransactionalCache<Instance<R>>>>,
        session: Weak<SessionContext>,
    ) -> Self {
        Self {
            registry,
            datastore,
            cache,
            session,
            instances: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
        }
    }

    /// The canonical instance of `record`, created on first access.
    pub fn get_instance(&self, record: &R) -> XoResult<Instance<R>> {
        if self.closed.get() {
            return Err(XoError::SessionClosed);
        }
        if let Some(instance) = self.instances.borrow().get(record.id()) {
            return Ok(instance.clone());
        }
        let types = R::resolve_types(self.datastore.as_ref(), &self.registry, record)?;
        let instance = Instance::new(record.clone(), types, self.session.clone());
        debug!(kind = R::KIND, id = %record.id(), types = ?instance.type_names(), "instance created");
        self.instances
            .borrow_mut()
            .insert(record.id().clone(), instance.clone());
        self.cache
            .borrow_mut()
            .put(record.id().clone(), instance.clone());
        Ok(instance)
    }

    /// Registered instance of the record with `id`, if any.
    pub fn instance_for_record(&self, id: &RecordId) -> Option<Instance<R>> {
        self.instances.borrow().get(id).cloned()
    }

    /// Whether `instance` was produced by this manager and is still registered.
    pub fn is_instance(&self, instance: &Instance<R>) -> bool {
        !instance.is_destroyed()
            && instance.belongs_to(&self.session)
            && self
                .instances
                .borrow()
                .get(instance.id())
                .is_some_and(|registered| registered == instance)
    }

    /// Backing record of `instance`.
    pub fn get_datastore_type(&self, instance: &Instance<R>) -> XoResult<R> {
        if instance.is_destroyed() || !instance.belongs_to(&self.session) {
            return Err(XoError::UnmanagedInstance(instance.to_string()));
        }
        Ok(instance.record().clone())
    }

    /// Unregister `instance` without retiring it.
    pub fn remove_instance(&self, instance: &Instance<R>) {
        let mut instances = self.instances.borrow_mut();
        if instances.get(instance.id()) == Some(instance) {
            instances.remove(instance.id());
            self.cache.borrow_mut().remove(instance.id());
            debug!(kind = R::KIND, id = %instance.id(), "instance removed");
        }
    }

    /// Register `instance` again as the canonical instance of its record.
    pub(crate) fn restore_instance(&self, instance: &Instance<R>) {
        self.instances
            .borrow_mut()
            .insert(instance.id().clone(), instance.clone());
        self.cache
            .borrow_mut()
            .put(instance.id().clone(), instance.clone());
    }

    /// Retire `instance`; every later access to it fails.
    pub fn destroy_instance(&self, instance: &Instance<R>) {
        instance.inner.destroyed.set(true);
    }

    /// Retire `instance` unless its record still resolves to the same types.
    /// Returns whether it was retired.
    pub fn retire_if_stale(&self, instance: &Instance<R>) -> bool {
        let current = R::resolve_types(self.datastore.as_ref(), &self.registry, instance.record());
        let unchanged = current.is_ok_and(|types| {
            types.iter().map(|t| t.name()).eq(instance.type_names())
        });
        if unchanged {
            return false;
        }
        self.remove_instance(instance);
        self.destroy_instance(instance);
        true
    }

    /// Mark `instance` as having state to flush in this transaction.
    pub fn touch(&self, instance: &Instance<R>) {
        self.cache
            .borrow_mut()
            .put(instance.id().clone(), instance.clone());
    }

    pub fn cache(&self) -> &Rc<RefCell<TransactionalCache<Instance<R>>>> {
        &self.cache
    }

    pub fn len(&self) -> usize {
        self.instances.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.borrow().is_empty()
    }

    /// Drop and retire every registered instance.
    pub fn close(&self) {
        let instances: Vec<Instance<R>> = self
            .instances
            .borrow_mut()
            .drain()
            .map(|(_, instance)| instance)
            .collect();
        for instance in &instances {
            self.destroy_instance(instance);
        }
        self.cache.borrow_mut().after_completion(false);
        self.closed.set(true);
        debug!(kind = R::KIND, retired = instances.len(), "instance manager closed");
    }
}
