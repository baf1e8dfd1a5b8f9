//! Method dispatch for managed instances.
//!
//! Every declared method resolves to one [`MethodMetadata`] variant when
//! the registry is built. An invocation looks the variant up in the
//! instance's type tags, runs it through the session's interceptor chain
//! and dispatches on the variant.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Weak;

use xo_api::{RecordId, Value, XoError, XoResult};

use crate::instance::{EntityInstance, ManagedObject, RelationInstance};
use crate::interceptor::InvocationContext;
use crate::metadata::{resolve_method, CollectionType, LifecycleMethod, MethodMetadata, RelationRef};
use crate::session::SessionContext;

/// Argument of a proxied method call.
#[derive(Clone, Debug)]
pub enum Argument {
    Value(Value),
    Entity(Option<EntityInstance>),
    Entities(Vec<EntityInstance>),
    Object(ManagedObject),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Self::Value(value.into())
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Self::Value(value.into())
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Self::Value(value.into())
    }
}

impl From<i32> for Argument {
    fn from(value: i32) -> Self {
        Self::Value(value.into())
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Self::Value(value.into())
    }
}

impl From<EntityInstance> for Argument {
    fn from(instance: EntityInstance) -> Self {
        Self::Entity(Some(instance))
    }
}

impl From<&EntityInstance> for Argument {
    fn from(instance: &EntityInstance) -> Self {
        Self::Entity(Some(instance.clone()))
    }
}

impl From<Vec<EntityInstance>> for Argument {
    fn from(instances: Vec<EntityInstance>) -> Self {
        Self::Entities(instances)
    }
}

impl From<RelationInstance> for Argument {
    fn from(instance: RelationInstance) -> Self {
        Self::Object(ManagedObject::Relation(instance))
    }
}

impl From<ManagedObject> for Argument {
    fn from(object: ManagedObject) -> Self {
        Self::Object(object)
    }
}

/// Result of a proxied method call.
#[derive(Debug)]
pub enum Return {
    Unit,
    Value(Value),
    Entity(Option<EntityInstance>),
    Relation(RelationInstance),
    Collection(EntityCollection),
    Id(RecordId),
}

impl Return {
    fn mismatch(&self, expected: &str) -> XoError {
        XoError::invalid_argument("return", format!("expected {expected}, got {self:?}"))
    }

    pub fn into_value(self) -> XoResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Id(id) => Ok(Value::from(id.to_string())),
            other => Err(other.mismatch("a value")),
        }
    }

    pub fn into_entity(self) -> XoResult<Option<EntityInstance>> {
        match self {
            Self::Entity(entity) => Ok(entity),
            other => Err(other.mismatch("an entity")),
        }
    }

    pub fn into_relation(self) -> XoResult<RelationInstance> {
        match self {
            Self::Relation(relation) => Ok(relation),
            other => Err(other.mismatch("a relation")),
        }
    }

    pub fn into_collection(self) -> XoResult<EntityCollection> {
        match self {
            Self::Collection(collection) => Ok(collection),
            other => Err(other.mismatch("a collection")),
        }
    }
}

/// User supplied behavior bound to a declared method.
pub trait ProxyMethod: Send + Sync {
    fn invoke(&self, instance: &ManagedObject, args: &[Argument]) -> XoResult<Return>;
}

impl<F> ProxyMethod for F
where
    F: Fn(&ManagedObject, &[Argument]) -> XoResult<Return> + Send + Sync,
{
    fn invoke(&self, instance: &ManagedObject, args: &[Argument]) -> XoResult<Return> {
        self(instance, args)
    }
}

/// Invoke `method` on `object` through the interceptor chain.
pub fn invoke(
    session: &SessionContext,
    object: &ManagedObject,
    method: &str,
    args: &[Argument],
) -> XoResult<Return> {
    let metadata = resolve_method(object.types(), method)
        .cloned()
        .ok_or_else(|| XoError::UnknownMethod {
            type_name: object.type_names().join("|"),
            method: method.to_string(),
        })?;
    let context = InvocationContext {
        operation: method,
        attribute: metadata
            .transaction_attribute()
            .unwrap_or(session.unit().transaction_attribute),
    };
    session
        .interceptors()
        .invoke(&context, || dispatch(session, object, method, &metadata, args))
}

fn entity_of<'a>(object: &'a ManagedObject, method: &str) -> XoResult<&'a EntityInstance> {
    object
        .as_entity()
        .ok_or_else(|| XoError::invalid_argument(method, format!("{object} is not an entity")))
}

fn relation_of<'a>(object: &'a ManagedObject, method: &str) -> XoResult<&'a RelationInstance> {
    object
        .as_relation()
        .ok_or_else(|| XoError::invalid_argument(method, format!("{object} is not a relation")))
}

fn argument<'a>(args: &'a [Argument], method: &str) -> XoResult<&'a Argument> {
    args.first()
        .ok_or_else(|| XoError::invalid_argument(method, "missing argument"))
}

fn value_argument(args: &[Argument], method: &str) -> XoResult<Value> {
    match argument(args, method)? {
        Argument::Value(value) => Ok(value.clone()),
        other => Err(XoError::invalid_argument(method, format!("expected a value, got {other:?}"))),
    }
}

fn entity_argument(args: &[Argument], method: &str) -> XoResult<Option<EntityInstance>> {
    match argument(args, method)? {
        Argument::Entity(entity) => Ok(entity.clone()),
        Argument::Object(ManagedObject::Entity(entity)) => Ok(Some(entity.clone())),
        Argument::Value(Value::Null) => Ok(None),
        other => Err(XoError::invalid_argument(method, format!("expected an entity, got {other:?}"))),
    }
}

fn entities_argument(args: &[Argument], method: &str) -> XoResult<Vec<EntityInstance>> {
    match argument(args, method)? {
        Argument::Entities(entities) => Ok(entities.clone()),
        Argument::Entity(entity) => Ok(entity.iter().cloned().collect()),
        other => Err(XoError::invalid_argument(method, format!("expected entities, got {other:?}"))),
    }
}

fn dispatch(
    session: &SessionContext,
    object: &ManagedObject,
    method: &str,
    metadata: &MethodMetadata,
    args: &[Argument],
) -> XoResult<Return> {
    match metadata {
        MethodMetadata::PropertyGet { property } => {
            let value = match object {
                ManagedObject::Entity(e) => session.entity_properties().get_property(e, property)?,
                ManagedObject::Relation(r) => session.relation_properties().get_property(r, property)?,
            };
            Ok(Return::Value(value))
        }
        MethodMetadata::PropertySet { property } => {
            let value = value_argument(args, method)?;
            match object {
                ManagedObject::Entity(e) => session.entity_properties().set_property(e, property, value)?,
                ManagedObject::Relation(r) => {
                    session.relation_properties().set_property(r, property, value)?
                }
            }
            Ok(Return::Unit)
        }
        MethodMetadata::ReferenceGet { relation, .. } => {
            let entity = entity_of(object, method)?;
            Ok(Return::Entity(
                session.entity_properties().get_single_reference(entity, relation)?,
            ))
        }
        MethodMetadata::ReferenceSet { relation, .. } => {
            let entity = entity_of(object, method)?;
            let target = entity_argument(args, method)?;
            session
                .entity_properties()
                .set_single_reference(entity, relation, target.as_ref())?;
            Ok(Return::Unit)
        }
        MethodMetadata::CollectionGet {
            property,
            relation,
            collection,
        } => {
            let entity = entity_of(object, method)?;
            if matches!(collection, CollectionType::Map | CollectionType::Queue) {
                return Err(XoError::UnsupportedPropertyType {
                    property: property.clone(),
                    type_name: collection.to_string(),
                });
            }
            Ok(Return::Collection(EntityCollection {
                session: session.weak(),
                owner: entity.clone(),
                property: property.clone(),
                relation: relation.clone(),
                kind: *collection,
            }))
        }
        MethodMetadata::CollectionSet {
            relation, collection, ..
        } => {
            let entity = entity_of(object, method)?;
            let mut targets = entities_argument(args, method)?;
            if *collection == CollectionType::Set {
                let mut seen = HashSet::new();
                targets.retain(|target| seen.insert(target.id().clone()));
            }
            let properties = session.entity_properties();
            // Not atomic: a failing add leaves the earlier elements in place.
            properties.remove_references(entity, relation)?;
            for target in &targets {
                properties.create_reference(entity, relation, target)?;
            }
            Ok(Return::Unit)
        }
        MethodMetadata::RelationFrom => {
            let relation = relation_of(object, method)?;
            Ok(Return::Entity(Some(session.relation_properties().from(relation)?)))
        }
        MethodMetadata::RelationTo => {
            let relation = relation_of(object, method)?;
            Ok(Return::Entity(Some(session.relation_properties().to(relation)?)))
        }
        MethodMetadata::Lifecycle(lifecycle) => lifecycle_method(object, *lifecycle, args),
        MethodMetadata::Custom { method: custom, .. } => custom.invoke(object, args),
    }
}

fn lifecycle_method(object: &ManagedObject, lifecycle: LifecycleMethod, args: &[Argument]) -> XoResult<Return> {
    match lifecycle {
        LifecycleMethod::ToString => Ok(Return::Value(Value::String(object.to_string()))),
        LifecycleMethod::Equals => {
            let equal = match (object, args.first()) {
                (ManagedObject::Entity(e), Some(Argument::Entity(Some(other))))
                | (ManagedObject::Entity(e), Some(Argument::Object(ManagedObject::Entity(other)))) => {
                    e.id() == other.id()
                }
                (ManagedObject::Relation(r), Some(Argument::Object(ManagedObject::Relation(other)))) => {
                    r.id() == other.id()
                }
                _ => false,
            };
            Ok(Return::Value(Value::Bool(equal)))
        }
        LifecycleMethod::HashCode => {
            let mut hasher = DefaultHasher::new();
            object.id().hash(&mut hasher);
            Ok(Return::Value(Value::Int(hasher.finish() as i64)))
        }
        LifecycleMethod::Id => Ok(Return::Id(object.id().clone())),
    }
}

/// Live view of a collection property.
///
/// Nothing is buffered: reads query the datastore and every `add` or
/// `remove` creates or deletes one relation right away.
#[derive(Clone)]
pub struct EntityCollection {
    session: Weak<SessionContext>,
    owner: EntityInstance,
    property: String,
    relation: RelationRef,
    kind: CollectionType,
}

impl EntityCollection {
    pub fn kind(&self) -> CollectionType {
        self.kind
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn owner(&self) -> &EntityInstance {
        &self.owner
    }

    fn run<T>(&self, operation: &str, f: impl FnOnce(&SessionContext) -> XoResult<T>) -> XoResult<T> {
        let session = self.session.upgrade().ok_or(XoError::SessionClosed)?;
        session.ensure_open()?;
        session.intercept(operation, || f(&session))
    }

    pub fn len(&self) -> XoResult<usize> {
        self.run("size", |s| {
            Ok(s.entity_properties()
                .relation_records(&self.owner, &self.relation)?
                .len())
        })
    }

    pub fn is_empty(&self) -> XoResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Lazily resolved elements. Relations are listed up front, their far
    /// ends are resolved one by one as the iterator advances.
    pub fn iter(&self) -> XoResult<CollectionIter> {
        let records = self.run("iterator", |s| {
            s.entity_properties().relation_records(&self.owner, &self.relation)
        })?;
        Ok(CollectionIter {
            collection: self.clone(),
            records: records.into_iter(),
        })
    }

    pub fn to_vec(&self) -> XoResult<Vec<EntityInstance>> {
        self.run("toArray", |s| s.entity_properties().references(&self.owner, &self.relation))
    }

    pub fn contains(&self, entity: &EntityInstance) -> XoResult<bool> {
        Ok(self.to_vec()?.contains(entity))
    }

    /// Add `entity`. A `Set` ignores elements it already holds.
    pub fn add(&self, entity: &EntityInstance) -> XoResult<bool> {
        self.run("add", |s| {
            let properties = s.entity_properties();
            if self.kind == CollectionType::Set
                && properties.references(&self.owner, &self.relation)?.contains(entity)
            {
                return Ok(false);
            }
            properties.create_reference(&self.owner, &self.relation, entity)?;
            Ok(true)
        })
    }

    pub fn remove(&self, entity: &EntityInstance) -> XoResult<bool> {
        self.run("remove", |s| {
            s.entity_properties()
                .remove_reference(&self.owner, &self.relation, entity)
        })
    }

    pub fn clear(&self) -> XoResult<()> {
        self.run("clear", |s| {
            s.entity_properties()
                .remove_references(&self.owner, &self.relation)?;
            Ok(())
        })
    }

    /// Element at `index`; only `List` collections are indexed.
    pub fn get(&self, index: usize) -> XoResult<Option<EntityInstance>> {
        if self.kind != CollectionType::List {
            return Err(XoError::invalid_argument(
                "get",
                format!("{} collection '{}' is not indexed", self.kind, self.property),
            ));
        }
        Ok(self.to_vec()?.into_iter().nth(index))
    }
}

impl fmt::Debug for EntityCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCollection")
            .field("owner", &self.owner.id())
            .field("property", &self.property)
            .field("relation", &self.relation.relation)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Iterator over an [`EntityCollection`].
pub struct CollectionIter {
    collection: EntityCollection,
    records: std::vec::IntoIter<xo_spi::Relation>,
}

impl Iterator for CollectionIter {
    type Item = XoResult<EntityInstance>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let direction = self.collection.relation.direction;
        Some(self.collection.run("next", |s| {
            s.entity_properties().opposite(&record, direction)
        }))
    }
}

