//! Declared types and the registry resolving them.
//!
//! Application code declares entity, relation and query types through the
//! builders in this module. [`MetadataRegistry::builder`] validates the
//! declarations and flattens every type into a method table (own methods
//! plus inherited ones) once, before any session exists. The registry is
//! immutable afterwards and shared through an `Arc`.
//!
//! Method names follow accessor conventions: a property `name` yields
//! `getName` and `setName`, relation instances expose `getFrom` and `getTo`,
//! and every instance answers `toString`, `equals`, `hashCode` and `getId`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use xo_api::{TransactionAttribute, XoError, XoResult};
use xo_spi::{DatastoreEntityMetadata, DatastoreRelationMetadata, Direction};

use crate::proxy::ProxyMethod;

/// Build the accessor name for `property`, e.g. `("get", "name") -> "getName"`.
pub fn accessor(prefix: &str, property: &str) -> String {
    let mut chars = property.chars();
    match chars.next() {
        Some(first) => format!("{prefix}{}{}", first.to_uppercase(), chars.as_str()),
        None => prefix.to_string(),
    }
}

/// Declared shape of a collection property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollectionType {
    /// No duplicates.
    Set,
    /// Ordered, duplicates allowed, indexed access.
    List,
    /// Unordered, duplicates allowed.
    Collection,
    /// Declared but not mappable to a relation set.
    Map,
    /// Declared but not mappable to a relation set.
    Queue,
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Set => "Set",
            Self::List => "List",
            Self::Collection => "Collection",
            Self::Map => "Map",
            Self::Queue => "Queue",
        };
        f.write_str(name)
    }
}

/// Methods every managed instance answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleMethod {
    ToString,
    Equals,
    HashCode,
    Id,
}

/// A reference from an entity property to a relation type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationRef {
    /// Declared relation type name.
    pub relation: String,
    /// Relationship type in the datastore.
    pub discriminator: String,
    /// Direction of the relation seen from the owning entity.
    pub direction: Direction,
}

/// What a method of a declared type does when invoked.
#[derive(Clone)]
pub enum MethodMetadata {
    PropertyGet {
        property: String,
    },
    PropertySet {
        property: String,
    },
    ReferenceGet {
        property: String,
        relation: RelationRef,
    },
    ReferenceSet {
        property: String,
        relation: RelationRef,
    },
    CollectionGet {
        property: String,
        relation: RelationRef,
        collection: CollectionType,
    },
    CollectionSet {
        property: String,
        relation: RelationRef,
        collection: CollectionType,
    },
    RelationFrom,
    RelationTo,
    Lifecycle(LifecycleMethod),
    /// User supplied behavior, optionally overriding the unit's
    /// transaction attribute.
    Custom {
        method: Arc<dyn ProxyMethod>,
        attribute: Option<TransactionAttribute>,
    },
}

impl MethodMetadata {
    pub fn transaction_attribute(&self) -> Option<TransactionAttribute> {
        match self {
            Self::Custom { attribute, .. } => *attribute,
            _ => None,
        }
    }
}

impl fmt::Debug for MethodMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PropertyGet { property } => write!(f, "PropertyGet({property})"),
            Self::PropertySet { property } => write!(f, "PropertySet({property})"),
            Self::ReferenceGet { property, relation } => {
                write!(f, "ReferenceGet({property}, {})", relation.relation)
            }
            Self::ReferenceSet { property, relation } => {
                write!(f, "ReferenceSet({property}, {})", relation.relation)
            }
            Self::CollectionGet {
                property,
                relation,
                collection,
            } => write!(f, "CollectionGet({property}, {}, {collection})", relation.relation),
            Self::CollectionSet {
                property,
                relation,
                collection,
            } => write!(f, "CollectionSet({property}, {}, {collection})", relation.relation),
            Self::RelationFrom => f.write_str("RelationFrom"),
            Self::RelationTo => f.write_str("RelationTo"),
            Self::Lifecycle(method) => write!(f, "Lifecycle({method:?})"),
            Self::Custom { attribute, .. } => write!(f, "Custom({attribute:?})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Entity,
    Relation,
}

/// Resolved metadata of one declared entity or relation type.
#[derive(Debug)]
pub struct TypeMetadata {
    name: String,
    kind: TypeKind,
    discriminator: Option<String>,
    super_types: Vec<String>,
    ancestors: Vec<String>,
    properties: Vec<String>,
    indexed_property: Option<String>,
    methods: BTreeMap<String, MethodMetadata>,
    from: Option<String>,
    to: Option<String>,
}

impl TypeMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    /// Directly declared super types.
    pub fn super_types(&self) -> &[String] {
        &self.super_types
    }

    /// Scalar properties, own and inherited.
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub fn indexed_property(&self) -> Option<&str> {
        self.indexed_property.as_deref()
    }

    /// Whether this type is `name` or inherits from it.
    pub fn is_a(&self, name: &str) -> bool {
        self.ancestors.iter().any(|ancestor| ancestor == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodMetadata> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Source entity type of a relation type.
    pub fn from_type(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// Target entity type of a relation type.
    pub fn to_type(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn datastore_entity_metadata(&self) -> DatastoreEntityMetadata {
        DatastoreEntityMetadata {
            type_name: self.name.clone(),
            discriminator: self.discriminator.clone(),
            indexed_property: self.indexed_property.clone(),
        }
    }

    pub fn datastore_relation_metadata(&self) -> DatastoreRelationMetadata {
        DatastoreRelationMetadata {
            type_name: self.name.clone(),
            discriminator: self
                .discriminator
                .clone()
                .unwrap_or_else(|| self.name.clone()),
        }
    }
}

/// Find `method` in the first of `types` that declares it.
pub fn resolve_method<'a>(types: &'a [Arc<TypeMetadata>], method: &str) -> Option<&'a MethodMetadata> {
    types.iter().find_map(|metadata| metadata.method(method))
}

/// A named query expression with its declared result columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryTypeMetadata {
    pub name: String,
    pub expression: String,
    pub columns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Member {
    Property(String),
    Reference {
        property: String,
        relation: String,
        direction: Direction,
    },
    Collection {
        property: String,
        relation: String,
        direction: Direction,
        collection: CollectionType,
    },
    Method {
        name: String,
        method: Arc<dyn ProxyMethod>,
        attribute: Option<TransactionAttribute>,
    },
}

/// Declaration of an entity type.
#[derive(Clone)]
pub struct EntityTypeBuilder {
    name: String,
    discriminator: Option<String>,
    super_types: Vec<String>,
    indexed: Option<String>,
    members: Vec<Member>,
}

impl EntityTypeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discriminator: None,
            super_types: Vec::new(),
            indexed: None,
            members: Vec::new(),
        }
    }

    /// Marker identifying records of this type. Types without one are
    /// abstract: they cannot be created or looked up on their own.
    pub fn discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    pub fn extends(mut self, super_type: impl Into<String>) -> Self {
        self.super_types.push(super_type.into());
        self
    }

    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.members.push(Member::Property(property.into()));
        self
    }

    /// Declare `property` and use it for lookups by value.
    pub fn indexed(mut self, property: impl Into<String>) -> Self {
        let property = property.into();
        let declared = self
            .members
            .iter()
            .any(|m| matches!(m, Member::Property(p) if *p == property));
        if !declared {
            self.members.push(Member::Property(property.clone()));
        }
        self.indexed = Some(property);
        self
    }

    /// Single valued reference to another entity through `relation`.
    pub fn reference(
        mut self,
        property: impl Into<String>,
        relation: impl Into<String>,
        direction: Direction,
    ) -> Self {
        self.members.push(Member::Reference {
            property: property.into(),
            relation: relation.into(),
            direction,
        });
        self
    }

    /// Collection of entities reachable through `relation`.
    pub fn collection(
        mut self,
        property: impl Into<String>,
        relation: impl Into<String>,
        direction: Direction,
        collection: CollectionType,
    ) -> Self {
        self.members.push(Member::Collection {
            property: property.into(),
            relation: relation.into(),
            direction,
            collection,
        });
        self
    }

    pub fn method(mut self, name: impl Into<String>, method: impl ProxyMethod + 'static) -> Self {
        self.members.push(Member::Method {
            name: name.into(),
            method: Arc::new(method),
            attribute: None,
        });
        self
    }

    /// Custom method running under its own transaction attribute.
    pub fn method_with_attribute(
        mut self,
        name: impl Into<String>,
        method: impl ProxyMethod + 'static,
        attribute: TransactionAttribute,
    ) -> Self {
        self.members.push(Member::Method {
            name: name.into(),
            method: Arc::new(method),
            attribute: Some(attribute),
        });
        self
    }
}

/// Declaration of a relation type.
#[derive(Clone)]
pub struct RelationTypeBuilder {
    name: String,
    discriminator: Option<String>,
    from: Option<String>,
    to: Option<String>,
    members: Vec<Member>,
}

impl RelationTypeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discriminator: None,
            from: None,
            to: None,
            members: Vec::new(),
        }
    }

    /// Relationship type in the datastore. Defaults to the type name.
    pub fn discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    pub fn from(mut self, entity_type: impl Into<String>) -> Self {
        self.from = Some(entity_type.into());
        self
    }

    pub fn to(mut self, entity_type: impl Into<String>) -> Self {
        self.to = Some(entity_type.into());
        self
    }

    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.members.push(Member::Property(property.into()));
        self
    }

    pub fn method(mut self, name: impl Into<String>, method: impl ProxyMethod + 'static) -> Self {
        self.members.push(Member::Method {
            name: name.into(),
            method: Arc::new(method),
            attribute: None,
        });
        self
    }

    pub fn method_with_attribute(
        mut self,
        name: impl Into<String>,
        method: impl ProxyMethod + 'static,
        attribute: TransactionAttribute,
    ) -> Self {
        self.members.push(Member::Method {
            name: name.into(),
            method: Arc::new(method),
            attribute: Some(attribute),
        });
        self
    }
}

/// Declaration of a named query.
#[derive(Clone, Debug)]
pub struct QueryTypeBuilder {
    name: String,
    expression: String,
    columns: Vec<String>,
}

impl QueryTypeBuilder {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Collects declarations and builds a [`MetadataRegistry`].
#[derive(Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityTypeBuilder>,
    relations: Vec<RelationTypeBuilder>,
    queries: Vec<QueryTypeBuilder>,
}

impl MetadataRegistryBuilder {
    pub fn entity(mut self, entity: EntityTypeBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn relation(mut self, relation: RelationTypeBuilder) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn query(mut self, query: QueryTypeBuilder) -> Self {
        self.queries.push(query);
        self
    }

    /// Validate all declarations and compute the flattened method tables.
    pub fn build(self) -> XoResult<MetadataRegistry> {
        let mut names = BTreeSet::new();
        let declared = self
            .entities
            .iter()
            .map(|e| &e.name)
            .chain(self.relations.iter().map(|r| &r.name))
            .chain(self.queries.iter().map(|q| &q.name));
        for name in declared {
            if name.trim().is_empty() {
                return Err(XoError::Metadata("type name must not be empty".into()));
            }
            if !names.insert(name.clone()) {
                return Err(XoError::Metadata(format!("type {name} is declared twice")));
            }
        }

        let relation_discriminators = self.relation_discriminators()?;
        let declarations: BTreeMap<&str, &EntityTypeBuilder> = self
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e))
            .collect();

        let mut types = BTreeMap::new();
        let mut entity_order = Vec::new();
        let mut discriminators: BTreeMap<String, String> = BTreeMap::new();
        for entity in &self.entities {
            let ancestors = ancestors(entity, &declarations)?;
            let metadata = flatten_entity(entity, &ancestors, &declarations, &relation_discriminators)?;
            if let Some(discriminator) = &metadata.discriminator {
                if let Some(other) = discriminators.insert(discriminator.clone(), entity.name.clone()) {
                    return Err(XoError::Metadata(format!(
                        "discriminator '{discriminator}' is used by {other} and {}",
                        entity.name
                    )));
                }
            }
            entity_order.push(entity.name.clone());
            types.insert(entity.name.clone(), Arc::new(metadata));
        }

        let mut relation_order = Vec::new();
        let mut relation_by_discriminator = BTreeMap::new();
        for relation in &self.relations {
            let metadata = flatten_relation(relation, &declarations)?;
            let discriminator = metadata
                .discriminator
                .clone()
                .unwrap_or_else(|| relation.name.clone());
            relation_by_discriminator.insert(discriminator, relation.name.clone());
            relation_order.push(relation.name.clone());
            types.insert(relation.name.clone(), Arc::new(metadata));
        }

        let queries = self
            .queries
            .into_iter()
            .map(|q| {
                let metadata = QueryTypeMetadata {
                    name: q.name.clone(),
                    expression: q.expression,
                    columns: q.columns,
                };
                (q.name, Arc::new(metadata))
            })
            .collect();

        Ok(MetadataRegistry {
            types,
            entity_order,
            relation_order,
            relation_by_discriminator,
            queries,
        })
    }

    fn relation_discriminators(&self) -> XoResult<BTreeMap<String, String>> {
        let mut by_name = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for relation in &self.relations {
            let discriminator = relation
                .discriminator
                .clone()
                .unwrap_or_else(|| relation.name.clone());
            if !seen.insert(discriminator.clone()) {
                return Err(XoError::Metadata(format!(
                    "relation discriminator '{discriminator}' is declared twice"
                )));
            }
            by_name.insert(relation.name.clone(), discriminator);
        }
        Ok(by_name)
    }
}

/// `entity` followed by all of its super types, nearest first.
fn ancestors(
    entity: &EntityTypeBuilder,
    declarations: &BTreeMap<&str, &EntityTypeBuilder>,
) -> XoResult<Vec<String>> {
    fn visit(
        name: &str,
        declarations: &BTreeMap<&str, &EntityTypeBuilder>,
        path: &mut Vec<String>,
        out: &mut Vec<String>,
    ) -> XoResult<()> {
        if path.iter().any(|p| p == name) {
            return Err(XoError::Metadata(format!(
                "cyclic inheritance: {} -> {name}",
                path.join(" -> ")
            )));
        }
        let declaration = declarations
            .get(name)
            .ok_or_else(|| XoError::Metadata(format!("unknown super type {name}")))?;
        if !out.iter().any(|o| o == name) {
            out.push(name.to_string());
        }
        path.push(name.to_string());
        for super_type in &declaration.super_types {
            visit(super_type, declarations, path, out)?;
        }
        path.pop();
        Ok(())
    }

    let mut out = Vec::new();
    visit(&entity.name, declarations, &mut Vec::new(), &mut out)?;
    Ok(out)
}

fn lifecycle_methods(methods: &mut BTreeMap<String, MethodMetadata>) {
    for (name, method) in [
        ("toString", LifecycleMethod::ToString),
        ("equals", LifecycleMethod::Equals),
        ("hashCode", LifecycleMethod::HashCode),
        ("getId", LifecycleMethod::Id),
    ] {
        methods.insert(name.to_string(), MethodMetadata::Lifecycle(method));
    }
}

fn member_methods(
    type_name: &str,
    members: &[Member],
    relation_discriminators: &BTreeMap<String, String>,
) -> XoResult<Vec<(String, MethodMetadata)>> {
    let relation_ref = |relation: &str, direction: Direction| -> XoResult<RelationRef> {
        let discriminator = relation_discriminators.get(relation).ok_or_else(|| {
            XoError::Metadata(format!("{type_name} refers to unknown relation type {relation}"))
        })?;
        Ok(RelationRef {
            relation: relation.to_string(),
            discriminator: discriminator.clone(),
            direction,
        })
    };

    let mut methods = Vec::new();
    for member in members {
        match member {
            Member::Property(property) => {
                methods.push((
                    accessor("get", property),
                    MethodMetadata::PropertyGet {
                        property: property.clone(),
                    },
                ));
                methods.push((
                    accessor("set", property),
                    MethodMetadata::PropertySet {
                        property: property.clone(),
                    },
                ));
            }
            Member::Reference {
                property,
                relation,
                direction,
            } => {
                let relation = relation_ref(relation, *direction)?;
                methods.push((
                    accessor("get", property),
                    MethodMetadata::ReferenceGet {
                        property: property.clone(),
                        relation: relation.clone(),
                    },
                ));
                methods.push((
                    accessor("set", property),
                    MethodMetadata::ReferenceSet {
                        property: property.clone(),
                        relation,
                    },
                ));
            }
            Member::Collection {
                property,
                relation,
                direction,
                collection,
            } => {
                let relation = relation_ref(relation, *direction)?;
                methods.push((
                    accessor("get", property),
                    MethodMetadata::CollectionGet {
                        property: property.clone(),
                        relation: relation.clone(),
                        collection: *collection,
                    },
                ));
                methods.push((
                    accessor("set", property),
                    MethodMetadata::CollectionSet {
                        property: property.clone(),
                        relation,
                        collection: *collection,
                    },
                ));
            }
            Member::Method {
                name,
                method,
                attribute,
            } => methods.push((
                name.clone(),
                MethodMetadata::Custom {
                    method: method.clone(),
                    attribute: *attribute,
                },
            )),
        }
    }

    let mut seen = BTreeSet::new();
    for (name, _) in &methods {
        if !seen.insert(name.as_str()) {
            return Err(XoError::Metadata(format!(
                "{type_name} declares method {name} twice"
            )));
        }
    }
    Ok(methods)
}

fn flatten_entity(
    entity: &EntityTypeBuilder,
    ancestors: &[String],
    declarations: &BTreeMap<&str, &EntityTypeBuilder>,
    relation_discriminators: &BTreeMap<String, String>,
) -> XoResult<TypeMetadata> {
    let mut methods = BTreeMap::new();
    lifecycle_methods(&mut methods);
    let mut properties: Vec<String> = Vec::new();
    let mut indexed_property = None;

    // Farthest ancestor first so that nearer declarations override.
    for name in ancestors.iter().rev() {
        let declaration = declarations
            .get(name.as_str())
            .ok_or_else(|| XoError::Metadata(format!("unknown super type {name}")))?;
        for member in &declaration.members {
            if let Member::Property(property) = member {
                if !properties.contains(property) {
                    properties.push(property.clone());
                }
            }
        }
        for (method_name, method) in
            member_methods(&declaration.name, &declaration.members, relation_discriminators)?
        {
            methods.insert(method_name, method);
        }
    }
    for name in ancestors {
        if let Some(indexed) = declarations.get(name.as_str()).and_then(|d| d.indexed.clone()) {
            indexed_property = Some(indexed);
            break;
        }
    }

    Ok(TypeMetadata {
        name: entity.name.clone(),
        kind: TypeKind::Entity,
        discriminator: entity.discriminator.clone(),
        super_types: entity.super_types.clone(),
        ancestors: ancestors.to_vec(),
        properties,
        indexed_property,
        methods,
        from: None,
        to: None,
    })
}

fn flatten_relation(
    relation: &RelationTypeBuilder,
    entities: &BTreeMap<&str, &EntityTypeBuilder>,
) -> XoResult<TypeMetadata> {
    let endpoint = |endpoint: &Option<String>, side: &str| -> XoResult<String> {
        let name = endpoint.clone().ok_or_else(|| {
            XoError::Metadata(format!("relation type {} has no '{side}' type", relation.name))
        })?;
        if !entities.contains_key(name.as_str()) {
            return Err(XoError::Metadata(format!(
                "relation type {} refers to unknown entity type {name}",
                relation.name
            )));
        }
        Ok(name)
    };
    let from = endpoint(&relation.from, "from")?;
    let to = endpoint(&relation.to, "to")?;

    let mut methods = BTreeMap::new();
    lifecycle_methods(&mut methods);
    methods.insert("getFrom".to_string(), MethodMetadata::RelationFrom);
    methods.insert("getTo".to_string(), MethodMetadata::RelationTo);
    for (name, method) in member_methods(&relation.name, &relation.members, &BTreeMap::new())? {
        methods.insert(name, method);
    }
    let properties = relation
        .members
        .iter()
        .filter_map(|m| match m {
            Member::Property(p) => Some(p.clone()),
            _ => None,
        })
        .collect();

    Ok(TypeMetadata {
        name: relation.name.clone(),
        kind: TypeKind::Relation,
        discriminator: Some(
            relation
                .discriminator
                .clone()
                .unwrap_or_else(|| relation.name.clone()),
        ),
        super_types: Vec::new(),
        ancestors: vec![relation.name.clone()],
        properties,
        indexed_property: None,
        methods,
        from: Some(from),
        to: Some(to),
    })
}

/// Immutable registry of all declared types.
#[derive(Debug)]
pub struct MetadataRegistry {
    types: BTreeMap<String, Arc<TypeMetadata>>,
    entity_order: Vec<String>,
    relation_order: Vec<String>,
    relation_by_discriminator: BTreeMap<String, String>,
    queries: BTreeMap<String, Arc<QueryTypeMetadata>>,
}

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    fn typed(&self, name: &str, kind: TypeKind) -> XoResult<Arc<TypeMetadata>> {
        self.types
            .get(name)
            .filter(|metadata| metadata.kind == kind)
            .cloned()
            .ok_or_else(|| XoError::UnknownType(name.to_string()))
    }

    pub fn entity_type(&self, name: &str) -> XoResult<Arc<TypeMetadata>> {
        self.typed(name, TypeKind::Entity)
    }

    pub fn relation_type(&self, name: &str) -> XoResult<Arc<TypeMetadata>> {
        self.typed(name, TypeKind::Relation)
    }

    pub fn query_type(&self, name: &str) -> XoResult<Arc<QueryTypeMetadata>> {
        self.queries
            .get(name)
            .cloned()
            .ok_or_else(|| XoError::UnknownType(name.to_string()))
    }

    /// Entity types in registration order.
    pub fn entity_types(&self) -> impl Iterator<Item = &Arc<TypeMetadata>> {
        self.entity_order.iter().filter_map(|name| self.types.get(name))
    }

    /// Relation types in registration order.
    pub fn relation_types(&self) -> impl Iterator<Item = &Arc<TypeMetadata>> {
        self.relation_order.iter().filter_map(|name| self.types.get(name))
    }

    /// Resolve a primary type plus auxiliary types to one type set.
    pub fn effective_types(&self, primary: &str, others: &[&str]) -> XoResult<Vec<Arc<TypeMetadata>>> {
        let mut effective: Vec<Arc<TypeMetadata>> = Vec::with_capacity(others.len() + 1);
        for name in std::iter::once(primary).chain(others.iter().copied()) {
            let metadata = self.entity_type(name)?;
            if !effective.iter().any(|m| m.name == metadata.name) {
                effective.push(metadata);
            }
        }
        Ok(effective)
    }

    /// Discriminators a record of the given type set carries: those of
    /// every type and all of their super types.
    pub fn entity_discriminators(&self, types: &[Arc<TypeMetadata>]) -> BTreeSet<String> {
        types
            .iter()
            .flat_map(|metadata| metadata.ancestors.iter())
            .filter_map(|name| self.types.get(name))
            .filter_map(|metadata| metadata.discriminator.clone())
            .collect()
    }

    /// The most specific entity types matching a record's discriminators,
    /// in registration order.
    pub fn types_for_discriminators(&self, discriminators: &BTreeSet<String>) -> Vec<Arc<TypeMetadata>> {
        let matching: Vec<&Arc<TypeMetadata>> = self
            .entity_types()
            .filter(|metadata| {
                metadata
                    .discriminator
                    .as_ref()
                    .is_some_and(|d| discriminators.contains(d))
            })
            .collect();
        matching
            .iter()
            .filter(|candidate| {
                !matching
                    .iter()
                    .any(|other| other.name != candidate.name && other.is_a(&candidate.name))
            })
            .map(|metadata| Arc::clone(*metadata))
            .collect()
    }

    pub fn relation_type_for_discriminator(&self, discriminator: &str) -> XoResult<Arc<TypeMetadata>> {
        let name = self
            .relation_by_discriminator
            .get(discriminator)
            .ok_or_else(|| XoError::UnknownType(format!("relation discriminator '{discriminator}'")))?;
        self.relation_type(name)
    }

    /// Direction in which `relation` connects `source` to `target`.
    ///
    /// `From` if the source set satisfies the relation's `from` type and the
    /// target set its `to` type, `To` for the reverse.
    pub fn relation_direction(
        &self,
        source: &[Arc<TypeMetadata>],
        relation: &TypeMetadata,
        target: &[Arc<TypeMetadata>],
    ) -> XoResult<Direction> {
        let satisfies = |types: &[Arc<TypeMetadata>], endpoint: Option<&str>| {
            endpoint.is_some_and(|name| types.iter().any(|t| t.is_a(name)))
        };
        if satisfies(source, relation.from_type()) && satisfies(target, relation.to_type()) {
            return Ok(Direction::From);
        }
        if satisfies(source, relation.to_type()) && satisfies(target, relation.from_type()) {
            return Ok(Direction::To);
        }
        let names = |types: &[Arc<TypeMetadata>]| {
            types.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
        };
        Err(XoError::RelationDirection {
            relation: relation.name.clone(),
            from_types: names(source),
            to_types: names(target),
        })
    }

    pub fn datastore_entity_metadata(&self) -> Vec<DatastoreEntityMetadata> {
        self.entity_types()
            .map(|metadata| metadata.datastore_entity_metadata())
            .collect()
    }

    pub fn datastore_relation_metadata(&self) -> Vec<DatastoreRelationMetadata> {
        self.relation_types()
            .map(|metadata| metadata.datastore_relation_metadata())
            .collect()
    }
}
