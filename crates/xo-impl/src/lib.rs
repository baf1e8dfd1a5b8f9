//! XO core: maps declared entity and relation types onto datastore records.
//!
//! Application code declares its types once in a [`MetadataRegistry`] and
//! binds them to a [`Datastore`](xo_spi::Datastore) through an
//! [`XoManagerFactory`]. Every [`XoManager`] is one session: it hands out
//! canonical instances (one per record), tracks the instances a transaction
//! touched, flushes them before commit and runs every operation through an
//! interceptor chain that applies the unit's transaction attribute.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use xo_api::XoUnit;
//! use xo_impl::{EntityTypeBuilder, MetadataRegistry, XoManagerFactory};
//! use xo_spi::Datastore;
//! use xo_store_memory::MemoryDatastore;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(EntityTypeBuilder::new("Person").discriminator("Person").indexed("name"))
//!     .build()
//!     .unwrap();
//! let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
//! let factory =
//!     XoManagerFactory::new(XoUnit::new("quickstart"), datastore, Arc::new(registry)).unwrap();
//! let manager = factory.create_manager().unwrap();
//!
//! manager.current_transaction().begin().unwrap();
//! let ada = manager.create("Person", &[]).unwrap();
//! ada.object().set("name", "Ada").unwrap();
//! manager.current_transaction().commit().unwrap();
//!
//! let found = manager.find("Person", "Ada").unwrap().single().unwrap();
//! assert_eq!(found.get::<String>("name").unwrap().as_deref(), Some("Ada"));
//! ```

pub mod cache;
pub mod instance;
pub mod interceptor;
pub mod manager;
pub mod metadata;
pub mod property;
pub mod proxy;
pub mod query;
pub mod session;
pub mod sync;
pub mod transaction;
pub mod validation;

// Re-exports for convenience.
pub use cache::TransactionalCache;
pub use instance::{
    CompositeObject, EntityInstance, EntityProxy, Instance, InstanceManager, ManagedObject,
    ManagedRecord, RelationInstance, RelationProxy,
};
pub use interceptor::{Interceptor, InterceptorChain, InvocationContext, TransactionInterceptor};
pub use manager::{FindResult, XoManager, XoManagerFactory};
pub use metadata::{
    CollectionType, EntityTypeBuilder, LifecycleMethod, MetadataRegistry, MetadataRegistryBuilder,
    MethodMetadata, QueryTypeBuilder, QueryTypeMetadata, RelationRef, RelationTypeBuilder,
    TypeKind, TypeMetadata,
};
pub use property::{EntityPropertyManager, RelationPropertyManager};
pub use proxy::{Argument, CollectionIter, EntityCollection, ProxyMethod, Return};
pub use query::{QueryResult, ResultRow, XoQuery};
pub use session::SessionContext;
pub use sync::{
    CacheSynchronization, CursorSynchronization, EntityCacheSynchronization, RelationCacheSynchronization,
    ValidatorSynchronization,
};
pub use transaction::{Synchronization, XoTransaction};
pub use validation::{ConstraintValidator, InstanceValidator};

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    use xo_api::{
        ConstraintViolation, DatastoreError, RecordId, TransactionAttribute, TransactionState,
        ValidationMode, Value, XoError, XoResult, XoUnit,
    };
    use xo_spi::{Datastore, DatastoreSession, Direction, Record, Row};
    use xo_store_json::JsonFileDatastore;
    use xo_store_memory::{Flushed, MemoryDatastore};

    use super::*;

    struct Person(EntityInstance);

    impl EntityProxy for Person {
        const TYPE: &'static str = "Person";

        fn wrap(instance: EntityInstance) -> Self {
            Self(instance)
        }

        fn instance(&self) -> &EntityInstance {
            &self.0
        }
    }

    impl Person {
        fn name(&self) -> XoResult<Option<String>> {
            self.0.get("name")
        }
    }

    struct Customer(EntityInstance);

    impl EntityProxy for Customer {
        const TYPE: &'static str = "Customer";

        fn wrap(instance: EntityInstance) -> Self {
            Self(instance)
        }

        fn instance(&self) -> &EntityInstance {
            &self.0
        }
    }

    impl Customer {
        fn rating(&self) -> XoResult<Option<i64>> {
            self.0.get("rating")
        }
    }

    struct Company(EntityInstance);

    impl EntityProxy for Company {
        const TYPE: &'static str = "Company";

        fn wrap(instance: EntityInstance) -> Self {
            Self(instance)
        }

        fn instance(&self) -> &EntityInstance {
            &self.0
        }
    }

    struct WorksFor(RelationInstance);

    impl RelationProxy for WorksFor {
        const TYPE: &'static str = "WorksFor";

        fn wrap(instance: RelationInstance) -> Self {
            Self(instance)
        }

        fn instance(&self) -> &RelationInstance {
            &self.0
        }
    }

    impl WorksFor {
        fn since(&self) -> XoResult<Option<i64>> {
            self.0.get("since")
        }

        fn set_since(&self, year: i64) -> XoResult<()> {
            self.0.set("since", year)
        }
    }

    fn registry() -> Arc<MetadataRegistry> {
        let registry = MetadataRegistry::builder()
            .entity(EntityTypeBuilder::new("Named").indexed("name"))
            .entity(
                EntityTypeBuilder::new("Person")
                    .discriminator("Person")
                    .extends("Named")
                    .property("age")
                    .collection("friends", "Knows", Direction::From, CollectionType::Set)
                    .collection("acquaintances", "Knows", Direction::To, CollectionType::Collection)
                    .collection("pets", "Owns", Direction::From, CollectionType::List)
                    .collection("scores", "Knows", Direction::From, CollectionType::Map)
                    .reference("employer", "WorksFor", Direction::From)
                    .method("greet", |object: &ManagedObject, _: &[Argument]| -> XoResult<Return> {
                        let name: Option<String> = object.get("name")?;
                        Ok(Return::Value(Value::from(format!(
                            "Hello, {}",
                            name.unwrap_or_default()
                        ))))
                    })
                    .method_with_attribute(
                        "kind",
                        |_: &ManagedObject, _: &[Argument]| -> XoResult<Return> {
                            Ok(Return::Value(Value::from("person")))
                        },
                        TransactionAttribute::None,
                    ),
            )
            .entity(
                EntityTypeBuilder::new("Company")
                    .discriminator("Company")
                    .extends("Named")
                    .collection("employees", "WorksFor", Direction::To, CollectionType::List),
            )
            .entity(
                EntityTypeBuilder::new("Customer")
                    .discriminator("Customer")
                    .property("rating"),
            )
            .entity(EntityTypeBuilder::new("Pet").discriminator("Pet").indexed("name"))
            .relation(RelationTypeBuilder::new("Knows").from("Person").to("Person"))
            .relation(RelationTypeBuilder::new("Owns").from("Person").to("Pet"))
            .relation(
                RelationTypeBuilder::new("WorksFor")
                    .discriminator("WORKS_FOR")
                    .from("Person")
                    .to("Company")
                    .property("since"),
            )
            .query(QueryTypeBuilder::new("PersonsByName", "persons by name").column("p"))
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn entity(id: u64) -> Value {
        Value::Entity(RecordId::Numeric(id))
    }

    /// Helper: a memory store answering the queries used below.
    fn datastore() -> Arc<MemoryDatastore> {
        let store = Arc::new(MemoryDatastore::new());
        store.define_query("persons by name", |graph, parameters| {
            let name = parameters.get("name").cloned().unwrap_or(Value::Null);
            Ok(graph
                .nodes_with_label("Person")
                .into_iter()
                .filter(|id| graph.node_property(*id, "name") == Some(&name))
                .map(|id| Row::from([("p".to_string(), entity(id))]))
                .collect())
        });
        store.define_query("people", |graph, _| {
            let property = |id: u64, name: &str| graph.node_property(id, name).cloned().unwrap_or(Value::Null);
            Ok(graph
                .nodes_with_label("Person")
                .into_iter()
                .map(|id| {
                    Row::from([
                        ("p".to_string(), entity(id)),
                        ("name".to_string(), property(id, "name")),
                        ("age".to_string(), property(id, "age")),
                    ])
                })
                .collect())
        });
        store.define_query("friends of", |graph, parameters| {
            let person = match parameters.get("person") {
                Some(Value::Entity(RecordId::Numeric(id))) => *id,
                other => {
                    return Err(DatastoreError::Backend(format!("expected a person, got {other:?}")))
                }
            };
            Ok(graph
                .relationships_of(person, "Knows", Direction::From)
                .into_iter()
                .filter_map(|id| graph.relationship(id))
                .map(|rel| Row::from([("f".to_string(), entity(rel.to))]))
                .collect())
        });
        store.define_query("employments", |graph, _| {
            Ok(graph
                .nodes_with_label("Person")
                .into_iter()
                .flat_map(|id| graph.relationships_of(id, "WORKS_FOR", Direction::From))
                .map(|id| Row::from([("w".to_string(), Value::Relation(RecordId::Numeric(id)))]))
                .collect())
        });
        store
    }

    fn factory_with(store: &Arc<MemoryDatastore>, unit: XoUnit) -> XoManagerFactory {
        let datastore: Arc<dyn Datastore> = store.clone();
        XoManagerFactory::new(unit, datastore, registry()).unwrap()
    }

    fn factory(store: &Arc<MemoryDatastore>) -> XoManagerFactory {
        factory_with(store, XoUnit::new("test"))
    }

    fn create(manager: &XoManager, type_name: &str, name: &str) -> EntityInstance {
        let instance = manager.create(type_name, &[]).unwrap().as_entity().unwrap().clone();
        instance.set("name", name).unwrap();
        instance
    }

    fn person(manager: &XoManager, name: &str) -> EntityInstance {
        create(manager, "Person", name)
    }

    fn names(entities: &[EntityInstance]) -> Vec<String> {
        entities
            .iter()
            .map(|e| e.get::<String>("name").unwrap().unwrap_or_default())
            .collect()
    }

    fn node(instance: &EntityInstance) -> u64 {
        instance.id().as_numeric().unwrap()
    }

    fn labels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Rejects unnamed entities.
    fn named_validator(object: &ManagedObject) -> XoResult<Vec<ConstraintViolation>> {
        if !object.has_type("Named") {
            return Ok(Vec::new());
        }
        match object.get::<String>("name")? {
            Some(_) => Ok(Vec::new()),
            None => Ok(vec![ConstraintViolation::blocking("must not be empty").on_property("name")]),
        }
    }

    /// Records the operations passing through the chain.
    struct Recording {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Interceptor for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn intercept(
            &self,
            context: &InvocationContext<'_>,
            proceed: &mut dyn FnMut() -> XoResult<()>,
        ) -> XoResult<()> {
            self.calls.lock().unwrap().push(context.operation.to_string());
            proceed()
        }
    }

    /// Refuses to proceed with deletes.
    struct Veto;

    impl Interceptor for Veto {
        fn name(&self) -> &str {
            "veto"
        }

        fn intercept(
            &self,
            context: &InvocationContext<'_>,
            proceed: &mut dyn FnMut() -> XoResult<()>,
        ) -> XoResult<()> {
            if context.operation == "delete" {
                return Ok(());
            }
            proceed()
        }
    }

    struct Journal {
        events: RefCell<Vec<String>>,
    }

    impl Synchronization for Journal {
        fn name(&self) -> &str {
            "journal"
        }

        fn before_completion(&self) -> XoResult<()> {
            self.events.borrow_mut().push("before".into());
            Ok(())
        }

        fn after_completion(&self, committed: bool) {
            self.events.borrow_mut().push(format!("after:{committed}"));
        }
    }

    // -----------------------------------------------------------------------
    // 1. One canonical instance per record and session
    // -----------------------------------------------------------------------
    #[test]
    fn instances_are_canonical_per_session() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();

        tx.begin().unwrap();
        let alice = person(&manager, "Alice");
        let found = manager.find("Person", "Alice").unwrap().single().unwrap();
        assert_eq!(found, alice);
        tx.commit().unwrap();

        // The identity map outlives the transaction.
        let again = manager.find("Person", "Alice").unwrap().single().unwrap();
        assert_eq!(again, alice);
        assert_eq!(manager.get_id(&alice).unwrap(), *alice.id());
        assert_eq!(store.open_cursors(), 0);

        let other = factory.create_manager().unwrap();
        let foreign = other.find("Person", "Alice").unwrap().single().unwrap();
        assert_ne!(foreign, alice);
        assert_eq!(foreign.id(), alice.id());
    }

    // -----------------------------------------------------------------------
    // 2. Scalar properties
    // -----------------------------------------------------------------------
    #[test]
    fn scalar_properties_read_and_write() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();

        let alice = person(&manager, "Alice");
        alice.set("age", 36).unwrap();
        assert_eq!(alice.get::<String>("name").unwrap().as_deref(), Some("Alice"));
        assert_eq!(alice.get::<i64>("age").unwrap(), Some(36));

        assert!(matches!(
            alice.get::<i64>("name"),
            Err(XoError::UnsupportedPropertyType { property, .. }) if property == "name"
        ));
        assert!(matches!(
            alice.get::<String>("nickname"),
            Err(XoError::UnknownMethod { method, .. }) if method == "getNickname"
        ));

        alice.set("age", Value::Null).unwrap();
        assert_eq!(alice.get::<i64>("age").unwrap(), None);
        assert_eq!(store.snapshot().node_property(node(&alice), "age"), None);
    }

    // -----------------------------------------------------------------------
    // 3. Create, relate, commit, then traverse from a fresh session
    // -----------------------------------------------------------------------
    #[test]
    fn end_to_end_create_relate_commit_and_traverse() {
        let store = datastore();
        let factory = factory(&store);
        {
            let manager = factory.create_manager().unwrap();
            let tx = manager.current_transaction();
            tx.begin().unwrap();
            let alice = person(&manager, "Alice");
            let bob = person(&manager, "Bob");
            let acme = create(&manager, "Company", "Acme");
            alice.collection("friends").unwrap().add(&bob).unwrap();
            alice.set_reference("employer", Some(&acme)).unwrap();
            tx.commit().unwrap();
            assert_eq!(tx.state(), TransactionState::Committed);
        }

        let graph = store.snapshot();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.relationship_count(), 2);

        let manager = factory.create_manager().unwrap();
        let alice = manager.find("Person", "Alice").unwrap().single().unwrap();
        let friends = alice.collection("friends").unwrap().to_vec().unwrap();
        assert_eq!(names(&friends), ["Bob"]);
        let employer = alice.reference("employer").unwrap().unwrap();
        assert!(employer.has_type("Company"));
        assert_eq!(employer.get::<String>("name").unwrap().as_deref(), Some("Acme"));
        assert_eq!(names(&friends[0].collection("acquaintances").unwrap().to_vec().unwrap()), ["Alice"]);
    }

    // -----------------------------------------------------------------------
    // 4. Replacing a collection
    // -----------------------------------------------------------------------
    #[test]
    fn set_collection_replaces_elements() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();

        tx.begin().unwrap();
        let owner = person(&manager, "Owner");
        let a = person(&manager, "A");
        let b = person(&manager, "B");
        let c = person(&manager, "C");
        owner.set_collection("friends", &[a.clone(), b.clone()]).unwrap();
        owner.set_collection("friends", &[b.clone(), c.clone()]).unwrap();
        let friends = owner.collection("friends").unwrap().to_vec().unwrap();
        assert_eq!(friends, vec![b.clone(), c.clone()]);

        // A set keeps one edge per element, a list keeps every element.
        owner.set_collection("friends", &[c.clone(), c.clone(), b.clone()]).unwrap();
        assert_eq!(owner.collection("friends").unwrap().to_vec().unwrap(), vec![c, b]);
        let rex = create(&manager, "Pet", "Rex");
        owner.set_collection("pets", &[rex.clone(), rex.clone()]).unwrap();
        assert_eq!(owner.collection("pets").unwrap().len().unwrap(), 2);
        tx.commit().unwrap();

        assert_eq!(store.snapshot().relationship_count(), 4);
        assert!(a.collection("acquaintances").unwrap().is_empty().unwrap());
    }

    // -----------------------------------------------------------------------
    // 5. Collection views follow their declared shape
    // -----------------------------------------------------------------------
    #[test]
    fn collection_views_follow_declared_shape() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        tx.begin().unwrap();

        let alice = person(&manager, "Alice");
        let bob = person(&manager, "Bob");
        let rex = create(&manager, "Pet", "Rex");

        let friends = alice.collection("friends").unwrap();
        assert_eq!(friends.kind(), CollectionType::Set);
        assert!(friends.add(&bob).unwrap());
        assert!(!friends.add(&bob).unwrap());
        assert_eq!(friends.len().unwrap(), 1);
        assert!(friends.contains(&bob).unwrap());
        assert!(matches!(friends.get(0), Err(XoError::InvalidArgument { .. })));

        let pets = alice.collection("pets").unwrap();
        assert!(pets.add(&rex).unwrap());
        assert!(pets.add(&rex).unwrap());
        assert_eq!(pets.len().unwrap(), 2);
        assert_eq!(pets.get(1).unwrap(), Some(rex.clone()));
        assert_eq!(pets.get(2).unwrap(), None);
        let iterated = pets.iter().unwrap().collect::<XoResult<Vec<_>>>().unwrap();
        assert_eq!(iterated, vec![rex.clone(), rex.clone()]);

        assert!(matches!(
            alice.collection("scores"),
            Err(XoError::UnsupportedPropertyType { property, .. }) if property == "scores"
        ));

        assert!(friends.remove(&bob).unwrap());
        assert!(!friends.remove(&bob).unwrap());
        assert!(friends.is_empty().unwrap());
        pets.clear().unwrap();
        assert_eq!(pets.len().unwrap(), 0);
        tx.commit().unwrap();

        assert_eq!(store.snapshot().relationship_count(), 0);
    }

    // -----------------------------------------------------------------------
    // 6. Single valued references
    // -----------------------------------------------------------------------
    #[test]
    fn references_hold_at_most_one_entity() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        tx.begin().unwrap();

        let alice = person(&manager, "Alice");
        let acme = create(&manager, "Company", "Acme");
        let globex = create(&manager, "Company", "Globex");

        alice.set_reference("employer", Some(&acme)).unwrap();
        assert_eq!(alice.reference("employer").unwrap(), Some(acme.clone()));
        alice.set_reference("employer", Some(&globex)).unwrap();
        assert_eq!(alice.reference("employer").unwrap(), Some(globex.clone()));
        assert!(acme.collection("employees").unwrap().is_empty().unwrap());
        alice.set_reference("employer", None).unwrap();
        assert_eq!(alice.reference("employer").unwrap(), None);

        manager.create_relation(&alice, "WorksFor", &acme).unwrap();
        manager.create_relation(&alice, "WorksFor", &globex).unwrap();
        assert!(matches!(alice.reference("employer"), Err(XoError::NotSingleResult(_))));
        tx.commit().unwrap();
    }

    // -----------------------------------------------------------------------
    // 7. Relation direction is derived from the endpoint types
    // -----------------------------------------------------------------------
    #[test]
    fn relation_direction_follows_endpoint_types() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        tx.begin().unwrap();

        let alice = person(&manager, "Alice");
        let bob = person(&manager, "Bob");
        let acme = create(&manager, "Company", "Acme");
        let rex = create(&manager, "Pet", "Rex");

        // Given in reverse, stored from Person to Company.
        let works = manager.create_relation(&acme, "WorksFor", &alice).unwrap();
        assert_eq!(works.from().unwrap(), alice);
        assert_eq!(works.to().unwrap(), acme);

        assert!(matches!(
            manager.create_relation(&rex, "WorksFor", &acme),
            Err(XoError::RelationDirection { relation, .. }) if relation == "WorksFor"
        ));
        assert!(matches!(
            manager.create_relation(&alice, "Likes", &bob),
            Err(XoError::UnknownType(_))
        ));

        // Adding through the incoming side stores an outgoing edge of bob.
        acme.collection("employees").unwrap().add(&bob).unwrap();
        assert_eq!(bob.reference("employer").unwrap(), Some(acme.clone()));
        assert_eq!(acme.collection("employees").unwrap().to_vec().unwrap(), vec![alice, bob]);
        tx.commit().unwrap();
    }

    // -----------------------------------------------------------------------
    // 8. Relation properties and typed relation views
    // -----------------------------------------------------------------------
    #[test]
    fn relation_properties_and_typed_views() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();

        let alice = person(&manager, "Alice");
        let acme = create(&manager, "Company", "Acme");
        let works: WorksFor = manager.create_relation_typed(&alice, &acme).unwrap();
        works.set_since(2019).unwrap();
        assert_eq!(works.since().unwrap(), Some(2019));
        assert_eq!(works.instance().from().unwrap(), alice);
        assert_eq!(
            works.instance().call("getTo", &[]).unwrap().into_entity().unwrap(),
            Some(acme)
        );
        assert!(matches!(
            works.instance().get::<i64>("salary"),
            Err(XoError::UnknownMethod { .. })
        ));

        let row = manager
            .create_query("employments")
            .execute()
            .unwrap()
            .single()
            .unwrap();
        assert_eq!(row.get_relation("w").unwrap(), Some(works.instance().clone()));
        let typed = row.object().unwrap().as_relation_type::<WorksFor>().unwrap();
        assert_eq!(typed.since().unwrap(), Some(2019));
        assert_eq!(works.instance().to_string(), format!("WorksFor, id={}", works.instance().id()));
    }

    // -----------------------------------------------------------------------
    // 9. Delete
    // -----------------------------------------------------------------------
    #[test]
    fn delete_retires_instances() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        tx.begin().unwrap();

        let alice = person(&manager, "Alice");
        let bob = person(&manager, "Bob");
        let knows = manager.create_relation(&alice, "Knows", &bob).unwrap();

        // Relations must go first.
        assert!(matches!(manager.delete(&alice), Err(XoError::Datastore(_))));
        manager.delete(knows.clone()).unwrap();
        assert!(matches!(knows.from(), Err(XoError::UnmanagedInstance(_))));

        manager.delete(&alice).unwrap();
        assert!(matches!(alice.get::<String>("name"), Err(XoError::UnmanagedInstance(_))));
        assert!(matches!(manager.delete(&alice), Err(XoError::UnmanagedInstance(_))));
        tx.commit().unwrap();

        let graph = store.snapshot();
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.relationship_count(), 0);

        let other = factory.create_manager().unwrap();
        let foreign = other.find("Person", "Bob").unwrap().single().unwrap();
        assert!(matches!(manager.delete(&foreign), Err(XoError::UnmanagedInstance(_))));
    }

    // -----------------------------------------------------------------------
    // 10. Migration keeps the record and retires the old instance
    // -----------------------------------------------------------------------
    #[test]
    fn migration_keeps_record_and_retires_old_instance() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        tx.begin().unwrap();

        let alice = person(&manager, "Alice");
        alice.set("age", 36).unwrap();
        let migrated = manager
            .migrate_with(&alice, "Customer", &[], |old, new| {
                let age: Option<i64> = old.get("age")?;
                new.object().set("rating", age.unwrap_or_default() / 10)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(migrated.id(), alice.id());
        assert_eq!(migrated.type_names(), ["Customer"]);
        assert!(matches!(alice.get::<String>("name"), Err(XoError::UnmanagedInstance(_))));
        assert!(migrated.as_type::<Person>().is_err());
        let customer = migrated.as_type::<Customer>().unwrap();
        assert_eq!(customer.rating().unwrap(), Some(3));

        let both = manager.migrate(customer.instance(), "Person", &["Customer"]).unwrap();
        assert_eq!(both.type_names(), ["Person", "Customer"]);
        assert_eq!(both.as_type::<Person>().unwrap().name().unwrap().as_deref(), Some("Alice"));
        assert!(matches!(customer.rating(), Err(XoError::UnmanagedInstance(_))));
        tx.commit().unwrap();

        assert_eq!(
            store.snapshot().node(node(both.as_entity().unwrap())).unwrap().labels,
            labels(&["Customer", "Person"])
        );
    }

    #[test]
    fn failed_migration_keeps_types_and_instance() {
        let store = datastore();
        store.unique_constraint("Customer", "name");
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        tx.begin().unwrap();

        let holder = manager.create("Person", &["Customer"]).unwrap();
        holder.object().set("name", "Alice").unwrap();
        let alice = person(&manager, "Alice");
        let instances = manager.session().entity_instances();

        // The datastore refuses the new labels.
        assert!(matches!(manager.migrate(&alice, "Customer", &[]), Err(XoError::Datastore(_))));
        assert!(instances.is_instance(&alice));
        assert_eq!(instances.get_datastore_type(&alice).unwrap().id(), alice.id());
        let record = instances.get_datastore_type(&alice).unwrap();
        assert_eq!(
            manager.session().datastore().entity_discriminators(&record).unwrap(),
            labels(&["Person"])
        );
        assert_eq!(alice.get::<String>("name").unwrap().as_deref(), Some("Alice"));

        // No discriminator to migrate to.
        assert!(matches!(
            manager.migrate(&alice, "Named", &[]),
            Err(XoError::MissingDiscriminator(t)) if t == "Named"
        ));
        assert!(instances.is_instance(&alice));

        // A failing strategy puts the old types back.
        let bob = person(&manager, "Bob");
        let failed = manager.migrate_with(&bob, "Customer", &[], |_, _| {
            Err(XoError::invalid_argument("migrate", "no rating for Bob"))
        });
        assert!(matches!(failed, Err(XoError::InvalidArgument { .. })));
        assert!(instances.is_instance(&bob));
        assert_eq!(bob.type_names(), ["Person"]);
        assert_eq!(bob.get::<String>("name").unwrap().as_deref(), Some("Bob"));
        tx.commit().unwrap();

        let graph = store.snapshot();
        assert_eq!(graph.node(node(&alice)).unwrap().labels, labels(&["Person"]));
        assert_eq!(graph.node(node(&bob)).unwrap().labels, labels(&["Person"]));
    }

    // -----------------------------------------------------------------------
    // 11. Query parameter binding
    // -----------------------------------------------------------------------
    #[test]
    fn query_parameters_bind_once() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let alice = person(&manager, "Alice");
        let bob = person(&manager, "Bob");
        alice.collection("friends").unwrap().add(&bob).unwrap();

        let duplicate = manager
            .create_query("persons by name")
            .with_parameter("name", "Alice")
            .unwrap()
            .with_parameter("name", "Bob");
        assert!(matches!(duplicate, Err(XoError::DuplicateParameter(name)) if name == "name"));

        let merged = manager
            .create_query("persons by name")
            .with_parameter("limit", 10)
            .unwrap()
            .with_parameters([("name", "Alice")])
            .unwrap();
        let row = merged.execute().unwrap().single().unwrap();
        assert_eq!(row.get_entity("p").unwrap(), Some(alice.clone()));
        assert!(matches!(
            merged.with_parameters([("limit", 5)]),
            Err(XoError::DuplicateParameter(name)) if name == "limit"
        ));

        // Instances are passed to the datastore as record references.
        let friends = manager
            .create_query("friends of")
            .with_parameter("person", &alice)
            .unwrap()
            .execute()
            .unwrap()
            .map(|row| row.and_then(|r| r.get_entity("f")))
            .collect::<XoResult<Vec<_>>>()
            .unwrap();
        assert_eq!(friends, vec![Some(bob)]);
    }

    // -----------------------------------------------------------------------
    // 12. Result rows and cursors
    // -----------------------------------------------------------------------
    #[test]
    fn result_rows_and_cursor_release() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let alice = person(&manager, "Alice");
        alice.set("age", 36).unwrap();
        person(&manager, "Bob");

        let row = manager
            .create_typed_query("PersonsByName")
            .unwrap()
            .with_parameter("name", "Alice")
            .unwrap()
            .execute()
            .unwrap()
            .single()
            .unwrap();
        assert_eq!(row.columns(), ["p"]);
        assert!(matches!(row.get("name"), Err(XoError::ColumnNotFound(c)) if c == "name"));
        assert_eq!(row.as_type::<Person>().unwrap().name().unwrap().as_deref(), Some("Alice"));

        let rows = manager
            .create_query("people")
            .execute()
            .unwrap()
            .collect::<XoResult<Vec<ResultRow>>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_as::<String>("name").unwrap().as_deref(), Some("Alice"));
        assert_eq!(rows[0].get_as::<i64>("age").unwrap(), Some(36));
        assert_eq!(rows[1].get_as::<i64>("age").unwrap(), None);
        assert!(matches!(rows[0].get_as::<i64>("name"), Err(XoError::ColumnType { .. })));
        assert!(matches!(rows[0].get_entity("name"), Err(XoError::ColumnType { .. })));
        assert!(matches!(rows[0].get("email"), Err(XoError::ColumnNotFound(_))));
        assert!(rows[0].object().is_err());
        assert_eq!(store.open_cursors(), 0);

        let unconsumed = manager.create_query("people").execute().unwrap();
        assert_eq!(store.open_cursors(), 1);
        drop(unconsumed);
        assert_eq!(store.open_cursors(), 0);

        let many = manager.create_query("people").execute().unwrap().single();
        assert!(matches!(many, Err(XoError::NotSingleResult(_))));
        assert_eq!(store.open_cursors(), 0);

        assert!(manager.create_query_typed("people", "Person").is_ok());
        assert!(manager.create_query_typed("people", "Nope").is_err());
        assert!(manager.create_typed_query("Nope").is_err());
    }

    // -----------------------------------------------------------------------
    // 13. Mandatory propagation needs an explicit transaction
    // -----------------------------------------------------------------------
    #[test]
    fn mandatory_attribute_requires_active_transaction() {
        let store = datastore();
        let unit = XoUnit::from_toml_str("name = \"strict\"\ntransaction_attribute = \"mandatory\"").unwrap();
        let factory = factory_with(&store, unit);
        let manager = factory.create_manager().unwrap();
        assert_eq!(manager.unit().transaction_attribute, TransactionAttribute::Mandatory);

        assert!(matches!(manager.create("Person", &[]), Err(XoError::NoActiveTransaction)));

        let tx = manager.current_transaction();
        tx.begin().unwrap();
        let alice = person(&manager, "Alice");
        tx.commit().unwrap();

        assert!(matches!(alice.get::<String>("name"), Err(XoError::NoActiveTransaction)));
        // A method declaring its own attribute runs anyway.
        assert_eq!(
            alice.call("kind", &[]).unwrap().into_value().unwrap(),
            Value::from("person")
        );
        assert_eq!(store.snapshot().node_count(), 1);
    }

    // -----------------------------------------------------------------------
    // 14. Requires propagation commits each call on its own
    // -----------------------------------------------------------------------
    #[test]
    fn requires_attribute_runs_implicit_transactions() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();

        let alice = person(&manager, "Alice");
        assert_eq!(manager.current_transaction().state(), TransactionState::Committed);
        assert!(manager.session().entity_instances().cache().borrow().is_empty());
        let graph = store.snapshot();
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.node_property(node(&alice), "name"), Some(&Value::from("Alice")));

        // A failing call rolls its implicit transaction back.
        assert!(matches!(manager.create("Named", &[]), Err(XoError::MissingDiscriminator(_))));
        assert_eq!(manager.current_transaction().state(), TransactionState::RolledBack);
        assert_eq!(alice.get::<String>("name").unwrap().as_deref(), Some("Alice"));
    }

    // -----------------------------------------------------------------------
    // 15. Rollback discards changes and retires instances of lost records
    // -----------------------------------------------------------------------
    #[test]
    fn rollback_discards_changes() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        let bob = person(&manager, "Bob");

        tx.begin().unwrap();
        let alice = person(&manager, "Alice");
        bob.set("name", "Robert").unwrap();
        tx.rollback().unwrap();

        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(store.snapshot().node_count(), 1);
        assert!(manager.session().entity_instances().cache().borrow().is_empty());
        assert!(matches!(alice.get::<String>("name"), Err(XoError::UnmanagedInstance(_))));
        assert_eq!(bob.get::<String>("name").unwrap().as_deref(), Some("Bob"));
        assert!(matches!(tx.rollback(), Err(XoError::TransactionState(_))));
        assert!(matches!(tx.commit(), Err(XoError::TransactionState(_))));

        let fresh = person(&manager, "Alice");
        assert_ne!(fresh, alice);
        assert_eq!(fresh.get::<String>("name").unwrap().as_deref(), Some("Alice"));
    }

    // -----------------------------------------------------------------------
    // 16. A failing flush aborts the commit
    // -----------------------------------------------------------------------
    #[test]
    fn flush_failure_rolls_back_commit() {
        let store = datastore();
        store.unique_constraint("Person", "name");
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();

        tx.begin().unwrap();
        let first = person(&manager, "Alice");
        person(&manager, "Alice");
        assert!(matches!(tx.commit(), Err(XoError::Datastore(_))));

        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(!tx.is_active());
        assert_eq!(store.snapshot().node_count(), 0);
        assert!(matches!(first.get::<String>("name"), Err(XoError::UnmanagedInstance(_))));
    }

    // -----------------------------------------------------------------------
    // 17. Constraint validation before commit
    // -----------------------------------------------------------------------
    #[test]
    fn validation_blocks_commit() {
        let store = datastore();
        let factory = factory(&store).with_validator(named_validator);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();

        tx.begin().unwrap();
        manager.create("Person", &[]).unwrap();
        let violations = manager.validate().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].property.as_deref(), Some("name"));
        assert_eq!(violations[0].instance.as_deref(), Some("Person, id=1"));
        assert!(matches!(tx.commit(), Err(XoError::ConstraintViolations(v)) if v.len() == 1));
        assert_eq!(store.snapshot().node_count(), 0);

        tx.begin().unwrap();
        person(&manager, "Alice");
        tx.commit().unwrap();
        assert_eq!(store.snapshot().node_count(), 1);
    }

    #[test]
    fn validation_warnings_and_disabled_mode_do_not_block() {
        let store = datastore();
        let warning = factory(&store).with_validator(
            |_: &ManagedObject| -> XoResult<Vec<ConstraintViolation>> {
                Ok(vec![ConstraintViolation::warning("looks odd")])
            },
        );
        let manager = warning.create_manager().unwrap();
        manager.current_transaction().begin().unwrap();
        manager.create("Customer", &[]).unwrap();
        manager.current_transaction().commit().unwrap();

        let lenient = factory_with(&store, XoUnit::new("lenient").with_validation_mode(ValidationMode::None))
            .with_validator(named_validator);
        let manager = lenient.create_manager().unwrap();
        manager.current_transaction().begin().unwrap();
        manager.create("Person", &[]).unwrap();
        assert_eq!(manager.validate().unwrap().len(), 1);
        manager.current_transaction().commit().unwrap();
        assert_eq!(store.snapshot().node_count(), 2);
    }

    // -----------------------------------------------------------------------
    // 18. Custom methods and user interceptors
    // -----------------------------------------------------------------------
    #[test]
    fn custom_methods_run_through_user_interceptors() {
        let store = datastore();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let factory = factory(&store).with_interceptor(move || -> Box<dyn Interceptor> {
            Box::new(Recording {
                calls: recorded.clone(),
            })
        });
        let manager = factory.create_manager().unwrap();
        assert_eq!(manager.session().interceptors().names(), ["transaction", "recording"]);

        let alice = person(&manager, "Alice");
        calls.lock().unwrap().clear();
        let greeting = alice.call("greet", &[]).unwrap().into_value().unwrap();
        assert_eq!(greeting, Value::from("Hello, Alice"));
        assert_eq!(*calls.lock().unwrap(), ["greet", "getName"]);

        assert!(matches!(
            alice.call("fly", &[]),
            Err(XoError::UnknownMethod { method, .. }) if method == "fly"
        ));

        let vetoed = datastore();
        let factory = self::factory(&vetoed).with_interceptor(|| -> Box<dyn Interceptor> { Box::new(Veto) });
        let manager = factory.create_manager().unwrap();
        let bob = person(&manager, "Bob");
        assert!(matches!(manager.delete(&bob), Err(XoError::InvalidArgument { .. })));
        assert_eq!(vetoed.snapshot().node_count(), 1);
    }

    // -----------------------------------------------------------------------
    // 19. Flush writes entities before relations
    // -----------------------------------------------------------------------
    #[test]
    fn flush_writes_entities_then_relations() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        tx.begin().unwrap();

        let alice = person(&manager, "Alice");
        let bob = person(&manager, "Bob");
        let knows = manager.create_relation(&alice, "Knows", &bob).unwrap();
        store.clear_flush_log();
        manager.flush().unwrap();
        assert_eq!(
            store.flush_log(),
            vec![
                Flushed::Entity(alice.id().clone()),
                Flushed::Entity(bob.id().clone()),
                Flushed::Relation(knows.id().clone()),
            ]
        );
        tx.commit().unwrap();
    }

    // -----------------------------------------------------------------------
    // 20. Synchronizations registered for one transaction
    // -----------------------------------------------------------------------
    #[test]
    fn transaction_synchronizations_apply_once() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();
        let journal = Rc::new(Journal {
            events: RefCell::new(Vec::new()),
        });

        tx.begin().unwrap();
        tx.register_synchronization(journal.clone());
        person(&manager, "Alice");
        tx.commit().unwrap();
        assert_eq!(*journal.events.borrow(), ["before", "after:true"]);

        tx.begin().unwrap();
        tx.commit().unwrap();
        assert_eq!(journal.events.borrow().len(), 2);

        tx.begin().unwrap();
        tx.register_synchronization(journal.clone());
        tx.rollback().unwrap();
        assert_eq!(journal.events.borrow().last().map(String::as_str), Some("after:false"));
    }

    // -----------------------------------------------------------------------
    // 21. Closing sessions and factories
    // -----------------------------------------------------------------------
    #[test]
    fn close_rolls_back_and_rejects_further_use() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();

        manager.current_transaction().begin().unwrap();
        let alice = person(&manager, "Alice");
        manager.close().unwrap();
        assert!(manager.is_closed());
        assert_eq!(store.snapshot().node_count(), 0);
        assert!(matches!(alice.get::<String>("name"), Err(XoError::SessionClosed)));
        assert!(matches!(manager.create("Person", &[]), Err(XoError::SessionClosed)));
        assert!(matches!(manager.find("Person", "Alice"), Err(XoError::SessionClosed)));
        manager.close().unwrap();

        let orphan = {
            let manager = factory.create_manager().unwrap();
            person(&manager, "Bob")
        };
        assert!(matches!(orphan.get::<String>("name"), Err(XoError::SessionClosed)));
        assert_eq!(store.snapshot().node_count(), 1);

        factory.close().unwrap();
        assert!(matches!(factory.create_manager(), Err(XoError::SessionClosed)));
    }

    // -----------------------------------------------------------------------
    // 22. Lookup by indexed property
    // -----------------------------------------------------------------------
    #[test]
    fn find_by_indexed_property() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        person(&manager, "Alice");
        create(&manager, "Pet", "Rex");
        create(&manager, "Pet", "Rex");

        assert!(matches!(
            manager.find("Named", "Alice"),
            Err(XoError::MissingDiscriminator(t)) if t == "Named"
        ));
        assert!(matches!(
            manager.find("Customer", 3),
            Err(XoError::MissingIndexedProperty(t)) if t == "Customer"
        ));
        assert!(manager.find("Nope", "x").is_err());

        assert_eq!(manager.find("Pet", "Rex").unwrap().count(), 2);
        assert!(matches!(
            manager.find("Pet", "Rex").unwrap().single(),
            Err(XoError::NotSingleResult(_))
        ));
        assert!(matches!(
            manager.find("Person", "Nobody").unwrap().single(),
            Err(XoError::NotSingleResult(_))
        ));
        let people = manager
            .find("Person", "Alice")
            .unwrap()
            .typed::<Person>()
            .collect::<XoResult<Vec<_>>>()
            .unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].name().unwrap().as_deref(), Some("Alice"));
        assert_eq!(store.open_cursors(), 0);
    }

    // -----------------------------------------------------------------------
    // 23. Composite instances
    // -----------------------------------------------------------------------
    #[test]
    fn composite_instances_carry_every_type() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();

        let composite = manager.create("Person", &["Customer"]).unwrap();
        assert_eq!(composite.type_names(), ["Person", "Customer"]);
        composite.object().set("name", "Alice").unwrap();
        composite.object().set("rating", 4).unwrap();
        assert_eq!(composite.as_type::<Person>().unwrap().name().unwrap().as_deref(), Some("Alice"));
        assert_eq!(composite.as_type::<Customer>().unwrap().rating().unwrap(), Some(4));
        assert!(composite.as_type::<Company>().is_err());
        assert!(composite.as_relation().is_err());

        let entity = composite.as_entity().unwrap();
        assert_eq!(
            store.snapshot().node(node(entity)).unwrap().labels,
            labels(&["Customer", "Person"])
        );

        let acme: Company = manager.create_typed().unwrap();
        acme.instance().set("name", "Acme").unwrap();
        assert!(acme.instance().has_type("Named"));

        assert!(matches!(manager.create("Named", &[]), Err(XoError::MissingDiscriminator(_))));
        assert!(manager.create("Nope", &[]).is_err());
    }

    // -----------------------------------------------------------------------
    // 24. Methods every instance answers
    // -----------------------------------------------------------------------
    #[test]
    fn lifecycle_methods() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let alice = person(&manager, "Alice");
        let bob = person(&manager, "Bob");

        assert_eq!(
            alice.call("toString", &[]).unwrap().into_value().unwrap(),
            Value::from(alice.to_string())
        );
        assert_eq!(
            alice.call("equals", &[Argument::from(&alice)]).unwrap().into_value().unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            alice.call("equals", &[Argument::from(&bob)]).unwrap().into_value().unwrap(),
            Value::Bool(false)
        );
        let hash = |e: &EntityInstance| e.call("hashCode", &[]).unwrap().into_value().unwrap();
        assert_eq!(hash(&alice), hash(&alice));
        assert!(matches!(
            alice.call("getId", &[]).unwrap(),
            Return::Id(id) if id == *alice.id()
        ));
    }

    // -----------------------------------------------------------------------
    // 25. The same mapping over the JSON document store
    // -----------------------------------------------------------------------
    #[test]
    fn json_document_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let datastore: Arc<dyn Datastore> = Arc::new(JsonFileDatastore::new(dir.path()).unwrap());
        let factory = XoManagerFactory::new(XoUnit::new("documents"), datastore, registry()).unwrap();
        {
            let manager = factory.create_manager().unwrap();
            let tx = manager.current_transaction();
            tx.begin().unwrap();
            let alice = person(&manager, "Alice");
            alice.set("age", 36).unwrap();
            let rex = create(&manager, "Pet", "Rex");
            assert!(matches!(
                manager.create_relation(&alice, "Owns", &rex),
                Err(XoError::Datastore(DatastoreError::Unsupported(_)))
            ));
            tx.commit().unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

        let manager = factory.create_manager().unwrap();
        let alice = manager.find("Person", "Alice").unwrap().single().unwrap();
        assert_eq!(alice.get::<i64>("age").unwrap(), Some(36));
        let customer: Customer = manager.migrate_typed(&alice).unwrap();
        assert_eq!(customer.instance().id(), alice.id());
        assert!(manager.find("Person", "Alice").unwrap().next().is_none());
    }

    // -----------------------------------------------------------------------
    // 26. Results opened in a transaction close with it
    // -----------------------------------------------------------------------
    #[test]
    fn open_results_close_when_transaction_completes() {
        let store = datastore();
        let factory = factory(&store);
        let manager = factory.create_manager().unwrap();
        let tx = manager.current_transaction();

        tx.begin().unwrap();
        person(&manager, "Alice");
        person(&manager, "Bob");
        let mut rows = manager.create_query("people").execute().unwrap();
        let mut found = manager.find("Person", "Alice").unwrap();
        assert_eq!(store.open_cursors(), 2);
        assert_eq!(manager.session().cursors().open(), 2);
        tx.rollback().unwrap();

        assert_eq!(store.open_cursors(), 0);
        assert!(rows.next().is_none());
        assert!(found.next().is_none());
        assert_eq!(store.snapshot().node_count(), 0);

        tx.begin().unwrap();
        person(&manager, "Carol");
        let mut rows = manager.create_query("people").execute().unwrap();
        let first = rows.next().unwrap().unwrap();
        assert_eq!(first.get_as::<String>("name").unwrap().as_deref(), Some("Carol"));
        tx.commit().unwrap();
        assert_eq!(store.open_cursors(), 0);
        assert!(rows.next().is_none());

        // Outside a transaction a result stays open until it is consumed.
        let implicit = manager.create_query("people").execute().unwrap();
        assert_eq!(store.open_cursors(), 1);
        assert_eq!(implicit.count(), 1);
        assert_eq!(store.open_cursors(), 0);
    }
}
