use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};
use xo_api::{DatastoreError, DatastoreResult, RecordId, Value};
use xo_spi::{
    DatastoreEntityMetadata, DatastoreSession, DatastoreTransaction, Direction, Entity,
    EntityCursor, Record, Relation, Row, RowCursor, VecCursor,
};

use crate::datastore::{poisoned, Flushed, Shared};
use crate::graph::Graph;

fn numeric(id: &RecordId) -> DatastoreResult<u64> {
    id.as_numeric()
        .ok_or_else(|| DatastoreError::RecordNotFound(id.clone()))
}

/// Snapshot transaction over the shared graph.
///
/// `begin` takes a private copy of the committed graph; `commit` installs
/// the copy if nobody else committed in between.
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    working: RefCell<Option<Graph>>,
}

impl MemoryTransaction {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            working: RefCell::new(None),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Graph) -> DatastoreResult<T>) -> DatastoreResult<T> {
        if let Some(graph) = self.working.borrow().as_ref() {
            return f(graph);
        }
        let graph = self.shared.graph.read().map_err(poisoned)?;
        f(&graph)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Graph) -> DatastoreResult<T>) -> DatastoreResult<T> {
        let mut working = self.working.borrow_mut();
        let graph = working.as_mut().ok_or(DatastoreError::NoTransaction)?;
        f(graph)
    }
}

impl DatastoreTransaction for MemoryTransaction {
    fn begin(&self) -> DatastoreResult<()> {
        let mut working = self.working.borrow_mut();
        if working.is_some() {
            return Err(DatastoreError::TransactionActive);
        }
        let snapshot = self.shared.graph.read().map_err(poisoned)?.clone();
        debug!(version = snapshot.version, "memory transaction begin");
        *working = Some(snapshot);
        Ok(())
    }

    fn commit(&self) -> DatastoreResult<()> {
        let mut graph = self
            .working
            .borrow_mut()
            .take()
            .ok_or(DatastoreError::NoTransaction)?;
        let mut committed = self.shared.graph.write().map_err(poisoned)?;
        if committed.version != graph.version {
            warn!(
                base = graph.version,
                current = committed.version,
                "memory transaction conflicts with a concurrent commit"
            );
            return Err(DatastoreError::Backend(format!(
                "concurrent modification: transaction based on version {} but graph is at {}",
                graph.version, committed.version
            )));
        }
        graph.version += 1;
        debug!(version = graph.version, "memory transaction commit");
        *committed = graph;
        Ok(())
    }

    fn rollback(&self) -> DatastoreResult<()> {
        let graph = self
            .working
            .borrow_mut()
            .take()
            .ok_or(DatastoreError::NoTransaction)?;
        debug!(version = graph.version, "memory transaction rollback");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.working.borrow().is_some()
    }
}

/// Session of a [`MemoryDatastore`](crate::MemoryDatastore).
///
/// Reads outside a transaction see the committed graph. Writes require an
/// active transaction.
pub struct MemorySession {
    shared: Arc<Shared>,
    transaction: MemoryTransaction,
}

impl MemorySession {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            transaction: MemoryTransaction::new(shared.clone()),
            shared,
        }
    }

    fn cursor<T: 'static>(&self, items: Vec<T>) -> VecCursor<T> {
        self.shared.open_cursors.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.clone();
        VecCursor::new(items).on_close(move || {
            shared.open_cursors.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn log_flush(&self, flushed: Flushed) -> DatastoreResult<()> {
        self.shared.flush_log.lock().map_err(poisoned)?.push(flushed);
        Ok(())
    }
}

impl DatastoreSession for MemorySession {
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
        let found = self.transaction.read(|graph| {
            Ok(graph
                .nodes_with_label(discriminator)
                .into_iter()
                .filter(|id| graph.node_property(*id, property) == Some(value))
                .map(Entity::new)
                .collect::<Vec<_>>())
        })?;
        Ok(Box::new(self.cursor(found)))
    }

    fn create_entity(&self, discriminators: &BTreeSet<String>) -> DatastoreResult<Entity> {
        let id = self
            .transaction
            .write(|graph| Ok(graph.create_node(discriminators.clone())))?;
        Ok(Entity::new(id))
    }

    fn delete_entity(&self, entity: &Entity) -> DatastoreResult<()> {
        let id = numeric(entity.id())?;
        self.transaction.write(|graph| graph.delete_node(id))
    }

    fn entity_discriminators(&self, entity: &Entity) -> DatastoreResult<BTreeSet<String>> {
        let id = numeric(entity.id())?;
        self.transaction.read(|graph| {
            graph
                .node(id)
                .map(|node| node.labels.clone())
                .ok_or_else(|| DatastoreError::RecordNotFound(entity.id().clone()))
        })
    }

    fn migrate_entity(
        &self,
        entity: &Entity,
        old_discriminators: &BTreeSet<String>,
        new_discriminators: &BTreeSet<String>,
    ) -> DatastoreResult<()> {
        let id = numeric(entity.id())?;
        if new_discriminators.is_empty() {
            return Err(DatastoreError::Backend(format!(
                "cannot migrate node {id} to an empty label set"
            )));
        }
        let constraints = self.shared.constraints.read().map_err(poisoned)?.clone();
        self.transaction.write(|graph| {
            let node = graph.node_mut(id)?;
            if &node.labels != old_discriminators {
                return Err(DatastoreError::Backend(format!(
                    "node {id} labels {:?} do not match expected {:?}",
                    node.labels, old_discriminators
                )));
            }
            let previous = std::mem::replace(&mut node.labels, new_discriminators.clone());
            // New labels must not break a unique constraint; keep the old ones if they do.
            if let Err(e) = graph.check_unique(id, &constraints) {
                graph.node_mut(id)?.labels = previous;
                return Err(e);
            }
            Ok(())
        })
    }

    fn flush_entity(&self, entity: &Entity) -> DatastoreResult<()> {
        let id = numeric(entity.id())?;
        let constraints = self.shared.constraints.read().map_err(poisoned)?.clone();
        self.transaction
            .read(|graph| graph.check_unique(id, &constraints))?;
        self.log_flush(Flushed::Entity(entity.id().clone()))
    }

    fn entity_property(&self, entity: &Entity, name: &str) -> DatastoreResult<Option<Value>> {
        let id = numeric(entity.id())?;
        self.transaction.read(|graph| {
            let node = graph
                .node(id)
                .ok_or_else(|| DatastoreError::RecordNotFound(entity.id().clone()))?;
            Ok(node.properties.get(name).cloned())
        })
    }

    fn set_entity_property(&self, entity: &Entity, name: &str, value: Value) -> DatastoreResult<()> {
        let id = numeric(entity.id())?;
        self.transaction.write(|graph| {
            let node = graph.node_mut(id)?;
            if value.is_null() {
                node.properties.remove(name);
            } else {
                node.properties.insert(name.to_string(), value);
            }
            Ok(())
        })
    }

    fn remove_entity_property(&self, entity: &Entity, name: &str) -> DatastoreResult<()> {
        let id = numeric(entity.id())?;
        self.transaction.write(|graph| {
            graph.node_mut(id)?.properties.remove(name);
            Ok(())
        })
    }

    fn create_relation(
        &self,
        from: &Entity,
        discriminator: &str,
        to: &Entity,
    ) -> DatastoreResult<Relation> {
        let (from, to) = (numeric(from.id())?, numeric(to.id())?);
        let id = self
            .transaction
            .write(|graph| graph.create_relationship(from, discriminator, to))?;
        Ok(Relation::new(id))
    }

    fn delete_relation(&self, relation: &Relation) -> DatastoreResult<()> {
        let id = numeric(relation.id())?;
        self.transaction.write(|graph| graph.delete_relationship(id))
    }

    fn relations(
        &self,
        entity: &Entity,
        discriminator: &str,
        direction: Direction,
    ) -> DatastoreResult<Vec<Relation>> {
        let id = numeric(entity.id())?;
        self.transaction.read(|graph| {
            Ok(graph
                .relationships_of(id, discriminator, direction)
                .into_iter()
                .map(Relation::new)
                .collect())
        })
    }

    fn relation_discriminator(&self, relation: &Relation) -> DatastoreResult<String> {
        let id = numeric(relation.id())?;
        self.transaction.read(|graph| {
            graph
                .relationship(id)
                .map(|rel| rel.kind.clone())
                .ok_or_else(|| DatastoreError::RecordNotFound(relation.id().clone()))
        })
    }

    fn relation_from(&self, relation: &Relation) -> DatastoreResult<Entity> {
        let id = numeric(relation.id())?;
        self.transaction.read(|graph| {
            graph
                .relationship(id)
                .map(|rel| Entity::new(rel.from))
                .ok_or_else(|| DatastoreError::RecordNotFound(relation.id().clone()))
        })
    }

    fn relation_to(&self, relation: &Relation) -> DatastoreResult<Entity> {
        let id = numeric(relation.id())?;
        self.transaction.read(|graph| {
            graph
                .relationship(id)
                .map(|rel| Entity::new(rel.to))
                .ok_or_else(|| DatastoreError::RecordNotFound(relation.id().clone()))
        })
    }

    fn flush_relation(&self, relation: &Relation) -> DatastoreResult<()> {
        let id = numeric(relation.id())?;
        self.transaction.read(|graph| {
            graph
                .relationship(id)
                .map(|_| ())
                .ok_or_else(|| DatastoreError::RecordNotFound(relation.id().clone()))
        })?;
        self.log_flush(Flushed::Relation(relation.id().clone()))
    }

    fn relation_property(&self, relation: &Relation, name: &str) -> DatastoreResult<Option<Value>> {
        let id = numeric(relation.id())?;
        self.transaction.read(|graph| {
            let rel = graph
                .relationship(id)
                .ok_or_else(|| DatastoreError::RecordNotFound(relation.id().clone()))?;
            Ok(rel.properties.get(name).cloned())
        })
    }

    fn set_relation_property(
        &self,
        relation: &Relation,
        name: &str,
        value: Value,
    ) -> DatastoreResult<()> {
        let id = numeric(relation.id())?;
        self.transaction.write(|graph| {
            let rel = graph.relationship_mut(id)?;
            if value.is_null() {
                rel.properties.remove(name);
            } else {
                rel.properties.insert(name.to_string(), value);
            }
            Ok(())
        })
    }

    fn remove_relation_property(&self, relation: &Relation, name: &str) -> DatastoreResult<()> {
        let id = numeric(relation.id())?;
        self.transaction.write(|graph| {
            graph.relationship_mut(id)?.properties.remove(name);
            Ok(())
        })
    }

    fn execute_query(
        &self,
        expression: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> DatastoreResult<RowCursor> {
        let handler = self
            .shared
            .queries
            .read()
            .map_err(poisoned)?
            .get(expression.trim())
            .cloned()
            .ok_or_else(|| {
                DatastoreError::Unsupported(format!("no query handler for '{expression}'"))
            })?;
        let rows: Vec<Row> = self.transaction.read(|graph| handler(graph, parameters))?;
        debug!(expression, rows = rows.len(), "memory query executed");
        Ok(Box::new(self.cursor(rows)))
    }

    fn close(&self) -> DatastoreResult<()> {
        if self.transaction.is_active() {
            warn!("memory session closed with an active transaction; rolling back");
            self.transaction.rollback()?;
        }
        Ok(())
    }
}
