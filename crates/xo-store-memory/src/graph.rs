//! The property graph held by a [`MemoryDatastore`](crate::MemoryDatastore).
//!
//! Nodes carry a set of labels and a property map; relationships carry a
//! type, two endpoints and a property map. Ids are allocated from separate
//! monotonic counters for nodes and relationships.
//!
//! # Invariants
//!
//! - Every relationship endpoint resolves to an existing node.
//! - A node can only be deleted once no relationship is attached to it.
//! - `version` increases with every committed transaction.

use std::collections::{BTreeMap, BTreeSet};

use xo_api::{DatastoreError, DatastoreResult, RecordId, Value};
use xo_spi::Direction;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub labels: BTreeSet<String>,
    pub properties: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Relationship {
    pub kind: String,
    pub from: u64,
    pub to: u64,
    pub properties: BTreeMap<String, Value>,
}

/// A uniqueness constraint on a label/property pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UniqueConstraint {
    pub label: String,
    pub property: String,
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<u64, Node>,
    relationships: BTreeMap<u64, Relationship>,
    next_node_id: u64,
    next_relationship_id: u64,
    pub(crate) version: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn node(&self, id: u64) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn relationship(&self, id: u64) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    /// Ids of all nodes carrying `label`, ascending.
    pub fn nodes_with_label(&self, label: &str) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.labels.contains(label))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn node_property(&self, id: u64, name: &str) -> Option<&Value> {
        self.nodes.get(&id).and_then(|n| n.properties.get(name))
    }

    /// Relationships of `kind` attached to `node` in `direction`, in
    /// creation order.
    pub fn relationships_of(&self, node: u64, kind: &str, direction: Direction) -> Vec<u64> {
        self.relationships
            .iter()
            .filter(|(_, rel)| rel.kind == kind)
            .filter(|(_, rel)| match direction {
                Direction::From => rel.from == node,
                Direction::To => rel.to == node,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    // ---------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------

    pub(crate) fn create_node(&mut self, labels: BTreeSet<String>) -> u64 {
        self.next_node_id += 1;
        let id = self.next_node_id;
        self.nodes.insert(
            id,
            Node {
                labels,
                properties: BTreeMap::new(),
            },
        );
        id
    }

    /// Delete a node. Fails while relationships are still attached.
    pub(crate) fn delete_node(&mut self, id: u64) -> DatastoreResult<()> {
        if !self.nodes.contains_key(&id) {
            return Err(DatastoreError::RecordNotFound(RecordId::Numeric(id)));
        }
        let attached = self
            .relationships
            .values()
            .filter(|rel| rel.from == id || rel.to == id)
            .count();
        if attached > 0 {
            return Err(DatastoreError::Backend(format!(
                "node {id} still has {attached} relationship(s)"
            )));
        }
        self.nodes.remove(&id);
        Ok(())
    }

    pub(crate) fn node_mut(&mut self, id: u64) -> DatastoreResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or(DatastoreError::RecordNotFound(RecordId::Numeric(id)))
    }

    pub(crate) fn create_relationship(
        &mut self,
        from: u64,
        kind: &str,
        to: u64,
    ) -> DatastoreResult<u64> {
        for endpoint in [from, to] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(DatastoreError::RecordNotFound(RecordId::Numeric(endpoint)));
            }
        }
        self.next_relationship_id += 1;
        let id = self.next_relationship_id;
        self.relationships.insert(
            id,
            Relationship {
                kind: kind.to_string(),
                from,
                to,
                properties: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    pub(crate) fn delete_relationship(&mut self, id: u64) -> DatastoreResult<()> {
        self.relationships
            .remove(&id)
            .map(|_| ())
            .ok_or(DatastoreError::RecordNotFound(RecordId::Numeric(id)))
    }

    pub(crate) fn relationship_mut(&mut self, id: u64) -> DatastoreResult<&mut Relationship> {
        self.relationships
            .get_mut(&id)
            .ok_or(DatastoreError::RecordNotFound(RecordId::Numeric(id)))
    }

    /// Check `constraints` against node `id`.
    pub(crate) fn check_unique(
        &self,
        id: u64,
        constraints: &[UniqueConstraint],
    ) -> DatastoreResult<()> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(DatastoreError::RecordNotFound(RecordId::Numeric(id)))?;
        for constraint in constraints {
            if !node.labels.contains(&constraint.label) {
                continue;
            }
            let Some(value) = node.properties.get(&constraint.property) else {
                continue;
            };
            let clash = self.nodes.iter().any(|(other_id, other)| {
                *other_id != id
                    && other.labels.contains(&constraint.label)
                    && other.properties.get(&constraint.property) == Some(value)
            });
            if clash {
                return Err(DatastoreError::Backend(format!(
                    "node {id} violates unique constraint on :{}({}) with value {value}",
                    constraint.label, constraint.property
                )));
            }
        }
        Ok(())
    }
}
