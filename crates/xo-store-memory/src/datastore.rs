use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;
use xo_api::{DatastoreError, DatastoreResult, RecordId, Value};
use xo_spi::{Datastore, DatastoreEntityMetadata, DatastoreRelationMetadata, DatastoreSession, Row};

use crate::graph::{Graph, UniqueConstraint};
use crate::session::MemorySession;

/// A query implementation: reads the graph, returns rows.
///
/// Entities and relations in result rows are returned as
/// [`Value::Entity`] / [`Value::Relation`] with numeric ids.
pub type QueryHandler =
    Arc<dyn Fn(&Graph, &BTreeMap<String, Value>) -> DatastoreResult<Vec<Row>> + Send + Sync>;

/// A record flushed by a session, in flush order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flushed {
    Entity(RecordId),
    Relation(RecordId),
}

/// State shared by the datastore and all of its sessions.
pub(crate) struct Shared {
    pub(crate) graph: RwLock<Graph>,
    pub(crate) queries: RwLock<HashMap<String, QueryHandler>>,
    pub(crate) constraints: RwLock<Vec<UniqueConstraint>>,
    pub(crate) open_cursors: AtomicUsize,
    pub(crate) flush_log: Mutex<Vec<Flushed>>,
}

pub(crate) fn poisoned<E: std::fmt::Display>(e: E) -> DatastoreError {
    DatastoreError::Backend(format!("lock poisoned: {e}"))
}

/// Embedded in-memory property graph datastore.
///
/// Sessions run their transactions on a private copy of the graph which
/// replaces the shared graph on commit. A commit fails if another session
/// committed since this transaction began.
pub struct MemoryDatastore {
    shared: Arc<Shared>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                graph: RwLock::new(Graph::new()),
                queries: RwLock::new(HashMap::new()),
                constraints: RwLock::new(Vec::new()),
                open_cursors: AtomicUsize::new(0),
                flush_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the handler executed for query `expression`.
    pub fn define_query<F>(&self, expression: impl Into<String>, handler: F)
    where
        F: Fn(&Graph, &BTreeMap<String, Value>) -> DatastoreResult<Vec<Row>> + Send + Sync + 'static,
    {
        self.shared
            .queries
            .write()
            .expect("lock poisoned")
            .insert(expression.into(), Arc::new(handler));
    }

    /// Require `property` to be unique among nodes labelled `label`.
    /// Checked when an entity is flushed.
    pub fn unique_constraint(&self, label: impl Into<String>, property: impl Into<String>) {
        let constraint = UniqueConstraint {
            label: label.into(),
            property: property.into(),
        };
        let mut constraints = self.shared.constraints.write().expect("lock poisoned");
        if !constraints.contains(&constraint) {
            constraints.push(constraint);
        }
    }

    /// A copy of the committed graph.
    pub fn snapshot(&self) -> Graph {
        self.shared.graph.read().expect("lock poisoned").clone()
    }

    /// Number of cursors handed out and not yet closed or dropped.
    pub fn open_cursors(&self) -> usize {
        self.shared.open_cursors.load(Ordering::SeqCst)
    }

    /// Every flush performed by any session, in order.
    pub fn flush_log(&self) -> Vec<Flushed> {
        self.shared.flush_log.lock().expect("lock poisoned").clone()
    }

    pub fn clear_flush_log(&self) {
        self.shared.flush_log.lock().expect("lock poisoned").clear();
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore for MemoryDatastore {
    fn init(
        &self,
        entities: &[DatastoreEntityMetadata],
        relations: &[DatastoreRelationMetadata],
    ) -> DatastoreResult<()> {
        debug!(
            entities = entities.len(),
            relations = relations.len(),
            "memory datastore initialized"
        );
        Ok(())
    }

    fn create_session(&self) -> DatastoreResult<Box<dyn DatastoreSession>> {
        Ok(Box::new(MemorySession::new(self.shared.clone())))
    }

    fn close(&self) -> DatastoreResult<()> {
        let open = self.open_cursors();
        if open > 0 {
            tracing::warn!(open, "memory datastore closed with open cursors");
        }
        Ok(())
    }
}
