use std::fmt::{self, Debug};
use std::hash::Hash;

use xo_api::RecordId;

/// Common surface of datastore record handles.
pub trait Record: Clone + Debug + Eq + Hash + 'static {
    /// Short name of the record kind ("entity", "relation").
    const KIND: &'static str;

    fn id(&self) -> &RecordId;
}

/// Handle of a persisted entity (graph node, JSON document, ...).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    id: RecordId,
}

impl Entity {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self { id: id.into() }
    }
}

impl Record for Entity {
    const KIND: &'static str = "entity";

    fn id(&self) -> &RecordId {
        &self.id
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.id)
    }
}

/// Handle of a persisted relation (graph relationship).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Relation {
    id: RecordId,
}

impl Relation {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self { id: id.into() }
    }
}

impl Record for Relation {
    const KIND: &'static str = "relation";

    fn id(&self) -> &RecordId {
        &self.id
    }
}

impl Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Relation({})", self.id)
    }
}
