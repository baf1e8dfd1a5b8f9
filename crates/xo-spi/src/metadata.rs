use std::fmt;

use serde::{Deserialize, Serialize};

/// Datastore-facing view of a declared entity type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreEntityMetadata {
    /// Declared type name.
    pub type_name: String,
    /// Marker identifying records of this type (graph label, document type).
    /// Abstract types may have none.
    pub discriminator: Option<String>,
    /// Property used to look records up by value.
    pub indexed_property: Option<String>,
}

/// Datastore-facing view of a declared relation type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreRelationMetadata {
    pub type_name: String,
    /// Relationship type name in the store.
    pub discriminator: String,
}

/// Direction of a relation relative to one of its endpoint entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// The entity is the source of the relation (outgoing).
    From,
    /// The entity is the target of the relation (incoming).
    To,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::From => Self::To,
            Self::To => Self::From,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From => f.write_str("FROM"),
            Self::To => f.write_str("TO"),
        }
    }
}
