use crate::validation::ConstraintViolation;
use crate::value::RecordId;

/// Root error of every XO operation.
///
/// Errors are raised synchronously to the immediate caller; the core never
/// retries or suppresses them.
#[derive(Debug, thiserror::Error)]
pub enum XoError {
    /// The object is not tracked by the responsible instance manager
    /// (stale reference, already deleted or migrated).
    #[error("{0} is not a managed instance")]
    UnmanagedInstance(String),

    /// The declared property type has no supported mapping strategy.
    #[error("unsupported type {type_name} for property '{property}'")]
    UnsupportedPropertyType { property: String, type_name: String },

    /// Neither endpoint of the relation type matches the given instances.
    #[error("relation type {relation} cannot connect [{from_types}] to [{to_types}]")]
    RelationDirection {
        relation: String,
        from_types: String,
        to_types: String,
    },

    /// A query parameter was bound twice.
    #[error("parameter '{0}' has already been assigned")]
    DuplicateParameter(String),

    /// The query result has no column with this name.
    #[error("query result does not contain column '{0}'")]
    ColumnNotFound(String),

    /// The column exists but cannot be converted to the requested type.
    #[error("column '{column}' holds {actual}, expected {expected}")]
    ColumnType {
        column: String,
        expected: String,
        actual: String,
    },

    /// Strict propagation requires an ambient transaction and none is active.
    #[error("no active transaction")]
    NoActiveTransaction,

    /// The type cannot be looked up by value because it has no discriminator.
    #[error("type {0} has no discriminator (i.e. cannot be identified in datastore)")]
    MissingDiscriminator(String),

    /// The type has no indexed property to look up by value.
    #[error("type {0} has no indexed property")]
    MissingIndexedProperty(String),

    #[error("unknown type {0}")]
    UnknownType(String),

    #[error("type {type_name} has no method '{method}'")]
    UnknownMethod { type_name: String, method: String },

    #[error("invalid argument for '{method}': {reason}")]
    InvalidArgument { method: String, reason: String },

    /// A transaction operation is illegal in the current state.
    #[error("illegal transaction state: {0}")]
    TransactionState(String),

    /// Blocking constraint violations prevented the commit.
    #[error("{} blocking constraint violation(s)", .0.len())]
    ConstraintViolations(Vec<ConstraintViolation>),

    #[error("expected exactly one result, found {0}")]
    NotSingleResult(String),

    #[error("session is closed")]
    SessionClosed,

    /// Type registration produced inconsistent metadata.
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

impl XoError {
    /// Create an invalid argument error for a method.
    pub fn invalid_argument(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            method: method.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for XO operations.
pub type XoResult<T> = Result<T, XoError>;

/// Errors reported by datastore adapters.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("no active datastore transaction")]
    NoTransaction,

    #[error("datastore transaction is already active")]
    TransactionActive,

    /// The datastore does not implement the requested capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other backend specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Result alias for datastore adapter operations.
pub type DatastoreResult<T> = Result<T, DatastoreError>;
