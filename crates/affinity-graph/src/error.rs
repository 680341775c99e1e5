use affinity_runtime::AffinityError;
use affinity_types::{EntityKind, ObjectId, TypeError};

/// Errors reported by an [`crate::AttributeStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record exists for the object.
    #[error("record not found: {0}")]
    RecordNotFound(ObjectId),

    /// A record with this ID already exists.
    #[error("record already exists: {0}")]
    DuplicateRecord(ObjectId),

    /// Failure inside the storage backend.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from context and object operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Ownership check or marshalling failure.
    #[error(transparent)]
    Affinity(#[from] AffinityError),

    /// Schema or value check failure.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Storage collaborator failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No schema is registered for the entity kind.
    #[error("unknown entity kind '{0}'")]
    UnknownEntity(EntityKind),

    /// The entity kind was registered twice.
    #[error("entity kind '{0}' is registered twice")]
    DuplicateEntity(EntityKind),

    /// Set on a derived attribute that has no setter.
    #[error("attribute '{attribute}' of '{kind}' is read-only")]
    ReadOnlyAttribute { kind: EntityKind, attribute: String },

    /// The object was deleted from, or never belonged to, this context.
    #[error("object {0} is not registered with this context")]
    ObjectNotRegistered(ObjectId),

    /// The owning context has been dropped.
    #[error("the owning context has been released")]
    ContextReleased,
}

impl GraphError {
    /// The underlying affinity error, if this is one.
    pub fn as_affinity(&self) -> Option<&AffinityError> {
        match self {
            Self::Affinity(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` for marshal timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Affinity(AffinityError::Timeout { .. }))
    }

    /// Returns `true` when the owning thread has gone away.
    pub fn is_stale_owner(&self) -> bool {
        matches!(self, Self::Affinity(AffinityError::StaleOwner { .. }))
    }
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
