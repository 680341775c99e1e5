use thiserror::Error;

use crate::value::ValueKind;

/// Errors produced by schema and value checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("entity '{kind}' has no attribute '{attribute}'")]
    UnknownAttribute { kind: String, attribute: String },

    #[error("attribute '{attribute}' expects {expected}, got {actual}")]
    KindMismatch {
        attribute: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("attribute '{attribute}' is required")]
    MissingRequired { attribute: String },

    #[error("attribute '{attribute}' is defined more than once")]
    DuplicateAttribute { attribute: String },

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),
}
