//! Error types for the msync engine.

use crate::{EntityId, OperationId};
use thiserror::Error;

/// All possible errors from the msync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("unknown field '{field}' on {entity_type}")]
    UnknownField { entity_type: String, field: String },

    #[error("field '{0}' is managed by the engine and cannot be set")]
    SystemField(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    // Record errors
    #[error("record not found: {0}")]
    RecordNotFound(EntityId),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(EntityId),

    #[error("operation on deleted record: {0}")]
    OperationOnDeleted(EntityId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    // Conflict errors
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    // Clock errors
    #[error("invalid HLC '{value}': {reason}")]
    InvalidHlc { value: String, reason: String },

    // Bundle errors
    #[error("no operations to export")]
    NothingToExport,

    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("incorrect passphrase or tampered bundle")]
    IncorrectPassphrase,

    #[error("encryption failed: {0}")]
    Encryption(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    pub(crate) fn invalid_hlc(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidHlc {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
