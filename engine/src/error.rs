//! Error types for the Tether engine.

use crate::{operation::OperationStatus, OperationId, SchemaVersion, TenantId};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Queue errors
    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("operation is not retryable: {0}")]
    NotRetryable(OperationId),

    #[error("operation is not discardable: {0}")]
    NotDiscardable(OperationId),

    #[error("operation is not in conflict: {0}")]
    NotInConflict(OperationId),

    // Storage errors
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("corrupt store document: {0}")]
    Corrupt(String),

    #[error("tenant mismatch: store belongs to '{found}', session is '{expected}'")]
    TenantMismatch { expected: TenantId, found: TenantId },

    // Migration errors
    #[error("store schema {stored} is newer than supported schema {expected}")]
    SchemaAhead {
        stored: SchemaVersion,
        expected: SchemaVersion,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
