use thiserror::Error;

use crate::{config::ConfigError, operation::OperationKind, predicate::PredicateError};

/// Failure reported by a store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
}

fn for_operation(operation: &Option<OperationKind>) -> String {
    match operation {
        Some(operation) => format!(" for {}", operation),
        None => String::new(),
    }
}

fn at_chunk(chunk: &Option<usize>) -> String {
    match chunk {
        Some(chunk) => format!(" at chunk {}", chunk),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum BulkError {
    #[error(
        "{operation} failed at chunk {chunk}: records {first} and {second} share merge key {key}"
    )]
    DuplicateKey { operation: OperationKind, chunk: usize, key: String, first: usize, second: usize },

    #[error("{operation} failed{}: store unavailable: {cause}", at_chunk(.chunk))]
    StoreUnavailable { operation: OperationKind, chunk: Option<usize>, cause: String },

    #[error("{operation} failed{}: constraint violation: {cause}", at_chunk(.chunk))]
    ConstraintViolation { operation: OperationKind, chunk: Option<usize>, cause: String },

    #[error("{operation} failed{}: schema mismatch: {cause}", at_chunk(.chunk))]
    SchemaMismatch { operation: OperationKind, chunk: Option<usize>, cause: String },

    #[error("{operation} failed at chunk {chunk}: records {records:?} matched no stored row")]
    NotFound { operation: OperationKind, chunk: usize, records: Vec<usize> },

    #[error("{operation} failed: unsupported predicate: {cause}")]
    UnsupportedPredicate { operation: OperationKind, cause: String },

    #[error("{operation} cancelled{}", at_chunk(.chunk))]
    Cancelled { operation: OperationKind, chunk: Option<usize> },

    /// `operation` is `None` only when the engine itself is being built.
    #[error("Invalid bulk configuration{}: {source}", for_operation(.operation))]
    InvalidConfig { operation: Option<OperationKind>, source: ConfigError },
}

impl BulkError {
    pub fn from_store(operation: OperationKind, chunk: Option<usize>, error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(cause) => BulkError::StoreUnavailable { operation, chunk, cause },
            StoreError::ConstraintViolation(cause) => {
                BulkError::ConstraintViolation { operation, chunk, cause }
            }
            StoreError::SchemaMismatch(cause) => BulkError::SchemaMismatch { operation, chunk, cause },
        }
    }

    pub fn from_predicate(operation: OperationKind, error: PredicateError) -> Self {
        if error.is_unsupported() {
            BulkError::UnsupportedPredicate { operation, cause: error.to_string() }
        } else {
            BulkError::SchemaMismatch { operation, chunk: None, cause: error.to_string() }
        }
    }

    pub fn invalid_config(operation: Option<OperationKind>, source: ConfigError) -> Self {
        BulkError::InvalidConfig { operation, source }
    }

    pub fn schema_mismatch(
        operation: OperationKind,
        chunk: Option<usize>,
        cause: impl Into<String>,
    ) -> Self {
        BulkError::SchemaMismatch { operation, chunk, cause: cause.into() }
    }

    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            BulkError::DuplicateKey { operation, .. } |
            BulkError::StoreUnavailable { operation, .. } |
            BulkError::ConstraintViolation { operation, .. } |
            BulkError::SchemaMismatch { operation, .. } |
            BulkError::NotFound { operation, .. } |
            BulkError::UnsupportedPredicate { operation, .. } |
            BulkError::Cancelled { operation, .. } => Some(*operation),
            BulkError::InvalidConfig { operation, .. } => *operation,
        }
    }

    /// Index of the chunk that failed, when the failure belongs to one.
    pub fn chunk(&self) -> Option<usize> {
        match self {
            BulkError::DuplicateKey { chunk, .. } | BulkError::NotFound { chunk, .. } => Some(*chunk),
            BulkError::StoreUnavailable { chunk, .. } |
            BulkError::ConstraintViolation { chunk, .. } |
            BulkError::SchemaMismatch { chunk, .. } |
            BulkError::Cancelled { chunk, .. } => *chunk,
            BulkError::UnsupportedPredicate { .. } | BulkError::InvalidConfig { .. } => None,
        }
    }

    /// Transport failures are worth retrying, everything else fails the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BulkError::StoreUnavailable { .. })
    }
}
