#![allow(missing_docs)]

//! Error taxonomy shared by every engine component.
//!
//! Errors carry enough structure (record type, field or constraint name,
//! offending value) for a binding layer to render a precise diagnostic
//! without going back to the store. [`EngineError::code`] gives a stable
//! machine-readable name for each variant.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StoreError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Registration-time failures raised by the schema registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Registration attempted after `finalize()`.
    #[error("schema is frozen; no registrations are accepted after finalize()")]
    Frozen,
    #[error("record type '{name}' is registered twice")]
    DuplicateType { name: String },
    #[error("enum '{name}' is registered twice")]
    DuplicateEnum { name: String },
    #[error("field '{field}' is declared twice on '{record_type}'")]
    DuplicateField { record_type: String, field: String },
    #[error("unknown record type '{name}' referenced by {context}")]
    UnknownType { name: String, context: String },
    #[error("field '{field}' on '{record_type}' references unknown enum '{name}'")]
    UnknownEnum {
        record_type: String,
        field: String,
        name: String,
    },
    #[error("unknown field '{field}' on '{record_type}' referenced by {context}")]
    UnknownField {
        record_type: String,
        field: String,
        context: String,
    },
    #[error("record type '{record_type}' has no primary key")]
    MissingPrimaryKey { record_type: String },
    #[error("relation '{record_type}.{relation}' names inverse '{inverse}' which does not exist on '{target}'")]
    MissingInverse {
        record_type: String,
        relation: String,
        target: String,
        inverse: String,
    },
    #[error("relation '{record_type}.{relation}' and its inverse '{target}.{inverse}' disagree: {reason}")]
    InverseMismatch {
        record_type: String,
        relation: String,
        target: String,
        inverse: String,
        reason: String,
    },
    #[error("relations '{first}' and '{second}' both claim '{target}.{inverse}' as their inverse")]
    ConflictingInverse {
        target: String,
        inverse: String,
        first: String,
        second: String,
    },
    #[error("relation '{record_type}.{relation}' is invalid: {reason}")]
    InvalidRelation {
        record_type: String,
        relation: String,
        reason: String,
    },
    #[error("field '{record_type}.{field}' has an invalid default: {reason}")]
    InvalidDefault {
        record_type: String,
        field: String,
        reason: String,
    },
}

/// Every failure the engine can surface to a caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("unknown record type '{name}'")]
    UnknownRecordType { name: String },
    #[error("unknown field '{field}' on '{record_type}' in {context}")]
    InvalidField {
        record_type: String,
        field: String,
        context: &'static str,
    },
    #[error("'{record_type}.{field}' expects {expected}, got {found}")]
    TypeMismatch {
        record_type: String,
        field: String,
        expected: String,
        found: String,
    },
    #[error("query on '{record_type}' specifies both select and omit")]
    AmbiguousSelectOmit { record_type: String },
    #[error("relation '{relation}' is not declared on '{record_type}'")]
    RelationNotLoadable {
        record_type: String,
        relation: String,
    },
    #[error("cursor {cursor} does not resolve to a '{record_type}' record")]
    CursorNotFound { record_type: String, cursor: String },
    #[error("projection of '{record_type}.{relation}' includes itself (path {path})")]
    ProjectionCycle {
        record_type: String,
        relation: String,
        path: String,
    },
    #[error("projection nests {depth} relations deep (max {max})")]
    ProjectionTooDeep { depth: usize, max: usize },
    #[error("relation loading fetched {loaded} records (max {max})")]
    FanoutExceeded { loaded: usize, max: usize },
    #[error("invalid aggregation on '{record_type}': {reason}")]
    InvalidAggregate { record_type: String, reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required field '{record_type}.{field}' is missing")]
    MissingField { record_type: String, field: String },
    #[error("no '{record_type}' record matched {operation}")]
    RecordNotFound {
        record_type: String,
        operation: &'static str,
    },
    #[error("unique constraint '{constraint}' on '{record_type}' violated by {value}")]
    UniqueConstraintViolation {
        record_type: String,
        constraint: String,
        fields: Vec<String>,
        value: String,
    },
    #[error("foreign key '{record_type}.{relation}' violated by {value}")]
    ForeignKeyViolation {
        record_type: String,
        relation: String,
        fields: Vec<String>,
        value: String,
    },
    #[error("one-to-one relation '{record_type}.{relation}' is already claimed for {value}")]
    CardinalityViolation {
        record_type: String,
        relation: String,
        value: String,
    },
    #[error("timed out after {waited_ms}ms waiting for a transaction slot")]
    TransactionAcquireTimeout { waited_ms: u64 },
    #[error("transaction exceeded its {timeout_ms}ms timeout ({elapsed_ms}ms elapsed)")]
    TransactionTimeout { timeout_ms: u64, elapsed_ms: u64 },
    #[error("transaction {txn} is no longer active")]
    TransactionClosed { txn: u64 },
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Schema(SchemaError::Frozen) => "SchemaFrozen",
            EngineError::Schema(_) => "SchemaError",
            EngineError::UnknownRecordType { .. } => "UnknownRecordType",
            EngineError::InvalidField { .. } => "InvalidField",
            EngineError::TypeMismatch { .. } => "TypeMismatch",
            EngineError::AmbiguousSelectOmit { .. } => "AmbiguousSelectOmit",
            EngineError::RelationNotLoadable { .. } => "RelationNotLoadable",
            EngineError::CursorNotFound { .. } => "CursorNotFound",
            EngineError::ProjectionCycle { .. } => "ProjectionCycle",
            EngineError::ProjectionTooDeep { .. } => "ProjectionTooDeep",
            EngineError::FanoutExceeded { .. } => "FanoutExceeded",
            EngineError::InvalidAggregate { .. } => "InvalidAggregate",
            EngineError::InvalidArgument(_) => "InvalidArgument",
            EngineError::MissingField { .. } => "MissingField",
            EngineError::RecordNotFound { .. } => "RecordNotFound",
            EngineError::UniqueConstraintViolation { .. } => "UniqueConstraint",
            EngineError::ForeignKeyViolation { .. } => "ForeignKey",
            EngineError::CardinalityViolation { .. } => "Cardinality",
            EngineError::TransactionAcquireTimeout { .. } => "TransactionAcquireTimeout",
            EngineError::TransactionTimeout { .. } => "TransactionTimeout",
            EngineError::TransactionClosed { .. } => "TransactionClosed",
            EngineError::Store(_) => "Store",
            EngineError::Config(_) => "Config",
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransactionAcquireTimeout { .. } | EngineError::TransactionTimeout { .. }
        )
    }

    /// Builds an [`EngineError::InvalidField`] for a specific context.
    pub fn invalid_field(
        record_type: impl Into<String>,
        field: impl Into<String>,
        context: &'static str,
    ) -> Self {
        EngineError::InvalidField {
            record_type: record_type.into(),
            field: field.into(),
            context,
        }
    }

    /// Builds an [`EngineError::RelationNotLoadable`].
    pub fn relation_not_loadable(record_type: impl Into<String>, relation: impl Into<String>) -> Self {
        EngineError::RelationNotLoadable {
            record_type: record_type.into(),
            relation: relation.into(),
        }
    }
}

impl From<StoreError> for EngineError {
    /// Constraint-shaped store failures surface as their engine kinds so
    /// callers can branch on them regardless of which layer detected them.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation {
                record_type,
                constraint,
                fields,
                value,
            } => EngineError::UniqueConstraintViolation {
                record_type,
                constraint,
                fields,
                value,
            },
            other => EngineError::Store(other),
        }
    }
}

/// Convenience wrapper that formats engine errors with their codes.
pub struct EngineErrorWithCode<'a>(pub &'a EngineError);

impl fmt::Display for EngineErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
