//! Record storage collaborator.
//!
//! The engine talks to its backing store exclusively through the
//! [`RecordStore`] trait: snapshot-scoped reads plus transactional writes.
//! [`MemoryStore`] is the multi-version in-memory implementation used by
//! default and by the test suite.

/// Multi-version in-memory store.
///
/// Keeps a version chain per record and resolves visibility per [`ReadView`].
pub mod memory;

/// MVCC version headers and commit bookkeeping.
pub mod mvcc;

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::query::value::Value;
use crate::types::{RecordId, TxnId};

pub use memory::MemoryStore;
pub use mvcc::{CommitId, COMMIT_MAX};

/// Field map of a stored record.
pub type Fields = BTreeMap<String, Value>;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

static NULL_VALUE: Value = Value::Null;

/// One record version as seen through a [`ReadView`].
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Store-assigned identity.
    pub id: RecordId,
    /// Scalar field values.
    pub fields: Fields,
}

impl Record {
    /// Field value, `Null` when absent.
    pub fn value(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL_VALUE)
    }

    /// Values of several fields, in order.
    pub fn tuple<S: AsRef<str>>(&self, fields: &[S]) -> Vec<Value> {
        fields
            .iter()
            .map(|f| self.value(f.as_ref()).clone())
            .collect()
    }
}

/// Which versions a read observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadView {
    /// Newest commit included in the snapshot.
    pub snapshot: CommitId,
    /// Transaction whose own pending writes are visible.
    pub txn: Option<TxnId>,
    /// Whether pending writes of every transaction are visible.
    pub dirty: bool,
}

impl ReadView {
    /// Committed state as of `snapshot`.
    pub fn committed(snapshot: CommitId) -> Self {
        Self {
            snapshot,
            txn: None,
            dirty: false,
        }
    }

    /// Snapshot plus the pending writes of `txn`.
    pub fn within(snapshot: CommitId, txn: TxnId) -> Self {
        Self {
            snapshot,
            txn: Some(txn),
            dirty: false,
        }
    }

    /// Returns a copy that also observes other transactions' pending writes.
    pub fn dirty(mut self) -> Self {
        self.dirty = true;
        self
    }
}

/// Handle returned by [`RecordStore::begin`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnStart {
    /// New transaction identifier.
    pub id: TxnId,
    /// Snapshot pinned at begin.
    pub snapshot: CommitId,
}

/// Failures reported by a store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The transaction was already committed or rolled back.
    #[error("transaction {txn} is not active in the store")]
    TxnNotActive {
        /// Transaction identifier.
        txn: TxnId,
    },
    /// Write against a record that is not visible to the writer.
    #[error("record {id} of '{record_type}' does not exist")]
    RecordMissing {
        /// Record type.
        record_type: String,
        /// Record identity.
        id: RecordId,
    },
    /// Another pending transaction already wrote the record.
    #[error("record {id} of '{record_type}' is being written by transaction {holder}")]
    WriteConflict {
        /// Record type.
        record_type: String,
        /// Record identity.
        id: RecordId,
        /// Transaction holding the pending write.
        holder: TxnId,
    },
    /// Uniqueness rule enforced by the store itself.
    #[error("store rejected duplicate {value} for '{constraint}' on '{record_type}'")]
    UniqueViolation {
        /// Record type.
        record_type: String,
        /// Constraint name.
        constraint: String,
        /// Constrained fields.
        fields: Vec<String>,
        /// Offending tuple.
        value: String,
    },
    /// Opaque backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Record-fetch and record-write primitives the engine consumes.
///
/// Implementations must be internally synchronized. Writes are always issued
/// inside a transaction obtained from [`RecordStore::begin`]; the engine
/// serializes writers, so a store only needs to reject conflicting pending
/// writes rather than schedule them.
pub trait RecordStore: Send + Sync + fmt::Debug {
    /// Opens a transaction and pins the current snapshot for it.
    fn begin(&self) -> StoreResult<TxnStart>;

    /// Newest committed snapshot.
    fn snapshot(&self) -> CommitId;

    /// Every record of `record_type` visible to `view`, in store order.
    fn scan(&self, record_type: &str, view: &ReadView) -> StoreResult<Vec<Record>>;

    /// One record by identity.
    fn get(&self, record_type: &str, id: RecordId, view: &ReadView) -> StoreResult<Option<Record>>;

    /// Inserts a new record as a pending write of `txn`.
    fn insert(&self, txn: TxnId, record_type: &str, fields: Fields) -> StoreResult<RecordId>;

    /// Replaces the field map of a record as a pending write of `txn`.
    fn update(&self, txn: TxnId, record_type: &str, id: RecordId, fields: Fields) -> StoreResult<()>;

    /// Deletes a record as a pending write of `txn`.
    fn delete(&self, txn: TxnId, record_type: &str, id: RecordId) -> StoreResult<()>;

    /// Publishes every pending write of `txn`.
    fn commit(&self, txn: TxnId) -> StoreResult<CommitId>;

    /// Discards every pending write of `txn`.
    fn rollback(&self, txn: TxnId) -> StoreResult<()>;

    /// Next value of an auto-increment sequence: one past the largest integer
    /// currently stored in `field`.
    fn next_sequence(&self, record_type: &str, field: &str, view: &ReadView) -> StoreResult<i64> {
        let max = self
            .scan(record_type, view)?
            .iter()
            .filter_map(|record| record.value(field).as_i64())
            .max()
            .unwrap_or(0);
        max.checked_add(1)
            .ok_or_else(|| StoreError::Backend(format!("sequence '{record_type}.{field}' overflowed")))
    }
}
