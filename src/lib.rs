//! Relcore: a typed query and mutation core for relational record stores.
//!
//! A [`SchemaRegistry`] collects record types, relations and unique
//! constraints and freezes them into a [`Schema`]. An [`Engine`] built over
//! that schema and a [`storage::RecordStore`] answers reads (filters,
//! ordering, cursors, projections with nested relations), aggregations and
//! validated writes, each inside a transaction with a chosen isolation level.
//!
//! ```no_run
//! use relcore::{Engine, FindArgs, Filter, QueryClient, RecordType, ScalarField, SchemaRegistry};
//!
//! # fn main() -> relcore::Result<()> {
//! let mut registry = SchemaRegistry::new();
//! registry.register_type(
//!     RecordType::new("Client")
//!         .id(ScalarField::string("id"))
//!         .field(ScalarField::string("name")),
//! )?;
//! let engine = Engine::in_memory(registry.finalize()?);
//! let rows = engine.find_many("Client", &FindArgs::new().filter(Filter::contains("name", "Acme")))?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Engine tunables and their TOML form.
pub mod config;
/// Engine handle, sessions, delegates and serialized operations.
pub mod engine;
/// Error taxonomy.
pub mod error;
/// Validated writes and referential actions.
pub mod mutation;
/// Filters, planning, execution and aggregation.
pub mod query;
/// Record types, relations and unique constraints.
pub mod schema;
/// Store abstraction and the in-memory MVCC store.
pub mod storage;
/// Transaction slots, isolation levels and timeouts.
pub mod txn;
/// Shared identifier types.
pub mod types;

/// JSON fixtures and request runners behind the `relcore` binary.
pub mod cli;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Delegate, Engine, Operation, OperationResult, QueryClient, Session, TxHandle, WriteSummary};
pub use error::{EngineError, Result, SchemaError};
pub use mutation::{FieldWrite, RelationWrite, UpsertBranch, Upserted, WriteData};
pub use query::{
    AggFunc, AggTarget, AggregateResult, AggregateRow, AggregateSpec, Cursor, FieldOp, Filter, FindArgs, Having,
    NullsOrder, OrderBy, PlanExplain, Projection, QueryMode, RelationPredicate, Row, SortOrder, UniqueWhere, Value,
};
pub use schema::{
    Cardinality, EnumDef, FieldDefault, RecordType, ReferentialAction, RelationSpec, ScalarField, ScalarKind, Schema,
    SchemaRegistry,
};
pub use storage::{MemoryStore, RecordStore};
pub use txn::{IsolationLevel, TransactionOptions};
pub use types::{RecordId, TxnId};
