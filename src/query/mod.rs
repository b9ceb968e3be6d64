#![forbid(unsafe_code)]

//! Read-side query engine.
//!
//! Requests flow through the submodules in order: [`ast`] and [`filter`]
//! describe what the caller wants, [`analyze`] checks it against the schema,
//! [`planner`] lays it out as an arena of query nodes, and [`executor`] or
//! [`aggregate`] run it against a store view with [`eval`] deciding which
//! records match.

/// Aggregation and group-by.
pub mod aggregate;

/// Schema checks and literal coercion for filters.
pub mod analyze;

/// Ordering, pagination and projection arguments.
pub mod ast;

/// Two-valued filter evaluation.
pub mod eval;

/// Plan execution and relation loading.
///
/// Resolves included relations under a fan-out budget.
pub mod executor;

/// Filter expression trees.
pub mod filter;

/// Read planning, cycle detection and explain output.
pub mod planner;

/// Scalar values shared by filters, writes and rows.
pub mod value;

pub use aggregate::{AggFunc, AggTarget, AggregateResult, AggregateRow, AggregateSpec, Having};
pub use ast::{Cursor, FindArgs, NullsOrder, OrderBy, Projection, SortOrder, UniqueWhere};
pub use executor::Row;
pub use filter::{FieldOp, Filter, QueryMode, RelationPredicate};
pub use planner::{ExecutionPlan, PlanExplain, PlannerConfig, TraversalStrategy};
pub use value::Value;
