//! The engine handle and its client surface.
//!
//! [`Engine`] owns the schema, the store, the planner and the transaction
//! manager. Every operation is expressed once, on [`Session`], and reached
//! through the [`QueryClient`] trait, which both the engine (one implicit
//! transaction per call) and [`TxHandle`] (the caller's interactive
//! transaction) implement. [`Delegate`] narrows a client to one record type.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::mutation::{Mutator, Upserted, WriteData};
use crate::query::aggregate::{AggregatePlan, AggregateResult, AggregateSpec, COUNT_ALL};
use crate::query::analyze::analyze_unique;
use crate::query::ast::{FindArgs, UniqueWhere};
use crate::query::executor::{Executor, Reader, Row};
use crate::query::filter::Filter;
use crate::query::planner::{PlanExplain, Planner};
use crate::schema::Schema;
use crate::storage::{MemoryStore, ReadView, Record, RecordStore};
use crate::txn::{IsolationLevel, TransactionManager, TransactionOptions, TxState, Transaction};
use crate::types::TxnId;

/// One request in serialized form, as submitted to [`Engine::run_batch`] or
/// read from a file by the CLI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    /// Every matching record.
    #[serde(rename_all = "camelCase")]
    FindMany {
        /// Queried type.
        record_type: String,
        /// Filter, window and projection.
        #[serde(default)]
        args: FindArgs,
    },
    /// First matching record.
    #[serde(rename_all = "camelCase")]
    FindFirst {
        /// Queried type.
        record_type: String,
        /// Filter, window and projection.
        #[serde(default)]
        args: FindArgs,
    },
    /// Record identified by a unique constraint.
    #[serde(rename_all = "camelCase")]
    FindUnique {
        /// Queried type.
        record_type: String,
        /// Unique lookup.
        #[serde(rename = "where")]
        target: UniqueWhere,
        /// Projection.
        #[serde(default)]
        args: FindArgs,
    },
    /// Number of matching records, optionally with per-field non-null counts.
    #[serde(rename_all = "camelCase")]
    Count {
        /// Queried type.
        record_type: String,
        /// Filter and window.
        #[serde(default)]
        args: FindArgs,
        /// Fields whose non-null values are counted.
        #[serde(default)]
        fields: Vec<String>,
    },
    /// Aggregation, grouped when `spec.by` is set.
    #[serde(rename_all = "camelCase")]
    Aggregate {
        /// Queried type.
        record_type: String,
        /// Aggregation request.
        spec: AggregateSpec,
    },
    /// Single insert.
    #[serde(rename_all = "camelCase")]
    Create {
        /// Written type.
        record_type: String,
        /// Payload.
        data: WriteData,
        /// Projection of the returned row.
        #[serde(default)]
        args: FindArgs,
    },
    /// Batch insert.
    #[serde(rename_all = "camelCase")]
    CreateMany {
        /// Written type.
        record_type: String,
        /// One payload per record.
        data: Vec<WriteData>,
        /// Drop rows that would violate a unique constraint.
        #[serde(default)]
        skip_duplicates: bool,
        /// Projection of returned rows; no rows are returned without it.
        #[serde(default)]
        returning: Option<FindArgs>,
    },
    /// Update by unique lookup.
    #[serde(rename_all = "camelCase")]
    Update {
        /// Written type.
        record_type: String,
        /// Unique lookup.
        #[serde(rename = "where")]
        target: UniqueWhere,
        /// Payload.
        data: WriteData,
        /// Projection of the returned row.
        #[serde(default)]
        args: FindArgs,
    },
    /// Update by filter.
    #[serde(rename_all = "camelCase")]
    UpdateMany {
        /// Written type.
        record_type: String,
        /// Record filter; all records when absent.
        #[serde(rename = "where", default)]
        filter: Option<Filter>,
        /// Scalar payload.
        data: WriteData,
        /// Affect only the first `limit` matches in store order.
        #[serde(default)]
        limit: Option<usize>,
        /// Projection of returned rows.
        #[serde(default)]
        returning: Option<FindArgs>,
    },
    /// Update by unique lookup, or insert.
    #[serde(rename_all = "camelCase")]
    Upsert {
        /// Written type.
        record_type: String,
        /// Unique lookup.
        #[serde(rename = "where")]
        target: UniqueWhere,
        /// Payload when nothing matches.
        create: WriteData,
        /// Payload when a record matches.
        update: WriteData,
        /// Projection of the returned row.
        #[serde(default)]
        args: FindArgs,
    },
    /// Delete by unique lookup.
    #[serde(rename_all = "camelCase")]
    Delete {
        /// Written type.
        record_type: String,
        /// Unique lookup.
        #[serde(rename = "where")]
        target: UniqueWhere,
        /// Projection of the returned row.
        #[serde(default)]
        args: FindArgs,
    },
    /// Delete by filter.
    #[serde(rename_all = "camelCase")]
    DeleteMany {
        /// Written type.
        record_type: String,
        /// Record filter; all records when absent.
        #[serde(rename = "where", default)]
        filter: Option<Filter>,
        /// Affect only the first `limit` matches in store order.
        #[serde(default)]
        limit: Option<usize>,
        /// Projection of returned rows.
        #[serde(default)]
        returning: Option<FindArgs>,
    },
}

impl Operation {
    /// Type the operation targets.
    pub fn record_type(&self) -> &str {
        match self {
            Operation::FindMany { record_type, .. }
            | Operation::FindFirst { record_type, .. }
            | Operation::FindUnique { record_type, .. }
            | Operation::Count { record_type, .. }
            | Operation::Aggregate { record_type, .. }
            | Operation::Create { record_type, .. }
            | Operation::CreateMany { record_type, .. }
            | Operation::Update { record_type, .. }
            | Operation::UpdateMany { record_type, .. }
            | Operation::Upsert { record_type, .. }
            | Operation::Delete { record_type, .. }
            | Operation::DeleteMany { record_type, .. } => record_type,
        }
    }

    /// Operation name in the wire form.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::FindMany { .. } => "findMany",
            Operation::FindFirst { .. } => "findFirst",
            Operation::FindUnique { .. } => "findUnique",
            Operation::Count { .. } => "count",
            Operation::Aggregate { .. } => "aggregate",
            Operation::Create { .. } => "create",
            Operation::CreateMany { .. } => "createMany",
            Operation::Update { .. } => "update",
            Operation::UpdateMany { .. } => "updateMany",
            Operation::Upsert { .. } => "upsert",
            Operation::Delete { .. } => "delete",
            Operation::DeleteMany { .. } => "deleteMany",
        }
    }

    /// Whether the operation writes.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Operation::FindMany { .. }
                | Operation::FindFirst { .. }
                | Operation::FindUnique { .. }
                | Operation::Count { .. }
                | Operation::Aggregate { .. }
        )
    }
}

/// Outcome of a batch write.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSummary {
    /// Records written.
    pub count: usize,
    /// Projected rows, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
}

/// Result of one [`Operation`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum OperationResult {
    /// `findMany`.
    Rows(Vec<Row>),
    /// `findFirst`, `findUnique`, `create`, `update`, `delete`.
    Row(Option<Row>),
    /// `count` without fields.
    Count(usize),
    /// `count` with fields: `_all` plus one entry per field.
    Counts(BTreeMap<String, i64>),
    /// `aggregate`.
    Aggregate(AggregateResult),
    /// `createMany`, `updateMany`, `deleteMany`.
    Written(WriteSummary),
    /// `upsert`.
    Upserted(Upserted),
}

/// Executes operations within one statement of one transaction.
///
/// Reads go through the transaction's isolation-dependent view; writes are
/// validated against the newest committed state plus the transaction's own
/// writes. A session is created per statement.
pub struct Session<'s> {
    schema: &'s Schema,
    store: &'s dyn RecordStore,
    planner: &'s Planner,
    txn: TxnId,
    read_view: ReadView,
    write_view: ReadView,
}

impl<'s> Session<'s> {
    fn new(inner: &'s EngineInner, txn: &Transaction<'_>) -> Self {
        Self {
            schema: &inner.schema,
            store: inner.store.as_ref(),
            planner: &inner.planner,
            txn: txn.id(),
            read_view: txn.read_view(),
            write_view: txn.write_view(),
        }
    }

    fn reader(&self) -> Reader<'s> {
        Reader::new(self.schema, self.store, self.read_view)
    }

    fn mutator(&self) -> Mutator<'s> {
        Mutator::new(self.schema, self.store, self.txn, self.write_view)
    }

    /// Runs one serialized operation.
    pub fn execute(&mut self, op: Operation) -> Result<OperationResult> {
        debug!(op = op.name(), record_type = op.record_type(), "engine.execute");
        Ok(match op {
            Operation::FindMany { record_type, args } => OperationResult::Rows(self.find_many(&record_type, &args)?),
            Operation::FindFirst { record_type, args } => OperationResult::Row(self.find_first(&record_type, &args)?),
            Operation::FindUnique {
                record_type,
                target,
                args,
            } => OperationResult::Row(self.find_unique(&record_type, &target, &args)?),
            Operation::Count {
                record_type,
                args,
                fields,
            } if fields.is_empty() => OperationResult::Count(self.count(&record_type, &args)?),
            Operation::Count {
                record_type,
                args,
                fields,
            } => OperationResult::Counts(self.count_fields(&record_type, &args, &fields)?),
            Operation::Aggregate { record_type, spec } => OperationResult::Aggregate(self.aggregate(&record_type, &spec)?),
            Operation::Create {
                record_type,
                data,
                args,
            } => OperationResult::Row(Some(self.create(&record_type, &data, &args)?)),
            Operation::CreateMany {
                record_type,
                data,
                skip_duplicates,
                returning,
            } => OperationResult::Written(self.create_many(&record_type, &data, skip_duplicates, returning.as_ref())?),
            Operation::Update {
                record_type,
                target,
                data,
                args,
            } => OperationResult::Row(Some(self.update(&record_type, &target, &data, &args)?)),
            Operation::UpdateMany {
                record_type,
                filter,
                data,
                limit,
                returning,
            } => OperationResult::Written(self.update_many(
                &record_type,
                filter.as_ref(),
                &data,
                limit,
                returning.as_ref(),
            )?),
            Operation::Upsert {
                record_type,
                target,
                create,
                update,
                args,
            } => OperationResult::Upserted(self.upsert(&record_type, &target, &create, &update, &args)?),
            Operation::Delete {
                record_type,
                target,
                args,
            } => OperationResult::Row(Some(self.delete(&record_type, &target, &args)?)),
            Operation::DeleteMany {
                record_type,
                filter,
                limit,
                returning,
            } => OperationResult::Written(self.delete_many(&record_type, filter.as_ref(), limit, returning.as_ref())?),
        })
    }

    /// Plans `args` against `record_type` without running it.
    pub fn explain(&self, record_type: &str, args: &FindArgs) -> Result<PlanExplain> {
        Ok(self.planner.plan(record_type, args)?.explain)
    }

    /// Every matching record, projected.
    pub fn find_many(&self, record_type: &str, args: &FindArgs) -> Result<Vec<Row>> {
        let plan = self.planner.plan(record_type, args)?;
        let mut reader = self.reader();
        Executor::new(&mut reader, &plan).run()
    }

    /// First matching record. A negative `take` picks the last one.
    pub fn find_first(&self, record_type: &str, args: &FindArgs) -> Result<Option<Row>> {
        let mut args = args.clone();
        args.take = Some(if args.take.is_some_and(|t| t < 0) { -1 } else { 1 });
        Ok(self.find_many(record_type, &args)?.into_iter().next())
    }

    /// Record identified by a unique constraint. Only the projection of
    /// `args` is used.
    pub fn find_unique(&self, record_type: &str, target: &UniqueWhere, args: &FindArgs) -> Result<Option<Row>> {
        let ty = self.schema.record_type(record_type)?;
        let key = analyze_unique(self.schema, ty, &target.0, "where")?;
        let filter = Filter::and(key.into_iter().map(|(field, value)| Filter::equals(field, value)));
        let args = FindArgs {
            filter: Some(filter),
            projection: args.projection.clone(),
            ..FindArgs::default()
        };
        Ok(self.find_many(record_type, &args)?.into_iter().next())
    }

    /// Number of matching records after window arguments.
    pub fn count(&self, record_type: &str, args: &FindArgs) -> Result<usize> {
        Ok(self.window(record_type, args)?.len())
    }

    /// `_all` plus the number of non-null values of each field.
    pub fn count_fields(&self, record_type: &str, args: &FindArgs, fields: &[String]) -> Result<BTreeMap<String, i64>> {
        let ty = self.schema.record_type(record_type)?;
        for field in fields {
            ty.require_scalar(field, "count")?;
        }
        let records = self.window(record_type, args)?;
        let mut counts = BTreeMap::new();
        counts.insert(COUNT_ALL.to_owned(), records.len() as i64);
        for field in fields {
            let present = records.iter().filter(|r| !r.value(field).is_null()).count();
            counts.insert(field.clone(), present as i64);
        }
        Ok(counts)
    }

    fn window(&self, record_type: &str, args: &FindArgs) -> Result<Vec<Record>> {
        let args = FindArgs {
            projection: Default::default(),
            ..args.clone()
        };
        let plan = self.planner.plan(record_type, &args)?;
        let mut reader = self.reader();
        Executor::new(&mut reader, &plan).root_records()
    }

    /// Aggregation, grouped when `spec.by` is set.
    pub fn aggregate(&self, record_type: &str, spec: &AggregateSpec) -> Result<AggregateResult> {
        let ty = self.schema.record_type(record_type)?;
        let plan = AggregatePlan::new(self.schema, ty, spec)?;
        let mut reader = self.reader();
        plan.execute(&mut reader)
    }

    /// Inserts one record and returns it projected.
    pub fn create(&self, record_type: &str, data: &WriteData, args: &FindArgs) -> Result<Row> {
        let record = self.mutator().create(record_type, data)?;
        self.project_one(record_type, record, args)
    }

    /// Inserts a batch.
    pub fn create_many(
        &self,
        record_type: &str,
        data: &[WriteData],
        skip_duplicates: bool,
        returning: Option<&FindArgs>,
    ) -> Result<WriteSummary> {
        let records = self.mutator().create_many(record_type, data, skip_duplicates)?;
        self.summarize(record_type, records, returning)
    }

    /// Updates the record found by `target`.
    pub fn update(&self, record_type: &str, target: &UniqueWhere, data: &WriteData, args: &FindArgs) -> Result<Row> {
        let record = self.mutator().update(record_type, target, data)?;
        self.project_one(record_type, record, args)
    }

    /// Updates every matching record (at most `limit`).
    pub fn update_many(
        &self,
        record_type: &str,
        filter: Option<&Filter>,
        data: &WriteData,
        limit: Option<usize>,
        returning: Option<&FindArgs>,
    ) -> Result<WriteSummary> {
        let records = self.mutator().update_many(record_type, filter, data, limit)?;
        self.summarize(record_type, records, returning)
    }

    /// Updates or inserts atomically.
    pub fn upsert(
        &self,
        record_type: &str,
        target: &UniqueWhere,
        create: &WriteData,
        update: &WriteData,
        args: &FindArgs,
    ) -> Result<Upserted> {
        let (record, branch) = self.mutator().upsert(record_type, target, create, update)?;
        let row = self.project_one(record_type, record, args)?;
        Ok(Upserted { row, branch })
    }

    /// Deletes the record found by `target` and returns it as it was.
    pub fn delete(&self, record_type: &str, target: &UniqueWhere, args: &FindArgs) -> Result<Row> {
        let (_, row) = self.mutator().delete_returning(record_type, target, |record| {
            self.project_one(record_type, record.clone(), args)
        })?;
        Ok(row)
    }

    /// Deletes every matching record (at most `limit`). Returned rows are
    /// projected before the delete.
    pub fn delete_many(
        &self,
        record_type: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
        returning: Option<&FindArgs>,
    ) -> Result<WriteSummary> {
        let (deleted, rows) = self
            .mutator()
            .delete_many_returning(record_type, filter, limit, |records| {
                returning
                    .map(|args| self.project(record_type, records.to_vec(), args))
                    .transpose()
            })?;
        Ok(WriteSummary {
            count: deleted.len(),
            rows,
        })
    }

    fn summarize(&self, record_type: &str, records: Vec<Record>, returning: Option<&FindArgs>) -> Result<WriteSummary> {
        let count = records.len();
        let rows = returning
            .map(|args| self.project(record_type, records, args))
            .transpose()?;
        Ok(WriteSummary { count, rows })
    }

    fn project_one(&self, record_type: &str, record: Record, args: &FindArgs) -> Result<Row> {
        self.project(record_type, vec![record], args)?
            .pop()
            .ok_or_else(|| EngineError::RecordNotFound {
                record_type: record_type.to_owned(),
                operation: "projection",
            })
    }

    /// Projects written records through the projection of `args`, loading
    /// relations as the transaction now sees them.
    fn project(&self, record_type: &str, records: Vec<Record>, args: &FindArgs) -> Result<Vec<Row>> {
        let args = FindArgs {
            projection: args.projection.clone(),
            ..FindArgs::default()
        };
        let plan = self.planner.plan(record_type, &args)?;
        let mut reader = Reader::new(self.schema, self.store, self.write_view);
        Executor::new(&mut reader, &plan).materialize(records)
    }
}

/// The six contracts, reachable from the engine or from inside a transaction.
///
/// Implementors only supply [`QueryClient::with_session`]; every operation is
/// a provided method on top of it.
pub trait QueryClient {
    /// Runs `f` in a statement of this client's transaction context. `write`
    /// asks for the writer lock first.
    fn with_session<T>(&self, write: bool, f: impl FnOnce(&mut Session<'_>) -> Result<T>) -> Result<T>;

    /// Runs one serialized operation.
    fn execute(&self, op: Operation) -> Result<OperationResult> {
        let write = op.is_write();
        self.with_session(write, |s| s.execute(op))
    }

    /// Plan of a read, without running it.
    fn explain(&self, record_type: &str, args: &FindArgs) -> Result<PlanExplain> {
        self.with_session(false, |s| s.explain(record_type, args))
    }

    /// Every matching record.
    fn find_many(&self, record_type: &str, args: &FindArgs) -> Result<Vec<Row>> {
        self.with_session(false, |s| s.find_many(record_type, args))
    }

    /// First matching record.
    fn find_first(&self, record_type: &str, args: &FindArgs) -> Result<Option<Row>> {
        self.with_session(false, |s| s.find_first(record_type, args))
    }

    /// First matching record or `RecordNotFound`.
    fn find_first_or_throw(&self, record_type: &str, args: &FindArgs) -> Result<Row> {
        self.find_first(record_type, args)?
            .ok_or_else(|| EngineError::RecordNotFound {
                record_type: record_type.to_owned(),
                operation: "findFirstOrThrow",
            })
    }

    /// Record identified by a unique constraint.
    fn find_unique(&self, record_type: &str, target: &UniqueWhere, args: &FindArgs) -> Result<Option<Row>> {
        self.with_session(false, |s| s.find_unique(record_type, target, args))
    }

    /// Record identified by a unique constraint or `RecordNotFound`.
    fn find_unique_or_throw(&self, record_type: &str, target: &UniqueWhere, args: &FindArgs) -> Result<Row> {
        self.find_unique(record_type, target, args)?
            .ok_or_else(|| EngineError::RecordNotFound {
                record_type: record_type.to_owned(),
                operation: "findUniqueOrThrow",
            })
    }

    /// Number of matching records.
    fn count(&self, record_type: &str, args: &FindArgs) -> Result<usize> {
        self.with_session(false, |s| s.count(record_type, args))
    }

    /// `_all` plus per-field non-null counts.
    fn count_fields(&self, record_type: &str, args: &FindArgs, fields: &[String]) -> Result<BTreeMap<String, i64>> {
        self.with_session(false, |s| s.count_fields(record_type, args, fields))
    }

    /// Aggregation over the matching records.
    fn aggregate(&self, record_type: &str, spec: &AggregateSpec) -> Result<AggregateResult> {
        self.with_session(false, |s| s.aggregate(record_type, spec))
    }

    /// Grouped aggregation; `spec.by` must name at least one field.
    fn group_by(&self, record_type: &str, spec: &AggregateSpec) -> Result<AggregateResult> {
        if spec.by.is_empty() {
            return Err(EngineError::InvalidAggregate {
                record_type: record_type.to_owned(),
                reason: "groupBy needs at least one field in `by`".into(),
            });
        }
        self.aggregate(record_type, spec)
    }

    /// Inserts one record.
    fn create(&self, record_type: &str, data: &WriteData, args: &FindArgs) -> Result<Row> {
        self.with_session(true, |s| s.create(record_type, data, args))
    }

    /// Inserts a batch and returns how many records were written.
    fn create_many(&self, record_type: &str, data: &[WriteData], skip_duplicates: bool) -> Result<usize> {
        self.with_session(true, |s| s.create_many(record_type, data, skip_duplicates, None))
            .map(|summary| summary.count)
    }

    /// Inserts a batch and returns the written rows.
    fn create_many_and_return(
        &self,
        record_type: &str,
        data: &[WriteData],
        skip_duplicates: bool,
        args: &FindArgs,
    ) -> Result<Vec<Row>> {
        self.with_session(true, |s| s.create_many(record_type, data, skip_duplicates, Some(args)))
            .map(|summary| summary.rows.unwrap_or_default())
    }

    /// Updates the record found by `target`.
    fn update(&self, record_type: &str, target: &UniqueWhere, data: &WriteData, args: &FindArgs) -> Result<Row> {
        self.with_session(true, |s| s.update(record_type, target, data, args))
    }

    /// Updates matching records and returns how many were written.
    fn update_many(&self, record_type: &str, filter: Option<&Filter>, data: &WriteData, limit: Option<usize>) -> Result<usize> {
        self.with_session(true, |s| s.update_many(record_type, filter, data, limit, None))
            .map(|summary| summary.count)
    }

    /// Updates matching records and returns them.
    fn update_many_and_return(
        &self,
        record_type: &str,
        filter: Option<&Filter>,
        data: &WriteData,
        limit: Option<usize>,
        args: &FindArgs,
    ) -> Result<Vec<Row>> {
        self.with_session(true, |s| s.update_many(record_type, filter, data, limit, Some(args)))
            .map(|summary| summary.rows.unwrap_or_default())
    }

    /// Updates the record found by `target`, or inserts `create`.
    fn upsert(
        &self,
        record_type: &str,
        target: &UniqueWhere,
        create: &WriteData,
        update: &WriteData,
        args: &FindArgs,
    ) -> Result<Upserted> {
        self.with_session(true, |s| s.upsert(record_type, target, create, update, args))
    }

    /// Deletes the record found by `target` and returns it.
    fn delete(&self, record_type: &str, target: &UniqueWhere, args: &FindArgs) -> Result<Row> {
        self.with_session(true, |s| s.delete(record_type, target, args))
    }

    /// Deletes matching records and returns how many were removed.
    fn delete_many(&self, record_type: &str, filter: Option<&Filter>, limit: Option<usize>) -> Result<usize> {
        self.with_session(true, |s| s.delete_many(record_type, filter, limit, None))
            .map(|summary| summary.count)
    }
}

#[derive(Debug)]
struct EngineInner {
    schema: Arc<Schema>,
    store: Arc<dyn RecordStore>,
    planner: Planner,
    txns: TransactionManager,
    config: EngineConfig,
}

/// Shared, thread-safe engine handle. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Builds an engine over `store`.
    pub fn new(schema: Arc<Schema>, store: Arc<dyn RecordStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(schema, store, config))
    }

    /// Engine over an empty [`MemoryStore`] with default configuration.
    pub fn in_memory(schema: Arc<Schema>) -> Self {
        Self::assemble(schema, Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    fn assemble(schema: Arc<Schema>, store: Arc<dyn RecordStore>, config: EngineConfig) -> Self {
        let planner = Planner::new(Arc::clone(&schema), config.planner.clone());
        let txns = TransactionManager::new(Arc::clone(&store), &config);
        debug!(
            types = schema.record_types().count(),
            isolation = ?config.default_isolation,
            max_open = config.max_open_transactions,
            "engine.new"
        );
        Self {
            inner: Arc::new(EngineInner {
                schema,
                store,
                planner,
                txns,
                config,
            }),
        }
    }

    /// The finalized schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Transactions currently open, implicit ones included.
    pub fn open_transactions(&self) -> usize {
        self.inner.txns.open_transactions()
    }

    /// Client narrowed to one record type.
    pub fn delegate(&self, record_type: &str) -> Result<Delegate<'_, Engine>> {
        Delegate::new(self, record_type)
    }

    /// Runs `f` inside one transaction. Commits when `f` returns `Ok`, rolls
    /// back when it returns `Err` or when the transaction outlives its
    /// timeout (checked at every call through the handle and before commit).
    pub fn run_interactive<T, F>(&self, options: TransactionOptions, f: F) -> Result<T>
    where
        F: FnOnce(&TxHandle<'_>) -> Result<T>,
    {
        let inner = self.inner.as_ref();
        let handle = TxHandle {
            inner,
            txn: RefCell::new(inner.txns.begin(&options)?),
        };
        let result = f(&handle);
        let txn = handle.txn.into_inner();
        match result {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                finish_failed(txn, &err);
                Err(err)
            }
        }
    }

    /// Runs `operations` in order inside one transaction. The first failure
    /// rolls everything back and is returned.
    pub fn run_batch(&self, operations: Vec<Operation>, options: TransactionOptions) -> Result<Vec<OperationResult>> {
        debug!(operations = operations.len(), "txn.batch");
        self.run_interactive(options, |tx| {
            operations
                .into_iter()
                .map(|op| tx.execute(op))
                .collect()
        })
    }
}

impl QueryClient for Engine {
    fn with_session<T>(&self, write: bool, f: impl FnOnce(&mut Session<'_>) -> Result<T>) -> Result<T> {
        let inner = self.inner.as_ref();
        let mut txn = inner.txns.begin(&TransactionOptions::default())?;
        if write {
            txn.acquire_writer()?;
        }
        let result = {
            let mut session = Session::new(inner, &txn);
            f(&mut session)
        };
        match result {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                finish_failed(txn, &err);
                Err(err)
            }
        }
    }
}

fn finish_failed(txn: Transaction<'_>, err: &EngineError) {
    if txn.state() != TxState::Active {
        return;
    }
    let id = txn.id();
    warn!(txn = id.0, code = err.code(), "txn.rollback_on_error");
    if let Err(rollback) = txn.rollback() {
        warn!(txn = id.0, error = %rollback, "txn.rollback_failed");
    }
}

/// Scoped handle passed to [`Engine::run_interactive`] callbacks. It offers
/// the full [`QueryClient`] surface inside the transaction but cannot open a
/// nested one.
pub struct TxHandle<'e> {
    inner: &'e EngineInner,
    txn: RefCell<Transaction<'e>>,
}

impl<'e> TxHandle<'e> {
    /// Store transaction identifier.
    pub fn id(&self) -> TxnId {
        self.txn.borrow().id()
    }

    /// Isolation level in effect.
    pub fn isolation(&self) -> IsolationLevel {
        self.txn.borrow().isolation()
    }

    /// Client narrowed to one record type, inside this transaction.
    pub fn delegate(&self, record_type: &str) -> Result<Delegate<'_, TxHandle<'e>>> {
        Delegate::new(self, record_type)
    }
}

impl QueryClient for TxHandle<'_> {
    fn with_session<T>(&self, write: bool, f: impl FnOnce(&mut Session<'_>) -> Result<T>) -> Result<T> {
        let mut txn = self
            .txn
            .try_borrow_mut()
            .map_err(|_| EngineError::InvalidArgument("transaction handle is already executing a statement".into()))?;
        txn.check()?;
        if write {
            txn.acquire_writer()?;
        }
        let mut session = Session::new(self.inner, &txn);
        f(&mut session)
    }
}

/// A client narrowed to one record type.
#[derive(Debug)]
pub struct Delegate<'c, C: QueryClient> {
    client: &'c C,
    record_type: String,
}

impl<'c, C: QueryClient> Delegate<'c, C> {
    /// Checks that `record_type` exists and binds it.
    pub fn new(client: &'c C, record_type: &str) -> Result<Self>
    where
        C: SchemaSource,
    {
        client.schema_ref().record_type(record_type)?;
        Ok(Self {
            client,
            record_type: record_type.to_owned(),
        })
    }

    /// Bound record type.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// See [`QueryClient::find_many`].
    pub fn find_many(&self, args: &FindArgs) -> Result<Vec<Row>> {
        self.client.find_many(&self.record_type, args)
    }

    /// See [`QueryClient::find_first`].
    pub fn find_first(&self, args: &FindArgs) -> Result<Option<Row>> {
        self.client.find_first(&self.record_type, args)
    }

    /// See [`QueryClient::find_first_or_throw`].
    pub fn find_first_or_throw(&self, args: &FindArgs) -> Result<Row> {
        self.client.find_first_or_throw(&self.record_type, args)
    }

    /// See [`QueryClient::find_unique`].
    pub fn find_unique(&self, target: &UniqueWhere, args: &FindArgs) -> Result<Option<Row>> {
        self.client.find_unique(&self.record_type, target, args)
    }

    /// See [`QueryClient::find_unique_or_throw`].
    pub fn find_unique_or_throw(&self, target: &UniqueWhere, args: &FindArgs) -> Result<Row> {
        self.client.find_unique_or_throw(&self.record_type, target, args)
    }

    /// See [`QueryClient::count`].
    pub fn count(&self, args: &FindArgs) -> Result<usize> {
        self.client.count(&self.record_type, args)
    }

    /// See [`QueryClient::aggregate`].
    pub fn aggregate(&self, spec: &AggregateSpec) -> Result<AggregateResult> {
        self.client.aggregate(&self.record_type, spec)
    }

    /// See [`QueryClient::group_by`].
    pub fn group_by(&self, spec: &AggregateSpec) -> Result<AggregateResult> {
        self.client.group_by(&self.record_type, spec)
    }

    /// See [`QueryClient::create`].
    pub fn create(&self, data: &WriteData, args: &FindArgs) -> Result<Row> {
        self.client.create(&self.record_type, data, args)
    }

    /// See [`QueryClient::create_many`].
    pub fn create_many(&self, data: &[WriteData], skip_duplicates: bool) -> Result<usize> {
        self.client.create_many(&self.record_type, data, skip_duplicates)
    }

    /// See [`QueryClient::update`].
    pub fn update(&self, target: &UniqueWhere, data: &WriteData, args: &FindArgs) -> Result<Row> {
        self.client.update(&self.record_type, target, data, args)
    }

    /// See [`QueryClient::update_many`].
    pub fn update_many(&self, filter: Option<&Filter>, data: &WriteData, limit: Option<usize>) -> Result<usize> {
        self.client.update_many(&self.record_type, filter, data, limit)
    }

    /// See [`QueryClient::upsert`].
    pub fn upsert(&self, target: &UniqueWhere, create: &WriteData, update: &WriteData, args: &FindArgs) -> Result<Upserted> {
        self.client.upsert(&self.record_type, target, create, update, args)
    }

    /// See [`QueryClient::delete`].
    pub fn delete(&self, target: &UniqueWhere, args: &FindArgs) -> Result<Row> {
        self.client.delete(&self.record_type, target, args)
    }

    /// See [`QueryClient::delete_many`].
    pub fn delete_many(&self, filter: Option<&Filter>, limit: Option<usize>) -> Result<usize> {
        self.client.delete_many(&self.record_type, filter, limit)
    }
}

/// Clients that can name their schema, so delegates can check type names.
pub trait SchemaSource {
    /// Finalized schema.
    fn schema_ref(&self) -> &Schema;
}

impl SchemaSource for Engine {
    fn schema_ref(&self) -> &Schema {
        &self.inner.schema
    }
}

impl SchemaSource for TxHandle<'_> {
    fn schema_ref(&self) -> &Schema {
        &self.inner.schema
    }
}
