#![forbid(unsafe_code)]

//! Mutation coordinator.
//!
//! Every write moves through `PENDING -> VALIDATING -> APPLIED | REJECTED`.
//! Validation resolves defaults, type-checks values, rewires relations and
//! checks foreign keys, one-to-one cardinality and unique constraints against
//! the latest committed state plus the transaction's own writes. Nothing is
//! written to the store until every record touched by the statement has
//! passed validation.

/// Write payload types.
pub mod writes;

use std::time::Instant;

use rand::Rng;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::query::analyze::{analyze_filter, analyze_unique};
use crate::query::ast::UniqueWhere;
use crate::query::executor::Reader;
use crate::query::filter::Filter;
use crate::query::value::{format_tuple, Value, ValueKey};
use crate::schema::{Cardinality, FieldDefault, RecordType, ReferentialAction, RelationField, RelationLink, ScalarField, Schema};
use crate::storage::{Fields, ReadView, Record, RecordStore};
use crate::types::{RecordId, TxnId};

pub use writes::{FieldWrite, RelationWrite, UpsertBranch, Upserted, WriteData};

/// Lifecycle stage of one mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationPhase {
    /// Accepted, not yet inspected.
    Pending,
    /// Defaults, types and constraints being checked.
    Validating,
    /// Written to the store.
    Applied,
    /// Refused; nothing was written.
    Rejected,
}

/// Which write operation is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    /// Single insert.
    Create,
    /// Batch insert.
    CreateMany,
    /// Update by unique lookup.
    Update,
    /// Update by filter.
    UpdateMany,
    /// Update or insert.
    Upsert,
    /// Delete by unique lookup.
    Delete,
    /// Delete by filter.
    DeleteMany,
}

impl MutationKind {
    /// Operation name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::CreateMany => "createMany",
            MutationKind::Update => "update",
            MutationKind::UpdateMany => "updateMany",
            MutationKind::Upsert => "upsert",
            MutationKind::Delete => "delete",
            MutationKind::DeleteMany => "deleteMany",
        }
    }
}

struct Tracker<'t> {
    kind: MutationKind,
    record_type: &'t str,
    phase: MutationPhase,
    started: Instant,
}

impl<'t> Tracker<'t> {
    fn start(kind: MutationKind, record_type: &'t str) -> Self {
        trace!(kind = kind.name(), record_type, "mutation.pending");
        Self {
            kind,
            record_type,
            phase: MutationPhase::Pending,
            started: Instant::now(),
        }
    }

    fn validating(&mut self) {
        self.phase = MutationPhase::Validating;
        trace!(kind = self.kind.name(), record_type = self.record_type, "mutation.validating");
    }

    fn finish<T>(mut self, result: Result<T>, written: impl FnOnce(&T) -> usize) -> Result<T> {
        match &result {
            Ok(value) => {
                self.phase = MutationPhase::Applied;
                debug!(
                    kind = self.kind.name(),
                    record_type = self.record_type,
                    records = written(value),
                    elapsed_us = self.started.elapsed().as_micros() as u64,
                    "mutation.applied"
                );
            }
            Err(err) => {
                self.phase = MutationPhase::Rejected;
                debug!(
                    kind = self.kind.name(),
                    record_type = self.record_type,
                    code = err.code(),
                    error = %err,
                    "mutation.rejected"
                );
            }
        }
        debug_assert!(matches!(self.phase, MutationPhase::Applied | MutationPhase::Rejected));
        result
    }
}

/// Candidate state of one record within a statement. `id` is `None` for a
/// record the statement inserts.
#[derive(Clone, Debug)]
struct Staged {
    record_type: String,
    id: Option<RecordId>,
    fields: Fields,
}

impl Staged {
    fn key(&self, fields: &[String]) -> Option<SmallVec<[ValueKey; 2]>> {
        let mut key = SmallVec::new();
        for field in fields {
            let value = self.fields.get(field).unwrap_or(&Value::Null);
            if value.is_null() {
                return None;
            }
            key.push(value.key());
        }
        Some(key)
    }

    fn tuple(&self, fields: &[String]) -> Vec<Value> {
        fields
            .iter()
            .map(|f| self.fields.get(f).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn supersedes(&self, record_type: &str, id: RecordId) -> bool {
        self.id == Some(id) && self.record_type == record_type
    }
}

/// One validated record write plus the neighbouring records it rewires.
#[derive(Debug)]
struct Prepared {
    main: Staged,
    side: Vec<Staged>,
}

impl Prepared {
    fn all(&self) -> impl Iterator<Item = &Staged> {
        std::iter::once(&self.main).chain(self.side.iter())
    }
}

#[derive(Default)]
struct DeletePlan {
    seen: FxHashSet<(String, RecordId)>,
    deletes: Vec<(String, Record)>,
    nulls: Vec<(String, RecordId, Vec<String>)>,
}

/// Applies writes for one transaction.
///
/// All reads made while validating go through a [`Reader`] over the latest
/// committed snapshot plus the transaction's own pending writes; callers are
/// expected to hold the engine's writer lock.
pub struct Mutator<'a> {
    schema: &'a Schema,
    store: &'a dyn RecordStore,
    txn: TxnId,
    reader: Reader<'a>,
}

impl<'a> Mutator<'a> {
    /// Creates a mutator writing as `txn` and validating through `view`.
    pub fn new(schema: &'a Schema, store: &'a dyn RecordStore, txn: TxnId, view: ReadView) -> Self {
        Self {
            schema,
            store,
            txn,
            reader: Reader::new(schema, store, view),
        }
    }

    /// Reader over the write view, refreshed after every applied statement.
    pub fn reader(&mut self) -> &mut Reader<'a> {
        &mut self.reader
    }

    /// Record found by a unique lookup, if any.
    pub fn find_unique(&mut self, record_type: &RecordType, target: &UniqueWhere) -> Result<Option<Record>> {
        let key = analyze_unique(self.schema, record_type, &target.0, "where")?;
        let (fields, values): (Vec<String>, Vec<Value>) = key.into_iter().unzip();
        Ok(self.reader.lookup(&record_type.name, &fields, &values)?.into_iter().next())
    }

    /// Records matching `filter`, in store order, capped at `limit`.
    pub fn targets(&mut self, record_type: &RecordType, filter: Option<&Filter>, limit: Option<usize>) -> Result<Vec<Record>> {
        let analyzed = filter
            .map(|f| analyze_filter(self.schema, record_type, f))
            .transpose()?;
        let mut records = self.reader.matching(record_type, analyzed.as_ref())?;
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Inserts one record.
    pub fn create(&mut self, record_type: &str, data: &WriteData) -> Result<Record> {
        let mut tracker = Tracker::start(MutationKind::Create, record_type);
        tracker.validating();
        let result = self.create_inner(record_type, data);
        tracker.finish(result, |_| 1)
    }

    fn create_inner(&mut self, record_type: &str, data: &WriteData) -> Result<Record> {
        let schema = self.schema;
        let ty = schema.record_type(record_type)?;
        let prepared = self.prepare_create(ty, data, &[])?;
        self.check_uniques(&[], &prepared)?;
        let mut written = self.apply(vec![prepared])?;
        written
            .pop()
            .ok_or_else(|| EngineError::InvalidArgument("create produced no record".into()))
    }

    /// Inserts a batch. With `skip_duplicates`, rows that would violate a
    /// unique constraint (against the store or earlier rows of the batch)
    /// are dropped instead of failing the batch. Returns the inserted records.
    pub fn create_many(&mut self, record_type: &str, rows: &[WriteData], skip_duplicates: bool) -> Result<Vec<Record>> {
        let mut tracker = Tracker::start(MutationKind::CreateMany, record_type);
        tracker.validating();
        let result = self.create_many_inner(record_type, rows, skip_duplicates);
        tracker.finish(result, Vec::len)
    }

    fn create_many_inner(&mut self, record_type: &str, rows: &[WriteData], skip_duplicates: bool) -> Result<Vec<Record>> {
        let schema = self.schema;
        let ty = schema.record_type(record_type)?;
        let mut accepted: Vec<Prepared> = Vec::with_capacity(rows.len());
        let mut overlay: Vec<Staged> = Vec::new();
        for (index, data) in rows.iter().enumerate() {
            let prepared = match self.prepare_create(ty, data, &overlay) {
                Ok(prepared) => prepared,
                Err(err) => match claimed_unique(ty, &err) {
                    Some(constraint) if skip_duplicates => {
                        debug!(record_type, row = index, constraint, "mutation.skip_duplicate");
                        continue;
                    }
                    _ => return Err(err),
                },
            };
            match self.check_uniques(&overlay, &prepared) {
                Ok(()) => {}
                Err(EngineError::UniqueConstraintViolation { constraint, .. }) if skip_duplicates => {
                    debug!(record_type, row = index, constraint = %constraint, "mutation.skip_duplicate");
                    continue;
                }
                Err(err) => return Err(err),
            }
            overlay.extend(prepared.all().cloned());
            accepted.push(prepared);
        }
        self.apply(accepted)
    }

    /// Updates the record found by `target`.
    pub fn update(&mut self, record_type: &str, target: &UniqueWhere, data: &WriteData) -> Result<Record> {
        let mut tracker = Tracker::start(MutationKind::Update, record_type);
        tracker.validating();
        let result = self.update_inner(record_type, target, data, "update");
        tracker.finish(result, |_| 1)
    }

    fn update_inner(
        &mut self,
        record_type: &str,
        target: &UniqueWhere,
        data: &WriteData,
        operation: &'static str,
    ) -> Result<Record> {
        let schema = self.schema;
        let ty = schema.record_type(record_type)?;
        let current = self
            .find_unique(ty, target)?
            .ok_or_else(|| EngineError::RecordNotFound {
                record_type: record_type.to_owned(),
                operation,
            })?;
        let prepared = self.prepare_update(ty, current, data, &[])?;
        self.check_uniques(&[], &prepared)?;
        let mut written = self.apply(vec![prepared])?;
        written
            .pop()
            .ok_or_else(|| EngineError::InvalidArgument("update produced no record".into()))
    }

    /// Updates every record matching `filter` (the first `limit` in store
    /// order when given). Only scalar writes are accepted. Returns the
    /// updated records.
    pub fn update_many(
        &mut self,
        record_type: &str,
        filter: Option<&Filter>,
        data: &WriteData,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let mut tracker = Tracker::start(MutationKind::UpdateMany, record_type);
        tracker.validating();
        let result = self.update_many_inner(record_type, filter, data, limit);
        tracker.finish(result, Vec::len)
    }

    fn update_many_inner(
        &mut self,
        record_type: &str,
        filter: Option<&Filter>,
        data: &WriteData,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        if !data.relations.is_empty() {
            return Err(EngineError::InvalidArgument(
                "updateMany accepts scalar field writes only".into(),
            ));
        }
        let schema = self.schema;
        let ty = schema.record_type(record_type)?;
        let records = self.targets(ty, filter, limit)?;
        let mut batch: Vec<Prepared> = Vec::with_capacity(records.len());
        let mut overlay: Vec<Staged> = Vec::new();
        for record in records {
            let prepared = self.prepare_update(ty, record, data, &overlay)?;
            self.check_uniques(&overlay, &prepared)?;
            overlay.extend(prepared.all().cloned());
            batch.push(prepared);
        }
        self.apply(batch)
    }

    /// Updates the record found by `target`, or inserts `create` when none
    /// matches. Runs inside the caller's transaction, so the lookup and the
    /// write are atomic.
    pub fn upsert(
        &mut self,
        record_type: &str,
        target: &UniqueWhere,
        create: &WriteData,
        update: &WriteData,
    ) -> Result<(Record, UpsertBranch)> {
        let mut tracker = Tracker::start(MutationKind::Upsert, record_type);
        tracker.validating();
        let result = self.upsert_inner(record_type, target, create, update);
        tracker.finish(result, |_| 1)
    }

    fn upsert_inner(
        &mut self,
        record_type: &str,
        target: &UniqueWhere,
        create: &WriteData,
        update: &WriteData,
    ) -> Result<(Record, UpsertBranch)> {
        let schema = self.schema;
        let ty = schema.record_type(record_type)?;
        if self.find_unique(ty, target)?.is_some() {
            let record = self.update_inner(record_type, target, update, "upsert")?;
            Ok((record, UpsertBranch::Updated))
        } else {
            let record = self.create_inner(record_type, create)?;
            Ok((record, UpsertBranch::Created))
        }
    }

    /// Deletes the record found by `target`, applying referential actions.
    pub fn delete(&mut self, record_type: &str, target: &UniqueWhere) -> Result<Record> {
        self.delete_returning(record_type, target, |_| Ok(()))
            .map(|(record, ())| record)
    }

    /// Like [`Mutator::delete`], but hands the record to `project` before it
    /// is removed. A `project` failure rejects the delete.
    pub fn delete_returning<T>(
        &mut self,
        record_type: &str,
        target: &UniqueWhere,
        project: impl FnOnce(&Record) -> Result<T>,
    ) -> Result<(Record, T)> {
        let mut tracker = Tracker::start(MutationKind::Delete, record_type);
        tracker.validating();
        let result = self.delete_inner(record_type, target, project);
        tracker.finish(result, |_| 1)
    }

    fn delete_inner<T>(
        &mut self,
        record_type: &str,
        target: &UniqueWhere,
        project: impl FnOnce(&Record) -> Result<T>,
    ) -> Result<(Record, T)> {
        let schema = self.schema;
        let ty = schema.record_type(record_type)?;
        let record = self
            .find_unique(ty, target)?
            .ok_or_else(|| EngineError::RecordNotFound {
                record_type: record_type.to_owned(),
                operation: "delete",
            })?;
        let projected = project(&record)?;
        let record = self
            .delete_records(ty, vec![record])?
            .pop()
            .ok_or_else(|| EngineError::InvalidArgument("delete removed no record".into()))?;
        Ok((record, projected))
    }

    /// Deletes every record matching `filter` (the first `limit` in store
    /// order when given). Returns the deleted records.
    pub fn delete_many(&mut self, record_type: &str, filter: Option<&Filter>, limit: Option<usize>) -> Result<Vec<Record>> {
        self.delete_many_returning(record_type, filter, limit, |_| Ok(()))
            .map(|(records, ())| records)
    }

    /// Like [`Mutator::delete_many`], but hands the targeted records to
    /// `project` before they are removed.
    pub fn delete_many_returning<T>(
        &mut self,
        record_type: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
        project: impl FnOnce(&[Record]) -> Result<T>,
    ) -> Result<(Vec<Record>, T)> {
        let mut tracker = Tracker::start(MutationKind::DeleteMany, record_type);
        tracker.validating();
        let result = self.delete_many_inner(record_type, filter, limit, project);
        tracker.finish(result, |(records, _)| records.len())
    }

    fn delete_many_inner<T>(
        &mut self,
        record_type: &str,
        filter: Option<&Filter>,
        limit: Option<usize>,
        project: impl FnOnce(&[Record]) -> Result<T>,
    ) -> Result<(Vec<Record>, T)> {
        let schema = self.schema;
        let ty = schema.record_type(record_type)?;
        let records = self.targets(ty, filter, limit)?;
        let projected = project(&records)?;
        let deleted = self.delete_records(ty, records)?;
        Ok((deleted, projected))
    }

    /// Deletes exactly `records` of `record_type`. Referencing records are
    /// cascaded, nulled or cause a `ForeignKeyViolation` per their relation's
    /// referential action; the whole plan is checked before anything is
    /// removed.
    pub fn delete_records(&mut self, record_type: &RecordType, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut plan = DeletePlan::default();
        for record in &records {
            self.plan_delete(record_type, record.clone(), &mut plan)?;
        }
        for (holder_type, id, fields) in &plan.nulls {
            if plan.seen.contains(&(holder_type.clone(), *id)) {
                continue;
            }
            let view = self.reader.view();
            if let Some(mut holder) = self.store.get(holder_type, *id, &view)? {
                for field in fields {
                    holder.fields.insert(field.clone(), Value::Null);
                }
                self.store.update(self.txn, holder_type, *id, holder.fields)?;
            }
        }
        for (ty, record) in &plan.deletes {
            self.store.delete(self.txn, ty, record.id)?;
        }
        if plan.deletes.len() > records.len() || !plan.nulls.is_empty() {
            debug!(
                record_type = %record_type.name,
                deleted = plan.deletes.len(),
                nulled = plan.nulls.len(),
                "mutation.referential_actions"
            );
        }
        self.reader.invalidate();
        Ok(records)
    }

    fn plan_delete(&mut self, ty: &RecordType, record: Record, plan: &mut DeletePlan) -> Result<()> {
        if !plan.seen.insert((ty.name.clone(), record.id)) {
            return Ok(());
        }
        let schema = self.schema;
        for (holder_type, relation) in schema.referencing_relations(&ty.name) {
            let Some((fields, references, action)) = relation.foreign_key() else {
                continue;
            };
            let key = record.tuple(references);
            let holders: Vec<Record> = self
                .reader
                .lookup(&holder_type.name, fields, &key)?
                .into_iter()
                .filter(|holder| !plan.seen.contains(&(holder_type.name.clone(), holder.id)))
                .collect();
            if holders.is_empty() {
                continue;
            }
            match action {
                ReferentialAction::Restrict => {
                    return Err(EngineError::ForeignKeyViolation {
                        record_type: holder_type.name.clone(),
                        relation: relation.name.clone(),
                        fields: fields.to_vec(),
                        value: format_tuple(&key),
                    })
                }
                ReferentialAction::Cascade => {
                    for holder in holders {
                        self.plan_delete(holder_type, holder, plan)?;
                    }
                }
                ReferentialAction::SetNull => {
                    for holder in holders {
                        plan.nulls.push((holder_type.name.clone(), holder.id, fields.to_vec()));
                    }
                }
            }
        }
        plan.deletes.push((ty.name.clone(), record));
        Ok(())
    }

    fn prepare_create(&mut self, ty: &RecordType, data: &WriteData, overlay: &[Staged]) -> Result<Prepared> {
        let schema = self.schema;
        let mut fields = Fields::new();
        for (name, write) in &data.fields {
            let def = ty.require_scalar(name, "data")?;
            let FieldWrite::Set(value) = write else {
                return Err(EngineError::InvalidArgument(format!(
                    "'{}' on create: only set is allowed, got {}",
                    name,
                    write.name()
                )));
            };
            fields.insert(name.clone(), self.checked_value(ty, def, value.clone())?);
        }

        let mut replace = FxHashSet::default();
        self.write_owning_relations(ty, data, &mut fields, &mut replace)?;

        for def in &ty.scalars {
            if fields.contains_key(&def.name) {
                continue;
            }
            let value = match &def.default {
                Some(FieldDefault::Literal(value)) => schema.coerce(&ty.name, def, value.clone())?,
                Some(FieldDefault::AutoIncrement) => Value::Int(self.next_sequence(ty, &def.name, overlay)?),
                Some(FieldDefault::Now) => Value::now(),
                Some(FieldDefault::Cuid) => Value::String(cuid()),
                None if def.updated_at => Value::now(),
                None if def.nullable => Value::Null,
                None if def.list => Value::List(Vec::new()),
                None => {
                    return Err(EngineError::MissingField {
                        record_type: ty.name.clone(),
                        field: def.name.clone(),
                    })
                }
            };
            fields.insert(def.name.clone(), value);
        }

        let main = Staged {
            record_type: ty.name.clone(),
            id: None,
            fields,
        };
        self.finish_prepare(ty, main, None, data, &replace, overlay)
    }

    fn prepare_update(&mut self, ty: &RecordType, current: Record, data: &WriteData, overlay: &[Staged]) -> Result<Prepared> {
        let mut fields = current.fields.clone();
        for (name, write) in &data.fields {
            let def = ty.require_scalar(name, "data")?;
            let next = match write {
                FieldWrite::Set(value) => self.checked_value(ty, def, value.clone())?,
                FieldWrite::Push(value) => self.pushed(ty, def, current.value(name), value)?,
                arithmetic => self.arithmetic(ty, def, current.value(name), arithmetic)?,
            };
            fields.insert(name.clone(), next);
        }
        for def in ty.scalars.iter().filter(|def| def.updated_at) {
            if !data.fields.contains_key(&def.name) {
                fields.insert(def.name.clone(), Value::now());
            }
        }

        let mut replace = FxHashSet::default();
        self.write_owning_relations(ty, data, &mut fields, &mut replace)?;
        self.check_referenced_fields(ty, &current, &fields)?;

        let main = Staged {
            record_type: ty.name.clone(),
            id: Some(current.id),
            fields,
        };
        self.finish_prepare(ty, main, Some(&current), data, &replace, overlay)
    }

    /// Relation rewiring, cardinality and foreign-key checks shared by create
    /// and update.
    fn finish_prepare(
        &mut self,
        ty: &RecordType,
        main: Staged,
        current: Option<&Record>,
        data: &WriteData,
        replace: &FxHashSet<String>,
        overlay: &[Staged],
    ) -> Result<Prepared> {
        let mut prepared = Prepared {
            main,
            side: Vec::new(),
        };
        self.write_inverse_relations(ty, data, &mut prepared, overlay)?;
        self.check_one_to_one(ty, current, &mut prepared, replace, overlay)?;
        self.check_foreign_keys(ty, current, &prepared, overlay)?;
        Ok(prepared)
    }

    fn checked_value(&self, ty: &RecordType, def: &ScalarField, value: Value) -> Result<Value> {
        let value = self.schema.coerce(&ty.name, def, value)?;
        if value.is_null() && !def.nullable {
            return Err(EngineError::TypeMismatch {
                record_type: ty.name.clone(),
                field: def.name.clone(),
                expected: def.describe(),
                found: "null".into(),
            });
        }
        Ok(value)
    }

    fn pushed(&self, ty: &RecordType, def: &ScalarField, current: &Value, value: &Value) -> Result<Value> {
        if !def.list {
            return Err(EngineError::InvalidArgument(format!(
                "push on '{}.{}' requires a list field",
                ty.name, def.name
            )));
        }
        let mut items = current.as_list().map(<[Value]>::to_vec).unwrap_or_default();
        let additions = match value {
            Value::List(values) => values.clone(),
            single => vec![single.clone()],
        };
        for item in additions {
            let item = self.schema.coerce_element(&ty.name, def, item)?;
            if item.is_null() {
                return Err(EngineError::InvalidArgument(format!(
                    "push on '{}.{}' cannot append null",
                    ty.name, def.name
                )));
            }
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn arithmetic(&self, ty: &RecordType, def: &ScalarField, current: &Value, write: &FieldWrite) -> Result<Value> {
        if def.list || !def.kind.is_numeric() {
            return Err(EngineError::InvalidArgument(format!(
                "{} on '{}.{}' requires a numeric field",
                write.name(),
                ty.name,
                def.name
            )));
        }
        let operand = match write {
            FieldWrite::Increment(v) | FieldWrite::Decrement(v) | FieldWrite::Multiply(v) | FieldWrite::Divide(v) => {
                self.schema.coerce_element(&ty.name, def, v.clone())?
            }
            FieldWrite::Set(_) | FieldWrite::Push(_) => {
                return Err(EngineError::InvalidArgument(format!("{} is not arithmetic", write.name())))
            }
        };
        let invalid = |reason: &str| {
            EngineError::InvalidArgument(format!("{} on '{}.{}': {reason}", write.name(), ty.name, def.name))
        };
        if operand.is_null() {
            return Err(invalid("operand is null"));
        }
        match (current, &operand) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Int(a), Value::Int(b)) => {
                let (a, b) = (*a, *b);
                let result = match write {
                    FieldWrite::Increment(_) => a.checked_add(b),
                    FieldWrite::Decrement(_) => a.checked_sub(b),
                    FieldWrite::Multiply(_) => a.checked_mul(b),
                    _ if b == 0 => return Err(invalid("division by zero")),
                    _ => a.checked_div(b),
                };
                result.map(Value::Int).ok_or_else(|| invalid("integer overflow"))
            }
            (current, operand) => {
                let (Some(a), Some(b)) = (current.as_f64(), operand.as_f64()) else {
                    return Err(invalid("stored value is not numeric"));
                };
                let result = match write {
                    FieldWrite::Increment(_) => a + b,
                    FieldWrite::Decrement(_) => a - b,
                    FieldWrite::Multiply(_) => a * b,
                    _ if b == 0.0 => return Err(invalid("division by zero")),
                    _ => a / b,
                };
                Ok(Value::Float(result))
            }
        }
    }

    fn next_sequence(&mut self, ty: &RecordType, field: &str, overlay: &[Staged]) -> Result<i64> {
        let view = self.reader.view();
        let stored = self.store.next_sequence(&ty.name, field, &view)?;
        let staged = overlay
            .iter()
            .filter(|s| s.record_type == ty.name)
            .filter_map(|s| s.fields.get(field).and_then(Value::as_i64))
            .max();
        match staged {
            Some(max) if max >= stored => max
                .checked_add(1)
                .ok_or_else(|| EngineError::InvalidArgument(format!("sequence '{}.{field}' overflowed", ty.name))),
            _ => Ok(stored),
        }
    }

    /// Connect/disconnect on relations whose foreign key lives on `ty`.
    fn write_owning_relations(
        &mut self,
        ty: &RecordType,
        data: &WriteData,
        fields: &mut Fields,
        replace: &mut FxHashSet<String>,
    ) -> Result<()> {
        let schema = self.schema;
        for (name, write) in &data.relations {
            let relation = ty.require_relation(name)?;
            let Some((fk_fields, references, _)) = relation.foreign_key() else {
                continue;
            };
            match write {
                RelationWrite::Connect {
                    target,
                    replace_holder,
                } => {
                    let target_type = schema.record_type(&relation.target)?;
                    let linked = self
                        .find_unique(target_type, target)?
                        .ok_or_else(|| EngineError::RecordNotFound {
                            record_type: relation.target.clone(),
                            operation: "connect",
                        })?;
                    for (field, value) in fk_fields.iter().zip(linked.tuple(references)) {
                        fields.insert(field.clone(), value);
                    }
                    if *replace_holder {
                        replace.insert(relation.name.clone());
                    }
                }
                RelationWrite::Disconnect => {
                    require_nullable(ty, relation, fk_fields)?;
                    for field in fk_fields {
                        fields.insert(field.clone(), Value::Null);
                    }
                }
                RelationWrite::ConnectMany(_) | RelationWrite::DisconnectMany(_) => {
                    return Err(EngineError::InvalidArgument(format!(
                        "'{}.{}' is a to-one relation; use connect or disconnect",
                        ty.name, relation.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Connect/disconnect on inverse relations: the children's foreign keys
    /// are rewritten to point at (or away from) the main record.
    fn write_inverse_relations(
        &mut self,
        ty: &RecordType,
        data: &WriteData,
        prepared: &mut Prepared,
        overlay: &[Staged],
    ) -> Result<()> {
        let schema = self.schema;
        for (name, write) in &data.relations {
            let relation = ty.require_relation(name)?;
            match relation.link {
                RelationLink::ForeignKey { .. } => continue,
                RelationLink::Through { .. } => {
                    return Err(EngineError::InvalidArgument(format!(
                        "'{}.{}' links through join records; write the join records directly",
                        ty.name, relation.name
                    )))
                }
                RelationLink::Inverse => {}
            }
            let child_type = schema.record_type(&relation.target)?;
            let backing = schema.backing_foreign_key(ty, relation)?;
            let Some((fk_fields, references, _)) = backing.foreign_key() else {
                return Err(EngineError::relation_not_loadable(&ty.name, &relation.name));
            };
            let parent_key = prepared.main.tuple(references);
            let current_key = match prepared.main.id {
                Some(id) => self
                    .store
                    .get(&ty.name, id, &self.reader.view())?
                    .map(|record| record.tuple(references)),
                None => None,
            };

            let (connect, disconnect): (Vec<(&UniqueWhere, bool)>, Vec<&UniqueWhere>) = match write {
                RelationWrite::Connect {
                    target,
                    replace_holder,
                } => (vec![(target, *replace_holder)], Vec::new()),
                RelationWrite::ConnectMany(targets) if relation.cardinality == Cardinality::Many => {
                    (targets.iter().map(|t| (t, false)).collect(), Vec::new())
                }
                RelationWrite::DisconnectMany(targets) if relation.cardinality == Cardinality::Many => {
                    (Vec::new(), targets.iter().collect())
                }
                RelationWrite::Disconnect if relation.cardinality == Cardinality::One => (Vec::new(), Vec::new()),
                _ => {
                    return Err(EngineError::InvalidArgument(format!(
                        "'{}' is not supported on {:?} relation '{}.{}'",
                        relation_write_name(write),
                        relation.cardinality,
                        ty.name,
                        relation.name
                    )))
                }
            };

            if matches!(write, RelationWrite::Disconnect) {
                require_nullable(child_type, backing, fk_fields)?;
                if let Some(key) = &current_key {
                    for holder in self.reader.lookup(&child_type.name, fk_fields, key)? {
                        prepared.side.push(nulled(child_type, holder, fk_fields));
                    }
                }
                continue;
            }

            for (target, replace_holder) in connect {
                let child = self
                    .find_unique(child_type, target)?
                    .ok_or_else(|| EngineError::RecordNotFound {
                        record_type: child_type.name.clone(),
                        operation: "connect",
                    })?;
                if relation.cardinality == Cardinality::One {
                    if let Some(key) = &current_key {
                        let holders: Vec<Record> = self
                            .reader
                            .lookup(&child_type.name, fk_fields, key)?
                            .into_iter()
                            .filter(|holder| holder.id != child.id)
                            .collect();
                        if !holders.is_empty() {
                            if !replace_holder {
                                return Err(EngineError::CardinalityViolation {
                                    record_type: ty.name.clone(),
                                    relation: relation.name.clone(),
                                    value: format_tuple(key),
                                });
                            }
                            require_nullable(child_type, backing, fk_fields)?;
                            for holder in holders {
                                prepared.side.push(nulled(child_type, holder, fk_fields));
                            }
                        }
                    }
                }
                let mut fields = staged_fields(overlay, &child_type.name, &child);
                for (field, value) in fk_fields.iter().zip(parent_key.iter()) {
                    fields.insert(field.clone(), value.clone());
                }
                prepared.side.push(Staged {
                    record_type: child_type.name.clone(),
                    id: Some(child.id),
                    fields,
                });
            }

            if !disconnect.is_empty() {
                require_nullable(child_type, backing, fk_fields)?;
            }
            for target in disconnect {
                let Some(child) = self.find_unique(child_type, target)? else {
                    continue;
                };
                let linked = current_key
                    .as_ref()
                    .is_some_and(|key| tuples_equal(&child.tuple(fk_fields), key));
                if linked {
                    prepared.side.push(nulled(child_type, child, fk_fields));
                }
            }
        }
        Ok(())
    }

    /// Owning one-to-one relations: a foreign-key tuple may be held by one
    /// record only. A prior holder is unlinked when the write asked for
    /// `replace_holder`, otherwise the write is refused.
    fn check_one_to_one(
        &mut self,
        ty: &RecordType,
        current: Option<&Record>,
        prepared: &mut Prepared,
        replace: &FxHashSet<String>,
        overlay: &[Staged],
    ) -> Result<()> {
        let schema = self.schema;
        for relation in &ty.relations {
            let Some((fk_fields, _, _)) = relation.foreign_key() else {
                continue;
            };
            if !inverse_is_to_one(schema, relation) {
                continue;
            }
            let key = prepared.main.tuple(fk_fields);
            if key.iter().any(Value::is_null) {
                continue;
            }
            if current.is_some_and(|record| tuples_equal(&record.tuple(fk_fields), &key)) {
                continue;
            }
            let others: Vec<&Staged> = overlay.iter().chain(prepared.side.iter()).collect();
            let holders = self.holders(&others, &prepared.main, fk_fields)?;
            if holders.is_empty() {
                continue;
            }
            let stored: Vec<RecordId> = holders.iter().flatten().copied().collect();
            if !replace.contains(&relation.name) || stored.len() != holders.len() {
                return Err(EngineError::CardinalityViolation {
                    record_type: ty.name.clone(),
                    relation: relation.name.clone(),
                    value: format_tuple(&key),
                });
            }
            require_nullable(ty, relation, fk_fields)?;
            let view = self.reader.view();
            for id in stored {
                if let Some(holder) = self.store.get(&ty.name, id, &view)? {
                    prepared.side.push(nulled(ty, holder, fk_fields));
                }
            }
        }
        Ok(())
    }

    fn check_foreign_keys(&mut self, ty: &RecordType, current: Option<&Record>, prepared: &Prepared, overlay: &[Staged]) -> Result<()> {
        for relation in &ty.relations {
            let Some((fk_fields, references, _)) = relation.foreign_key() else {
                continue;
            };
            let key = prepared.main.tuple(fk_fields);
            if key.iter().any(Value::is_null) {
                continue;
            }
            if current.is_some_and(|record| tuples_equal(&record.tuple(fk_fields), &key)) {
                continue;
            }
            let stored = !self.reader.lookup(&relation.target, references, &key)?.is_empty();
            let staged = overlay
                .iter()
                .chain(prepared.all())
                .any(|s| s.record_type == relation.target && s.key(references).is_some_and(|k| k == keys(&key)));
            if !stored && !staged {
                return Err(EngineError::ForeignKeyViolation {
                    record_type: ty.name.clone(),
                    relation: relation.name.clone(),
                    fields: fk_fields.to_vec(),
                    value: format_tuple(&key),
                });
            }
        }
        Ok(())
    }

    /// Refuses to change fields other records reference through a foreign
    /// key while such records exist.
    fn check_referenced_fields(&mut self, ty: &RecordType, current: &Record, next: &Fields) -> Result<()> {
        let schema = self.schema;
        for (holder_type, relation) in schema.referencing_relations(&ty.name) {
            let Some((fields, references, _)) = relation.foreign_key() else {
                continue;
            };
            let before = current.tuple(references);
            let after: Vec<Value> = references
                .iter()
                .map(|f| next.get(f).cloned().unwrap_or(Value::Null))
                .collect();
            if tuples_equal(&before, &after) {
                continue;
            }
            let holders = self
                .reader
                .lookup(&holder_type.name, fields, &before)?
                .into_iter()
                .filter(|holder| !(holder_type.name == ty.name && holder.id == current.id))
                .count();
            if holders > 0 {
                return Err(EngineError::ForeignKeyViolation {
                    record_type: holder_type.name.clone(),
                    relation: relation.name.clone(),
                    fields: fields.to_vec(),
                    value: format_tuple(&before),
                });
            }
        }
        Ok(())
    }

    /// Unique constraints of every record the statement touches, against the
    /// store, earlier records of the statement and each other.
    fn check_uniques(&mut self, overlay: &[Staged], prepared: &Prepared) -> Result<()> {
        let schema = self.schema;
        let touched: Vec<&Staged> = prepared.all().collect();
        for (index, subject) in touched.iter().enumerate() {
            let ty = schema.record_type(&subject.record_type)?;
            let others: Vec<&Staged> = overlay
                .iter()
                .chain(touched.iter().enumerate().filter(|(i, _)| *i != index).map(|(_, s)| *s))
                .collect();
            for constraint in &ty.uniques {
                if subject.key(&constraint.fields).is_none() {
                    continue;
                }
                if !self.holders(&others, subject, &constraint.fields)?.is_empty() {
                    return Err(EngineError::UniqueConstraintViolation {
                        record_type: ty.name.clone(),
                        constraint: constraint.name.clone(),
                        fields: constraint.fields.clone(),
                        value: format_tuple(&subject.tuple(&constraint.fields)),
                    });
                }
            }
        }
        Ok(())
    }

    /// Records other than `subject` whose `fields` equal the subject's, as
    /// store ids (`None` for records staged for insertion). Stored records
    /// superseded by a staged version are judged by that version.
    fn holders(&mut self, others: &[&Staged], subject: &Staged, fields: &[String]) -> Result<Vec<Option<RecordId>>> {
        let Some(key) = subject.key(fields) else {
            return Ok(Vec::new());
        };
        let values = subject.tuple(fields);
        let mut holders: Vec<Option<RecordId>> = self
            .reader
            .lookup(&subject.record_type, fields, &values)?
            .into_iter()
            .filter(|record| subject.id != Some(record.id))
            .filter(|record| !others.iter().any(|o| o.supersedes(&subject.record_type, record.id)))
            .map(|record| Some(record.id))
            .collect();
        for other in others {
            let same_record = other.id.is_some() && other.id == subject.id;
            if other.record_type == subject.record_type && !same_record && other.key(fields).as_ref() == Some(&key) {
                holders.push(other.id);
            }
        }
        Ok(holders)
    }

    /// Writes validated records in order and returns the main record of each.
    fn apply(&mut self, batch: Vec<Prepared>) -> Result<Vec<Record>> {
        let mut written = Vec::with_capacity(batch.len());
        for prepared in batch {
            for side in prepared.side {
                if let Some(id) = side.id {
                    self.store.update(self.txn, &side.record_type, id, side.fields)?;
                }
            }
            let main = prepared.main;
            let id = match main.id {
                Some(id) => {
                    self.store.update(self.txn, &main.record_type, id, main.fields.clone())?;
                    id
                }
                None => self.store.insert(self.txn, &main.record_type, main.fields.clone())?,
            };
            written.push(Record {
                id,
                fields: main.fields,
            });
        }
        self.reader.invalidate();
        Ok(written)
    }
}

fn inverse_is_to_one(schema: &Schema, relation: &RelationField) -> bool {
    relation
        .inverse
        .as_deref()
        .and_then(|inverse| schema.record_type(&relation.target).ok()?.relation(inverse))
        .is_some_and(|inverse| inverse.cardinality == Cardinality::One)
}

/// Unique constraint of `ty` that a one-to-one `CardinalityViolation` on one
/// of its foreign keys also violates: one whose fields all belong to the key.
fn claimed_unique<'t>(ty: &'t RecordType, err: &EngineError) -> Option<&'t str> {
    let EngineError::CardinalityViolation {
        record_type, relation, ..
    } = err
    else {
        return None;
    };
    if *record_type != ty.name {
        return None;
    }
    let (fk_fields, _, _) = ty.relation(relation)?.foreign_key()?;
    ty.uniques
        .iter()
        .find(|unique| unique.fields.iter().all(|f| fk_fields.contains(f)))
        .map(|unique| unique.name.as_str())
}

fn require_nullable(ty: &RecordType, relation: &RelationField, fields: &[String]) -> Result<()> {
    let required = fields
        .iter()
        .any(|f| ty.scalar(f).map_or(true, |def| !def.nullable));
    if required {
        return Err(EngineError::InvalidArgument(format!(
            "cannot unlink '{}.{}': its foreign key is required",
            ty.name, relation.name
        )));
    }
    Ok(())
}

fn nulled(ty: &RecordType, mut record: Record, fields: &[String]) -> Staged {
    for field in fields {
        record.fields.insert(field.clone(), Value::Null);
    }
    Staged {
        record_type: ty.name.clone(),
        id: Some(record.id),
        fields: record.fields,
    }
}

/// Latest field map of `record`, preferring a version staged earlier in the
/// statement.
fn staged_fields(overlay: &[Staged], record_type: &str, record: &Record) -> Fields {
    overlay
        .iter()
        .rev()
        .find(|s| s.supersedes(record_type, record.id))
        .map(|s| s.fields.clone())
        .unwrap_or_else(|| record.fields.clone())
}

fn keys(values: &[Value]) -> SmallVec<[ValueKey; 2]> {
    values.iter().map(Value::key).collect()
}

fn tuples_equal(a: &[Value], b: &[Value]) -> bool {
    keys(a) == keys(b)
}

fn relation_write_name(write: &RelationWrite) -> &'static str {
    match write {
        RelationWrite::Connect { .. } => "connect",
        RelationWrite::Disconnect => "disconnect",
        RelationWrite::ConnectMany(_) => "connectMany",
        RelationWrite::DisconnectMany(_) => "disconnectMany",
    }
}

/// Collision-resistant identifier: `c`, base-36 millisecond timestamp, then
/// random base-36 digits.
fn cuid() -> String {
    let millis = match Value::now() {
        Value::DateTime(ms) => ms.max(0) as u64,
        _ => 0,
    };
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(25);
    id.push('c');
    push_base36(&mut id, millis, 8);
    push_base36(&mut id, rng.gen::<u64>(), 8);
    push_base36(&mut id, rng.gen::<u64>(), 8);
    id
}

fn push_base36(out: &mut String, mut value: u64, width: usize) {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut buf = [b'0'; 16];
    for slot in buf.iter_mut().rev().take(width) {
        *slot = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    out.extend(buf[16 - width..].iter().map(|b| *b as char));
}
