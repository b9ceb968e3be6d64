//! Aggregation and grouping.
//!
//! [`AggregatePlan::new`] validates an [`AggregateSpec`] against the schema
//! without touching the store; [`AggregatePlan::execute`] then scans the
//! filtered records once, partitions them by the grouping key and folds the
//! requested aggregates per partition.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::query::analyze::analyze_filter;
use crate::query::ast::{NullsOrder, OrderBy, SortOrder};
use crate::query::eval::eval_field;
use crate::query::executor::{apply_window, compare_values, Reader, Row};
use crate::query::filter::{FieldOp, Filter, QueryMode};
use crate::query::value::{Value, ValueKey};
use crate::schema::{RecordType, ScalarField, ScalarKind, Schema};
use crate::storage::Record;

/// Pseudo-field naming the record count.
pub const COUNT_ALL: &str = "_all";

/// Aggregate function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggFunc {
    /// Non-null values (or records, for `_all`).
    Count,
    /// Smallest non-null value.
    Min,
    /// Largest non-null value.
    Max,
    /// Sum of non-null values.
    Sum,
    /// Mean of non-null values.
    Avg,
}

impl AggFunc {
    fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "_count",
            AggFunc::Min => "_min",
            AggFunc::Max => "_max",
            AggFunc::Sum => "_sum",
            AggFunc::Avg => "_avg",
        }
    }
}

/// Value a `having` condition or group ordering refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggTarget {
    /// A grouping-key field.
    Field(String),
    /// An aggregate of a field; `Count` also accepts [`COUNT_ALL`].
    Aggregate {
        /// Function.
        func: AggFunc,
        /// Aggregated field.
        field: String,
    },
}

impl AggTarget {
    /// Aggregate target shorthand.
    pub fn aggregate(func: AggFunc, field: impl Into<String>) -> Self {
        AggTarget::Aggregate {
            func,
            field: field.into(),
        }
    }
}

/// Condition tree evaluated against each group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Having {
    /// Every condition holds.
    And(Vec<Having>),
    /// Some condition holds.
    Or(Vec<Having>),
    /// No condition holds.
    Not(Vec<Having>),
    /// Comparison on a key field or aggregate.
    Condition {
        /// Compared value.
        target: AggTarget,
        /// Operator and operand.
        op: FieldOp,
    },
}

impl Having {
    /// Condition shorthand.
    pub fn condition(target: AggTarget, op: FieldOp) -> Self {
        Having::Condition { target, op }
    }
}

/// Ordering key over groups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOrderBy {
    /// Sorted value.
    pub target: AggTarget,
    /// Direction.
    #[serde(default)]
    pub direction: SortOrder,
    /// Null placement; nulls-smallest by default.
    #[serde(default)]
    pub nulls: Option<NullsOrder>,
}

/// Arguments of `aggregate` and `group_by`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateSpec {
    /// Record filter applied before grouping.
    #[serde(rename = "where")]
    pub filter: Option<Filter>,
    /// Grouping key. Empty means a single row over every filtered record.
    pub by: Vec<String>,
    /// Count records.
    pub count_all: bool,
    /// Count non-null values of these fields.
    pub count: Vec<String>,
    /// Minimum of these fields.
    pub min: Vec<String>,
    /// Maximum of these fields.
    pub max: Vec<String>,
    /// Sum of these numeric fields.
    pub sum: Vec<String>,
    /// Mean of these numeric fields.
    pub avg: Vec<String>,
    /// Group filter.
    pub having: Option<Having>,
    /// Group ordering.
    pub order_by: Vec<AggregateOrderBy>,
    /// Groups (or, ungrouped, records) skipped.
    pub skip: Option<usize>,
    /// Signed number of groups (or, ungrouped, records) kept.
    pub take: Option<i64>,
}

impl AggregateSpec {
    /// Empty spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the record filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the grouping key.
    pub fn by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Requests the record count.
    pub fn count_all(mut self) -> Self {
        self.count_all = true;
        self
    }

    /// Requests an aggregate of `field`.
    pub fn with(mut self, func: AggFunc, field: impl Into<String>) -> Self {
        let field = field.into();
        match func {
            AggFunc::Count if field == COUNT_ALL => self.count_all = true,
            AggFunc::Count => self.count.push(field),
            AggFunc::Min => self.min.push(field),
            AggFunc::Max => self.max.push(field),
            AggFunc::Sum => self.sum.push(field),
            AggFunc::Avg => self.avg.push(field),
        }
        self
    }

    /// Sets the group filter.
    pub fn having(mut self, having: Having) -> Self {
        self.having = Some(having);
        self
    }

    /// Appends a group ordering key.
    pub fn order_by(mut self, target: AggTarget, direction: SortOrder) -> Self {
        self.order_by.push(AggregateOrderBy {
            target,
            direction,
            nulls: None,
        });
        self
    }

    /// Sets the offset.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets the signed page size.
    pub fn take(mut self, take: i64) -> Self {
        self.take = Some(take);
        self
    }

    fn requested(&self) -> Vec<(AggFunc, String)> {
        let mut out = Vec::new();
        if self.count_all {
            out.push((AggFunc::Count, COUNT_ALL.to_owned()));
        }
        for (func, fields) in [
            (AggFunc::Count, &self.count),
            (AggFunc::Min, &self.min),
            (AggFunc::Max, &self.max),
            (AggFunc::Sum, &self.sum),
            (AggFunc::Avg, &self.avg),
        ] {
            out.extend(fields.iter().map(|f| (func, f.clone())));
        }
        out
    }
}

/// One output row: the grouping key plus the requested aggregates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Grouping-key values; empty when ungrouped.
    #[serde(flatten)]
    pub key: Row,
    /// Counts, `_all` included when requested.
    #[serde(rename = "_count", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub count: BTreeMap<String, i64>,
    /// Minimums.
    #[serde(rename = "_min", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min: BTreeMap<String, Value>,
    /// Maximums.
    #[serde(rename = "_max", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max: BTreeMap<String, Value>,
    /// Sums.
    #[serde(rename = "_sum", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sum: BTreeMap<String, Value>,
    /// Means.
    #[serde(rename = "_avg", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub avg: BTreeMap<String, Value>,
}

impl AggregateRow {
    /// Record count, when requested.
    pub fn count_all(&self) -> Option<i64> {
        self.count.get(COUNT_ALL).copied()
    }
}

/// Aggregation output: one row ungrouped, one row per surviving group
/// otherwise.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Output rows.
    pub rows: Vec<AggregateRow>,
}

impl AggregateResult {
    /// The single row of an ungrouped aggregation.
    pub fn single(&self) -> Option<&AggregateRow> {
        self.rows.first()
    }
}

/// Validated aggregation, ready to run.
#[derive(Clone, Debug)]
pub struct AggregatePlan {
    record_type: String,
    filter: Option<Filter>,
    by: Vec<String>,
    /// Output aggregates.
    requested: Vec<(AggFunc, String)>,
    /// Output aggregates plus those only `having`/`order_by` refer to.
    computed: Vec<(AggFunc, String)>,
    kinds: FxHashMap<String, ScalarKind>,
    having: Option<Having>,
    order_by: Vec<AggregateOrderBy>,
    skip: usize,
    take: Option<i64>,
}

impl AggregatePlan {
    /// Validates `spec` for `record_type`.
    pub fn new(schema: &Schema, record_type: &RecordType, spec: &AggregateSpec) -> Result<Self> {
        let invalid = |reason: String| EngineError::InvalidAggregate {
            record_type: record_type.name.clone(),
            reason,
        };
        let filter = spec
            .filter
            .as_ref()
            .map(|filter| analyze_filter(schema, record_type, filter))
            .transpose()?;
        for name in &spec.by {
            let field = record_type.require_scalar(name, "by")?;
            if field.list {
                return Err(invalid(format!("list field '{name}' cannot be a grouping key")));
            }
        }
        if spec.by.is_empty() && (spec.having.is_some() || !spec.order_by.is_empty()) {
            return Err(invalid("having and orderBy require a non-empty groupBy key".into()));
        }

        let requested = spec.requested();
        let mut computed = requested.clone();
        for (func, field) in &requested {
            check_aggregate(record_type, *func, field, &invalid)?;
        }
        let mut reference = |target: &AggTarget| -> Result<()> {
            match target {
                AggTarget::Field(name) => {
                    if !spec.by.contains(name) {
                        return Err(invalid(format!(
                            "'{name}' is referenced but is not part of the groupBy key {:?}",
                            spec.by
                        )));
                    }
                }
                AggTarget::Aggregate { func, field } => {
                    check_aggregate(record_type, *func, field, &invalid)?;
                    if !computed.iter().any(|(f, n)| f == func && n == field) {
                        computed.push((*func, field.clone()));
                    }
                }
            }
            Ok(())
        };
        for order in &spec.order_by {
            reference(&order.target)?;
        }
        let having = match &spec.having {
            Some(having) => Some(analyze_having(schema, record_type, having, &mut reference, &invalid)?),
            None => None,
        };

        Ok(Self {
            record_type: record_type.name.clone(),
            filter,
            by: spec.by.clone(),
            requested,
            computed,
            kinds: record_type
                .scalars
                .iter()
                .map(|f| (f.name.clone(), f.kind.clone()))
                .collect(),
            having,
            order_by: spec.order_by.clone(),
            skip: spec.skip.unwrap_or(0),
            take: spec.take,
        })
    }

    /// Scans, groups and folds.
    pub fn execute(&self, reader: &mut Reader<'_>) -> Result<AggregateResult> {
        let record_type = reader.schema().record_type(&self.record_type)?;
        let records = reader.matching(record_type, self.filter.as_ref())?;

        if self.by.is_empty() {
            let records = apply_window(records, None, self.skip, self.take);
            let row = self.fold(&records, Row::new())?;
            return Ok(AggregateResult {
                rows: vec![self.strip(row)],
            });
        }

        let mut slots: FxHashMap<Vec<ValueKey>, usize> = FxHashMap::default();
        let mut groups: Vec<(Row, Vec<Record>)> = Vec::new();
        for record in records {
            let key: Vec<ValueKey> = self.by.iter().map(|f| record.value(f).key()).collect();
            let slot = *slots.entry(key).or_insert_with(|| {
                let values = self
                    .by
                    .iter()
                    .map(|f| (f.clone(), record.value(f).clone()))
                    .collect();
                groups.push((values, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(record);
        }

        let mut rows = Vec::with_capacity(groups.len());
        for (key, members) in &groups {
            let row = self.fold(members, key.clone())?;
            let keep = match &self.having {
                Some(having) => eval_having(having, &row),
                None => true,
            };
            if keep {
                rows.push(row);
            }
        }
        if !self.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for order in &self.order_by {
                    let key = OrderBy {
                        field: String::new(),
                        direction: order.direction,
                        nulls: order.nulls,
                    };
                    let ord = compare_values(&key, &target_value(&order.target, a), &target_value(&order.target, b));
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        let rows: Vec<AggregateRow> = apply_window(rows, None, self.skip, self.take)
            .into_iter()
            .map(|row| self.strip(row))
            .collect();
        debug!(
            record_type = %self.record_type,
            groups = groups.len(),
            returned = rows.len(),
            "aggregate.group_by"
        );
        Ok(AggregateResult { rows })
    }

    fn fold(&self, records: &[Record], key: Row) -> Result<AggregateRow> {
        let mut row = AggregateRow {
            key,
            ..AggregateRow::default()
        };
        for (func, field) in &self.computed {
            let values = move || non_null(records, field);
            match func {
                AggFunc::Count if field == COUNT_ALL => {
                    row.count.insert(field.clone(), records.len() as i64);
                }
                AggFunc::Count => {
                    row.count.insert(field.clone(), values().count() as i64);
                }
                AggFunc::Min => {
                    let min = values().min_by(|a, b| a.sort_cmp(b)).cloned().unwrap_or(Value::Null);
                    row.min.insert(field.clone(), min);
                }
                AggFunc::Max => {
                    let max = values().max_by(|a, b| a.sort_cmp(b)).cloned().unwrap_or(Value::Null);
                    row.max.insert(field.clone(), max);
                }
                AggFunc::Sum => {
                    let sum = if self.kinds.get(field) == Some(&ScalarKind::Int) {
                        let mut total = 0i64;
                        for value in values() {
                            total = value
                                .as_i64()
                                .and_then(|v| total.checked_add(v))
                                .ok_or_else(|| {
                                    EngineError::InvalidArgument(format!(
                                        "_sum of '{}.{field}' overflows a 64-bit integer",
                                        self.record_type
                                    ))
                                })?;
                        }
                        Value::Int(total)
                    } else {
                        Value::Float(values().filter_map(Value::as_f64).sum())
                    };
                    row.sum.insert(field.clone(), sum);
                }
                AggFunc::Avg => {
                    let (total, n) = values()
                        .filter_map(Value::as_f64)
                        .fold((0.0, 0usize), |(t, n), v| (t + v, n + 1));
                    let avg = if n == 0 {
                        Value::Null
                    } else {
                        Value::Float(total / n as f64)
                    };
                    row.avg.insert(field.clone(), avg);
                }
            }
        }
        Ok(row)
    }

    fn strip(&self, mut row: AggregateRow) -> AggregateRow {
        if self.computed.len() == self.requested.len() {
            return row;
        }
        let wanted = |func: AggFunc, field: &String| self.requested.iter().any(|(f, n)| *f == func && n == field);
        row.count.retain(|field, _| wanted(AggFunc::Count, field));
        row.min.retain(|field, _| wanted(AggFunc::Min, field));
        row.max.retain(|field, _| wanted(AggFunc::Max, field));
        row.sum.retain(|field, _| wanted(AggFunc::Sum, field));
        row.avg.retain(|field, _| wanted(AggFunc::Avg, field));
        row
    }
}

fn non_null<'r>(records: &'r [Record], field: &'r str) -> impl Iterator<Item = &'r Value> + 'r {
    records
        .iter()
        .map(move |record| record.value(field))
        .filter(|value| !value.is_null())
}

fn check_aggregate(
    record_type: &RecordType,
    func: AggFunc,
    field: &str,
    invalid: &impl Fn(String) -> EngineError,
) -> Result<()> {
    if func == AggFunc::Count && field == COUNT_ALL {
        return Ok(());
    }
    let def = record_type.require_scalar(field, func.name())?;
    let supported = match func {
        AggFunc::Count => true,
        AggFunc::Min | AggFunc::Max => !def.list && def.kind.is_min_max(),
        AggFunc::Sum | AggFunc::Avg => !def.list && def.kind.is_numeric(),
    };
    if supported {
        Ok(())
    } else {
        Err(invalid(format!(
            "{} does not apply to '{field}' ({})",
            func.name(),
            def.describe()
        )))
    }
}

fn analyze_having(
    schema: &Schema,
    record_type: &RecordType,
    having: &Having,
    reference: &mut impl FnMut(&AggTarget) -> Result<()>,
    invalid: &impl Fn(String) -> EngineError,
) -> Result<Having> {
    let children = match having {
        Having::And(children) | Having::Or(children) | Having::Not(children) => children,
        Having::Condition { target, op } => {
            return analyze_condition(schema, record_type, target, op, reference, invalid)
        }
    };
    let mut analyzed = Vec::with_capacity(children.len());
    for child in children {
        analyzed.push(analyze_having(schema, record_type, child, reference, invalid)?);
    }
    Ok(match having {
        Having::And(_) => Having::And(analyzed),
        Having::Or(_) => Having::Or(analyzed),
        _ => Having::Not(analyzed),
    })
}

fn analyze_condition(
    schema: &Schema,
    record_type: &RecordType,
    target: &AggTarget,
    op: &FieldOp,
    reference: &mut impl FnMut(&AggTarget) -> Result<()>,
    invalid: &impl Fn(String) -> EngineError,
) -> Result<Having> {
    reference(target)?;
    let operand_field = match target {
        AggTarget::Field(name) => Some(record_type.require_scalar(name, "having")?.clone()),
        AggTarget::Aggregate { func, field } => match func {
            AggFunc::Count => Some(ScalarField::int(field.clone())),
            AggFunc::Avg => Some(ScalarField::float(field.clone())),
            _ => record_type.scalar(field).cloned(),
        },
    };
    let operand_field = operand_field.map(|mut f| {
        f.list = false;
        f
    });
    let coerce = |value: &Value| -> Result<Value> {
        match &operand_field {
            Some(field) => schema.coerce_element(&record_type.name, field, value.clone()),
            None => Ok(value.clone()),
        }
    };
    let coerce_all = |values: &[Value]| values.iter().map(coerce).collect::<Result<Vec<_>>>();
    let op = match op {
        FieldOp::Equals(v) => FieldOp::Equals(coerce(v)?),
        FieldOp::Not(v) => FieldOp::Not(coerce(v)?),
        FieldOp::Lt(v) => FieldOp::Lt(coerce(v)?),
        FieldOp::Lte(v) => FieldOp::Lte(coerce(v)?),
        FieldOp::Gt(v) => FieldOp::Gt(coerce(v)?),
        FieldOp::Gte(v) => FieldOp::Gte(coerce(v)?),
        FieldOp::In(vs) => FieldOp::In(coerce_all(vs)?),
        FieldOp::NotIn(vs) => FieldOp::NotIn(coerce_all(vs)?),
        FieldOp::IsNull => FieldOp::IsNull,
        FieldOp::IsNotNull => FieldOp::IsNotNull,
        other => {
            return Err(invalid(format!(
                "operator '{}' is not supported in having",
                other.name()
            )))
        }
    };
    Ok(Having::Condition {
        target: target.clone(),
        op,
    })
}

fn target_value(target: &AggTarget, row: &AggregateRow) -> Value {
    match target {
        AggTarget::Field(name) => row.key.get(name).cloned().unwrap_or(Value::Null),
        AggTarget::Aggregate { func, field } => {
            let found = match func {
                AggFunc::Count => row.count.get(field).map(|n| Value::Int(*n)),
                AggFunc::Min => row.min.get(field).cloned(),
                AggFunc::Max => row.max.get(field).cloned(),
                AggFunc::Sum => row.sum.get(field).cloned(),
                AggFunc::Avg => row.avg.get(field).cloned(),
            };
            found.unwrap_or(Value::Null)
        }
    }
}

fn eval_having(having: &Having, row: &AggregateRow) -> bool {
    match having {
        Having::And(children) => children.iter().all(|child| eval_having(child, row)),
        Having::Or(children) => children.iter().any(|child| eval_having(child, row)),
        Having::Not(children) => !children.iter().any(|child| eval_having(child, row)),
        Having::Condition { target, op } => eval_field(&target_value(target, row), op, QueryMode::Default),
    }
}
