//! Static checks that run before a filter touches the store.
//!
//! Analysis resolves every field and relation reference against the schema,
//! checks operators against field kinds, and coerces literals into the field's
//! representation (enum variants, datetimes, int-to-float) so evaluation can
//! compare values directly.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::query::filter::{FieldOp, Filter, QueryMode, RelationPredicate};
use crate::query::value::Value;
use crate::schema::{Cardinality, RecordType, ScalarField, ScalarKind, Schema};

/// Deepest filter tree accepted.
pub const MAX_FILTER_DEPTH: usize = 64;

/// Largest `in`/`notIn`/`hasEvery`/`hasSome` operand accepted.
pub const MAX_IN_VALUES: usize = 10_000;

/// Type-checks `filter` against `record_type` and returns it with every
/// literal coerced to its field's kind.
pub fn analyze_filter(schema: &Schema, record_type: &RecordType, filter: &Filter) -> Result<Filter> {
    let depth = filter.depth();
    if depth > MAX_FILTER_DEPTH {
        return Err(EngineError::InvalidArgument(format!(
            "filter on '{}' nests {depth} levels (max {MAX_FILTER_DEPTH})",
            record_type.name
        )));
    }
    analyze_node(schema, record_type, filter)
}

/// Resolves field/value pairs that must name exactly one unique constraint
/// of `record_type`. Returns the coerced values in constraint order.
pub fn analyze_unique(
    schema: &Schema,
    record_type: &RecordType,
    values: &BTreeMap<String, Value>,
    context: &'static str,
) -> Result<Vec<(String, Value)>> {
    let fields: Vec<&str> = values.keys().map(String::as_str).collect();
    let constraint = record_type
        .unique_for(&fields)
        .ok_or_else(|| EngineError::invalid_field(&record_type.name, fields.join(", "), context))?;
    constraint
        .fields
        .iter()
        .map(|name| {
            let def = record_type.require_scalar(name, context)?;
            let raw = values.get(name).cloned().unwrap_or(Value::Null);
            Ok((name.clone(), schema.coerce(&record_type.name, def, raw)?))
        })
        .collect()
}

fn analyze_node(schema: &Schema, ty: &RecordType, filter: &Filter) -> Result<Filter> {
    match filter {
        Filter::And(children) => Ok(Filter::And(analyze_all(schema, ty, children)?)),
        Filter::Or(children) => Ok(Filter::Or(analyze_all(schema, ty, children)?)),
        Filter::Not(children) => Ok(Filter::Not(analyze_all(schema, ty, children)?)),
        Filter::Field { field, op, mode } => {
            let def = ty.scalar(field).ok_or_else(|| {
                EngineError::invalid_field(&ty.name, field.as_str(), "filter")
            })?;
            let op = analyze_op(schema, ty, def, op, *mode)?;
            Ok(Filter::Field {
                field: field.clone(),
                op,
                mode: *mode,
            })
        }
        Filter::Relation {
            relation,
            predicate,
        } => {
            let rel = ty.require_relation(relation)?;
            let wants_many = predicate.is_to_many();
            if wants_many != (rel.cardinality == Cardinality::Many) {
                return Err(EngineError::InvalidArgument(format!(
                    "'{}' cannot be applied to {} relation '{}.{}'",
                    predicate.name(),
                    if rel.cardinality == Cardinality::Many {
                        "to-many"
                    } else {
                        "to-one"
                    },
                    ty.name,
                    relation
                )));
            }
            let target = schema.record_type(&rel.target)?;
            let nested = |inner: &Filter| -> Result<Box<Filter>> {
                analyze_node(schema, target, inner).map(Box::new)
            };
            let predicate = match predicate {
                RelationPredicate::Some(inner) => RelationPredicate::Some(nested(inner)?),
                RelationPredicate::Every(inner) => RelationPredicate::Every(nested(inner)?),
                RelationPredicate::None(inner) => RelationPredicate::None(nested(inner)?),
                RelationPredicate::Is(inner) => {
                    RelationPredicate::Is(inner.as_deref().map(nested).transpose()?)
                }
                RelationPredicate::IsNot(inner) => {
                    RelationPredicate::IsNot(inner.as_deref().map(nested).transpose()?)
                }
            };
            Ok(Filter::Relation {
                relation: relation.clone(),
                predicate,
            })
        }
    }
}

fn analyze_all(schema: &Schema, ty: &RecordType, children: &[Filter]) -> Result<Vec<Filter>> {
    children
        .iter()
        .map(|child| analyze_node(schema, ty, child))
        .collect()
}

fn analyze_op(
    schema: &Schema,
    ty: &RecordType,
    def: &ScalarField,
    op: &FieldOp,
    mode: QueryMode,
) -> Result<FieldOp> {
    let reject = |expected: &str| EngineError::TypeMismatch {
        record_type: ty.name.clone(),
        field: def.name.clone(),
        expected: expected.to_owned(),
        found: format!("'{}' on {}", op.name(), def.describe()),
    };
    if mode == QueryMode::Insensitive && def.kind != ScalarKind::String {
        return Err(reject("a string field for insensitive mode"));
    }
    // whole-value coercion, lists included
    let whole = |value: &Value| schema.coerce(&ty.name, def, value.clone());
    // non-null element of the field's kind
    let element = |value: &Value| -> Result<Value> {
        if value.is_null() {
            return Err(EngineError::TypeMismatch {
                record_type: ty.name.clone(),
                field: def.name.clone(),
                expected: def.kind.describe(),
                found: format!("null operand of '{}'", op.name()),
            });
        }
        schema.coerce_element(&ty.name, def, value.clone())
    };
    let elements = |values: &[Value]| -> Result<Vec<Value>> {
        if values.len() > MAX_IN_VALUES {
            return Err(EngineError::InvalidArgument(format!(
                "'{}' on '{}.{}' lists {} values (max {MAX_IN_VALUES})",
                op.name(),
                ty.name,
                def.name,
                values.len()
            )));
        }
        values.iter().map(element).collect()
    };

    let ordered = || {
        if def.list || !def.kind.is_ordered() {
            Err(reject("an ordered scalar (string, int, float, datetime)"))
        } else {
            Ok(())
        }
    };
    let scalar = || {
        if def.list {
            Err(reject("a scalar field"))
        } else {
            Ok(())
        }
    };
    let text = || {
        if def.list || def.kind != ScalarKind::String {
            Err(reject("a string field"))
        } else {
            Ok(())
        }
    };
    let list = || {
        if def.list {
            Ok(())
        } else {
            Err(reject("a list field"))
        }
    };

    Ok(match op {
        FieldOp::Equals(value) => FieldOp::Equals(whole(value)?),
        FieldOp::Not(value) => FieldOp::Not(whole(value)?),
        FieldOp::IsNull => FieldOp::IsNull,
        FieldOp::IsNotNull => FieldOp::IsNotNull,
        FieldOp::Lt(value) => {
            ordered()?;
            FieldOp::Lt(element(value)?)
        }
        FieldOp::Lte(value) => {
            ordered()?;
            FieldOp::Lte(element(value)?)
        }
        FieldOp::Gt(value) => {
            ordered()?;
            FieldOp::Gt(element(value)?)
        }
        FieldOp::Gte(value) => {
            ordered()?;
            FieldOp::Gte(element(value)?)
        }
        FieldOp::In(values) => {
            scalar()?;
            FieldOp::In(elements(values)?)
        }
        FieldOp::NotIn(values) => {
            scalar()?;
            FieldOp::NotIn(elements(values)?)
        }
        FieldOp::Contains(needle) => {
            text()?;
            FieldOp::Contains(needle.clone())
        }
        FieldOp::StartsWith(prefix) => {
            text()?;
            FieldOp::StartsWith(prefix.clone())
        }
        FieldOp::EndsWith(suffix) => {
            text()?;
            FieldOp::EndsWith(suffix.clone())
        }
        FieldOp::Has(value) => {
            list()?;
            FieldOp::Has(element(value)?)
        }
        FieldOp::HasEvery(values) => {
            list()?;
            FieldOp::HasEvery(elements(values)?)
        }
        FieldOp::HasSome(values) => {
            list()?;
            FieldOp::HasSome(elements(values)?)
        }
        FieldOp::IsEmpty(flag) => {
            list()?;
            FieldOp::IsEmpty(*flag)
        }
    })
}
