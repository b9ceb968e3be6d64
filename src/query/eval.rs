//! Two-valued filter evaluation.
//!
//! Every predicate resolves to a definite `true` or `false`. Comparisons
//! against a null field value are false, with the exception of `not`, `notIn`
//! and `isNull`, whose negative reading holds for null.

use std::cmp::Ordering;

use crate::error::Result;
use crate::query::filter::{FieldOp, Filter, QueryMode, RelationPredicate};
use crate::query::value::Value;
use crate::schema::{RecordType, RelationField, Schema};
use crate::storage::Record;

/// Fetches the records related to `record` through `relation`, on demand.
pub trait RelationResolver {
    /// Related records of `record` (declared on `owner`) through `relation`.
    fn related(&mut self, owner: &RecordType, relation: &RelationField, record: &Record) -> Result<Vec<Record>>;
}

impl<F> RelationResolver for F
where
    F: FnMut(&RecordType, &RelationField, &Record) -> Result<Vec<Record>>,
{
    fn related(&mut self, owner: &RecordType, relation: &RelationField, record: &Record) -> Result<Vec<Record>> {
        self(owner, relation, record)
    }
}

/// Resolver for filters known to contain no relation predicates; every
/// relation appears empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelations;

impl RelationResolver for NoRelations {
    fn related(&mut self, _: &RecordType, _: &RelationField, _: &Record) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }
}

/// Evaluates an analyzed `filter` against `record` of `record_type`.
pub fn evaluate<R>(
    schema: &Schema,
    record_type: &RecordType,
    filter: &Filter,
    record: &Record,
    resolver: &mut R,
) -> Result<bool>
where
    R: RelationResolver + ?Sized,
{
    match filter {
        Filter::And(children) => {
            for child in children {
                if !evaluate(schema, record_type, child, record, resolver)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Or(children) => {
            for child in children {
                if evaluate(schema, record_type, child, record, resolver)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Filter::Not(children) => {
            for child in children {
                if evaluate(schema, record_type, child, record, resolver)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Field { field, op, mode } => Ok(eval_field(record.value(field), op, *mode)),
        Filter::Relation {
            relation,
            predicate,
        } => {
            let rel = record_type.require_relation(relation)?;
            let target = schema.record_type(&rel.target)?;
            let related = resolver.related(record_type, rel, record)?;
            let mut matches = |inner: &Filter| -> Result<usize> {
                let mut hits = 0;
                for candidate in &related {
                    if evaluate(schema, target, inner, candidate, &mut *resolver)? {
                        hits += 1;
                    }
                }
                Ok(hits)
            };
            match predicate {
                RelationPredicate::Some(inner) => Ok(any_match(&related, inner, |f| matches(f))?),
                RelationPredicate::Every(inner) => Ok(matches(inner)? == related.len()),
                RelationPredicate::None(inner) => Ok(!any_match(&related, inner, |f| matches(f))?),
                RelationPredicate::Is(inner) => is_match(&related, inner.as_deref(), |f| matches(f)),
                RelationPredicate::IsNot(inner) => {
                    is_match(&related, inner.as_deref(), |f| matches(f)).map(|hit| !hit)
                }
            }
        }
    }
}

fn any_match(
    related: &[Record],
    inner: &Filter,
    mut count: impl FnMut(&Filter) -> Result<usize>,
) -> Result<bool> {
    if related.is_empty() {
        return Ok(false);
    }
    Ok(count(inner)? > 0)
}

fn is_match(
    related: &[Record],
    inner: Option<&Filter>,
    mut count: impl FnMut(&Filter) -> Result<usize>,
) -> Result<bool> {
    match inner {
        None => Ok(related.is_empty()),
        Some(_) if related.is_empty() => Ok(false),
        Some(filter) => Ok(count(filter)? > 0),
    }
}

/// Evaluates one comparison leaf against a field value.
pub fn eval_field(value: &Value, op: &FieldOp, mode: QueryMode) -> bool {
    let insensitive = mode == QueryMode::Insensitive;
    match op {
        FieldOp::Equals(expected) => {
            if expected.is_null() || value.is_null() {
                return expected.is_null() && value.is_null();
            }
            values_equal(value, expected, insensitive)
        }
        FieldOp::Not(expected) => {
            if expected.is_null() || value.is_null() {
                return expected.is_null() != value.is_null();
            }
            !values_equal(value, expected, insensitive)
        }
        FieldOp::Lt(bound) => ordering(value, bound, insensitive) == Some(Ordering::Less),
        FieldOp::Lte(bound) => matches!(
            ordering(value, bound, insensitive),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FieldOp::Gt(bound) => ordering(value, bound, insensitive) == Some(Ordering::Greater),
        FieldOp::Gte(bound) => matches!(
            ordering(value, bound, insensitive),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FieldOp::In(set) => !value.is_null() && set.iter().any(|v| values_equal(value, v, insensitive)),
        FieldOp::NotIn(set) => value.is_null() || !set.iter().any(|v| values_equal(value, v, insensitive)),
        FieldOp::Contains(needle) => text_match(value, needle, insensitive, |h, n| h.contains(n)),
        FieldOp::StartsWith(prefix) => text_match(value, prefix, insensitive, |h, n| h.starts_with(n)),
        FieldOp::EndsWith(suffix) => text_match(value, suffix, insensitive, |h, n| h.ends_with(n)),
        FieldOp::IsNull => value.is_null(),
        FieldOp::IsNotNull => !value.is_null(),
        FieldOp::Has(element) => list_items(value).iter().any(|item| item.loosely_equals(element)),
        FieldOp::HasEvery(elements) => {
            let items = list_items(value);
            elements
                .iter()
                .all(|element| items.iter().any(|item| item.loosely_equals(element)))
        }
        FieldOp::HasSome(elements) => {
            let items = list_items(value);
            elements
                .iter()
                .any(|element| items.iter().any(|item| item.loosely_equals(element)))
        }
        FieldOp::IsEmpty(expected) => list_items(value).is_empty() == *expected,
    }
}

fn list_items(value: &Value) -> &[Value] {
    value.as_list().unwrap_or(&[])
}

fn values_equal(left: &Value, right: &Value, insensitive: bool) -> bool {
    match (insensitive, left.as_str(), right.as_str()) {
        (true, Some(a), Some(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => left.loosely_equals(right),
    }
}

fn ordering(value: &Value, bound: &Value, insensitive: bool) -> Option<Ordering> {
    if value.is_null() || bound.is_null() {
        return None;
    }
    match (insensitive, value.as_str(), bound.as_str()) {
        (true, Some(a), Some(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => value.compare(bound),
    }
}

fn text_match(value: &Value, needle: &str, insensitive: bool, test: impl Fn(&str, &str) -> bool) -> bool {
    let Some(haystack) = value.as_str() else {
        return false;
    };
    if insensitive {
        test(&haystack.to_lowercase(), &needle.to_lowercase())
    } else {
        test(haystack, needle)
    }
}
