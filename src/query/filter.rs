//! Composable filter expressions.
//!
//! A [`Filter`] is a tagged tree: combinators over sub-filters, scalar field
//! comparisons, and relation predicates that quantify over related records.
//! Filters are constructed freely and type-checked against the schema by
//! [`crate::query::analyze::analyze_filter`] before evaluation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::value::Value;

/// Filter expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Filter {
    /// All sub-filters hold. `And([])` is true.
    And(Vec<Filter>),
    /// At least one sub-filter holds. `Or([])` is false.
    Or(Vec<Filter>),
    /// None of the sub-filters hold. `Not([])` is true.
    Not(Vec<Filter>),
    /// Comparison on a scalar field.
    Field {
        /// Scalar field name.
        field: String,
        /// Operator and operand.
        op: FieldOp,
        /// String matching mode.
        #[serde(default)]
        mode: QueryMode,
    },
    /// Predicate over the records reachable through a relation.
    Relation {
        /// Relation field name.
        relation: String,
        /// Quantifier and nested filter.
        predicate: RelationPredicate,
    },
}

/// Leaf comparison operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldOp {
    /// Equality; `Equals(Null)` means IS NULL.
    Equals(Value),
    /// Inequality; `Not(Null)` means IS NOT NULL. True for a null field.
    Not(Value),
    /// Strictly less than.
    Lt(Value),
    /// Less than or equal.
    Lte(Value),
    /// Strictly greater than.
    Gt(Value),
    /// Greater than or equal.
    Gte(Value),
    /// Member of the set. False for an empty set.
    In(Vec<Value>),
    /// Not a member of the set. True for an empty set or a null field.
    NotIn(Vec<Value>),
    /// Substring match.
    Contains(String),
    /// Prefix match.
    StartsWith(String),
    /// Suffix match.
    EndsWith(String),
    /// Field is null.
    IsNull,
    /// Field is not null.
    IsNotNull,
    /// List field contains the element.
    Has(Value),
    /// List field contains every element.
    HasEvery(Vec<Value>),
    /// List field contains at least one element.
    HasSome(Vec<Value>),
    /// List field is (or is not) empty. A null list counts as empty.
    IsEmpty(bool),
}

impl FieldOp {
    /// Operator name used in diagnostics and explain output.
    pub fn name(&self) -> &'static str {
        match self {
            FieldOp::Equals(_) => "equals",
            FieldOp::Not(_) => "not",
            FieldOp::Lt(_) => "lt",
            FieldOp::Lte(_) => "lte",
            FieldOp::Gt(_) => "gt",
            FieldOp::Gte(_) => "gte",
            FieldOp::In(_) => "in",
            FieldOp::NotIn(_) => "notIn",
            FieldOp::Contains(_) => "contains",
            FieldOp::StartsWith(_) => "startsWith",
            FieldOp::EndsWith(_) => "endsWith",
            FieldOp::IsNull => "isNull",
            FieldOp::IsNotNull => "isNotNull",
            FieldOp::Has(_) => "has",
            FieldOp::HasEvery(_) => "hasEvery",
            FieldOp::HasSome(_) => "hasSome",
            FieldOp::IsEmpty(_) => "isEmpty",
        }
    }
}

/// String comparison mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryMode {
    /// Exact, case-sensitive.
    #[default]
    Default,
    /// Case-insensitive.
    Insensitive,
}

/// Quantifier applied to the related records of a relation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationPredicate {
    /// At least one related record matches (to-many).
    Some(Box<Filter>),
    /// Every related record matches; vacuously true (to-many).
    Every(Box<Filter>),
    /// No related record matches (to-many).
    None(Box<Filter>),
    /// The related record exists and matches; `Is(None)` means no related
    /// record (to-one).
    Is(Option<Box<Filter>>),
    /// Negation of `Is` (to-one).
    IsNot(Option<Box<Filter>>),
}

impl RelationPredicate {
    /// Quantifier name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RelationPredicate::Some(_) => "some",
            RelationPredicate::Every(_) => "every",
            RelationPredicate::None(_) => "none",
            RelationPredicate::Is(_) => "is",
            RelationPredicate::IsNot(_) => "isNot",
        }
    }

    /// Whether the quantifier ranges over a to-many relation.
    pub fn is_to_many(&self) -> bool {
        matches!(
            self,
            RelationPredicate::Some(_) | RelationPredicate::Every(_) | RelationPredicate::None(_)
        )
    }
}

impl Filter {
    /// The filter that matches everything.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    /// Conjunction.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    /// Disjunction.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Negated disjunction.
    pub fn not(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Not(filters.into_iter().collect())
    }

    /// Comparison leaf.
    pub fn field(field: impl Into<String>, op: FieldOp) -> Self {
        Filter::Field {
            field: field.into(),
            op,
            mode: QueryMode::Default,
        }
    }

    /// `field == value`.
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Equals(value.into()))
    }

    /// `field != value`.
    pub fn not_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Not(value.into()))
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Lt(value.into()))
    }

    /// `field <= value`.
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Lte(value.into()))
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Gt(value.into()))
    }

    /// `field >= value`.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Gte(value.into()))
    }

    /// Set membership.
    pub fn in_list<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::field(field, FieldOp::In(values.into_iter().map(Into::into).collect()))
    }

    /// Set exclusion.
    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::field(field, FieldOp::NotIn(values.into_iter().map(Into::into).collect()))
    }

    /// Substring match.
    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::field(field, FieldOp::Contains(needle.into()))
    }

    /// Prefix match.
    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::field(field, FieldOp::StartsWith(prefix.into()))
    }

    /// Suffix match.
    pub fn ends_with(field: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::field(field, FieldOp::EndsWith(suffix.into()))
    }

    /// IS NULL.
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::field(field, FieldOp::IsNull)
    }

    /// IS NOT NULL.
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::field(field, FieldOp::IsNotNull)
    }

    /// List contains `value`.
    pub fn has(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Has(value.into()))
    }

    /// Switches a comparison leaf to case-insensitive matching. Other nodes
    /// are returned unchanged.
    pub fn insensitive(mut self) -> Self {
        if let Filter::Field { mode, .. } = &mut self {
            *mode = QueryMode::Insensitive;
        }
        self
    }

    /// Relation predicate leaf.
    pub fn relation(relation: impl Into<String>, predicate: RelationPredicate) -> Self {
        Filter::Relation {
            relation: relation.into(),
            predicate,
        }
    }

    /// Some related record matches.
    pub fn some(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationPredicate::Some(Box::new(filter)))
    }

    /// Every related record matches.
    pub fn every(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationPredicate::Every(Box::new(filter)))
    }

    /// No related record matches.
    pub fn none(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationPredicate::None(Box::new(filter)))
    }

    /// The related record exists and matches.
    pub fn is(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationPredicate::Is(Some(Box::new(filter))))
    }

    /// No related record exists.
    pub fn is_absent(relation: impl Into<String>) -> Self {
        Self::relation(relation, RelationPredicate::Is(None))
    }

    /// Negation of [`Filter::is`].
    pub fn is_not(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationPredicate::IsNot(Some(Box::new(filter))))
    }

    /// Nesting depth; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Filter::And(children) | Filter::Or(children) | Filter::Not(children) => {
                1 + children.iter().map(Filter::depth).max().unwrap_or(0)
            }
            Filter::Field { .. } => 1,
            Filter::Relation { predicate, .. } => match predicate {
                RelationPredicate::Some(inner)
                | RelationPredicate::Every(inner)
                | RelationPredicate::None(inner)
                | RelationPredicate::Is(Some(inner))
                | RelationPredicate::IsNot(Some(inner)) => 1 + inner.depth(),
                RelationPredicate::Is(None) | RelationPredicate::IsNot(None) => 1,
            },
        }
    }

    /// Whether evaluating the filter needs related records.
    pub fn touches_relations(&self) -> bool {
        match self {
            Filter::And(children) | Filter::Or(children) | Filter::Not(children) => {
                children.iter().any(Filter::touches_relations)
            }
            Filter::Field { .. } => false,
            Filter::Relation { .. } => true,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, children: &[Filter]) -> fmt::Result {
            write!(f, "{name}(")?;
            for (idx, child) in children.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{child}")?;
            }
            write!(f, ")")
        }
        match self {
            Filter::And(children) => list(f, "and", children),
            Filter::Or(children) => list(f, "or", children),
            Filter::Not(children) => list(f, "not", children),
            Filter::Field { field, op, mode } => {
                let suffix = if *mode == QueryMode::Insensitive { " (i)" } else { "" };
                match op {
                    FieldOp::IsNull | FieldOp::IsNotNull => write!(f, "{field} {}", op.name()),
                    FieldOp::Equals(v) | FieldOp::Not(v) | FieldOp::Lt(v) | FieldOp::Lte(v)
                    | FieldOp::Gt(v) | FieldOp::Gte(v) | FieldOp::Has(v) => {
                        write!(f, "{field} {} {v}{suffix}", op.name())
                    }
                    FieldOp::In(vs) | FieldOp::NotIn(vs) | FieldOp::HasEvery(vs) | FieldOp::HasSome(vs) => {
                        write!(f, "{field} {} {}{suffix}", op.name(), Value::List(vs.clone()))
                    }
                    FieldOp::Contains(s) | FieldOp::StartsWith(s) | FieldOp::EndsWith(s) => {
                        write!(f, "{field} {} {s:?}{suffix}", op.name())
                    }
                    FieldOp::IsEmpty(flag) => write!(f, "{field} isEmpty {flag}"),
                }
            }
            Filter::Relation {
                relation,
                predicate,
            } => match predicate {
                RelationPredicate::Some(inner)
                | RelationPredicate::Every(inner)
                | RelationPredicate::None(inner)
                | RelationPredicate::Is(Some(inner))
                | RelationPredicate::IsNot(Some(inner)) => {
                    write!(f, "{} {relation}({inner})", predicate.name())
                }
                RelationPredicate::Is(None) => write!(f, "{relation} is null"),
                RelationPredicate::IsNot(None) => write!(f, "{relation} is not null"),
            },
        }
    }
}
