//! Read request arguments: ordering, pagination, projection.
//!
//! These structures mirror what a generated per-type client passes to the
//! engine. They carry no schema knowledge; the planner validates them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::filter::Filter;
use crate::query::value::Value;

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Placement of null values in an ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NullsOrder {
    /// Nulls before every value.
    First,
    /// Nulls after every value.
    Last,
}

/// One ordering key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    /// Scalar field to sort by.
    pub field: String,
    /// Direction.
    #[serde(default)]
    pub direction: SortOrder,
    /// Null placement. Defaults to nulls-smallest: first ascending, last
    /// descending.
    #[serde(default)]
    pub nulls: Option<NullsOrder>,
}

impl OrderBy {
    /// Ascending key.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortOrder::Asc,
            nulls: None,
        }
    }

    /// Descending key.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortOrder::Desc,
            nulls: None,
        }
    }

    /// Explicit null placement.
    pub fn nulls(mut self, nulls: NullsOrder) -> Self {
        self.nulls = Some(nulls);
        self
    }

    /// Effective null placement.
    pub fn nulls_order(&self) -> NullsOrder {
        self.nulls.unwrap_or(match self.direction {
            SortOrder::Asc => NullsOrder::First,
            SortOrder::Desc => NullsOrder::Last,
        })
    }
}

/// Pagination anchor: values for every field of one unique constraint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor(pub BTreeMap<String, Value>);

impl Cursor {
    /// Cursor on a single-field unique constraint.
    pub fn by(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(field.into(), value.into());
        Self(values)
    }

    /// Adds another field of a compound constraint.
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Constrained field names.
    pub fn fields(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Values for every field of one unique constraint, identifying at most one
/// record. Used by `find_unique`, `update`, `delete`, `upsert` and relation
/// `connect`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UniqueWhere(pub BTreeMap<String, Value>);

impl UniqueWhere {
    /// Lookup on a single-field constraint.
    pub fn by(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(field.into(), value.into());
        Self(values)
    }

    /// Adds another field of a compound constraint.
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }
}

/// Which fields and relations a result row carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Projection {
    /// Scalar fields to return. Empty means all (minus `omit`).
    pub select: Vec<String>,
    /// Scalar fields to leave out. Exclusive with `select`.
    pub omit: Vec<String>,
    /// Relations to load, each with its own nested query.
    pub include: BTreeMap<String, FindArgs>,
    /// To-many relations whose related-record count is returned under
    /// `_count`, optionally filtered.
    pub count: BTreeMap<String, Option<Filter>>,
}

impl Projection {
    /// Whether the projection returns every scalar and nothing else.
    pub fn is_default(&self) -> bool {
        self.select.is_empty() && self.omit.is_empty() && self.include.is_empty() && self.count.is_empty()
    }
}

/// Arguments of `find_many` and friends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindArgs {
    /// Record filter.
    #[serde(rename = "where")]
    pub filter: Option<Filter>,
    /// Ordering keys, most significant first.
    pub order_by: Vec<OrderBy>,
    /// Pagination anchor.
    pub cursor: Option<Cursor>,
    /// Records skipped after the anchor.
    pub skip: Option<usize>,
    /// Signed page size: positive reads forward, negative backward.
    pub take: Option<i64>,
    /// Keep only the first record per distinct tuple of these fields.
    pub distinct: Vec<String>,
    /// Returned fields and relations.
    #[serde(flatten)]
    pub projection: Projection,
}

impl FindArgs {
    /// Unfiltered, unordered, full projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Appends an ordering key.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Sets the pagination anchor.
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
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

    /// Sets the distinct key.
    pub fn distinct<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distinct = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts returned scalars.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection.select = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Drops returned scalars.
    pub fn omit<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection.omit = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Loads a relation with a nested query.
    pub fn include(mut self, relation: impl Into<String>, nested: FindArgs) -> Self {
        self.projection.include.insert(relation.into(), nested);
        self
    }

    /// Returns the number of related records under `_count`.
    pub fn count_relation(mut self, relation: impl Into<String>, filter: Option<Filter>) -> Self {
        self.projection.count.insert(relation.into(), filter);
        self
    }

    /// Whether any window argument (filter, order, cursor, skip, take,
    /// distinct) is set.
    pub fn has_window(&self) -> bool {
        self.filter.is_some()
            || !self.order_by.is_empty()
            || self.cursor.is_some()
            || self.skip.is_some()
            || self.take.is_some()
            || !self.distinct.is_empty()
    }
}
