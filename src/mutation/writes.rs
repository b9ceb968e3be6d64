//! Write payloads: per-field operations and relation rewiring.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::ast::UniqueWhere;
use crate::query::executor::Row;
use crate::query::value::Value;

/// Operation applied to one scalar field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldWrite {
    /// Replaces the value.
    Set(Value),
    /// Adds to a numeric field.
    Increment(Value),
    /// Subtracts from a numeric field.
    Decrement(Value),
    /// Multiplies a numeric field.
    Multiply(Value),
    /// Divides a numeric field. Integer division truncates.
    Divide(Value),
    /// Appends one element, or every element of a list, to a list field.
    Push(Value),
}

impl FieldWrite {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            FieldWrite::Set(_) => "set",
            FieldWrite::Increment(_) => "increment",
            FieldWrite::Decrement(_) => "decrement",
            FieldWrite::Multiply(_) => "multiply",
            FieldWrite::Divide(_) => "divide",
            FieldWrite::Push(_) => "push",
        }
    }
}

/// Rewiring of one relation field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationWrite {
    /// Links the record found by `target`. With `replace_holder`, a record
    /// already linked through a one-to-one relation is unlinked first instead
    /// of failing the write.
    #[serde(rename_all = "camelCase")]
    Connect {
        /// Unique lookup of the record to link.
        target: UniqueWhere,
        /// Unlink the prior holder of a one-to-one relation.
        #[serde(default)]
        replace_holder: bool,
    },
    /// Unlinks the related record of a to-one relation.
    Disconnect,
    /// Links every listed record of a to-many relation.
    ConnectMany(Vec<UniqueWhere>),
    /// Unlinks every listed record of a to-many relation.
    DisconnectMany(Vec<UniqueWhere>),
}

/// Payload of `create`, `update` and the create/update halves of `upsert`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteData {
    /// Scalar field operations.
    pub fields: BTreeMap<String, FieldWrite>,
    /// Relation field operations.
    pub relations: BTreeMap<String, RelationWrite>,
}

impl WriteData {
    /// Empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field.
    pub fn set(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.write(field, FieldWrite::Set(value.into()))
    }

    /// Adds to a numeric field.
    pub fn increment(self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.write(field, FieldWrite::Increment(by.into()))
    }

    /// Subtracts from a numeric field.
    pub fn decrement(self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.write(field, FieldWrite::Decrement(by.into()))
    }

    /// Multiplies a numeric field.
    pub fn multiply(self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.write(field, FieldWrite::Multiply(by.into()))
    }

    /// Divides a numeric field.
    pub fn divide(self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.write(field, FieldWrite::Divide(by.into()))
    }

    /// Appends to a list field.
    pub fn push(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.write(field, FieldWrite::Push(value.into()))
    }

    /// Adds an arbitrary field operation.
    pub fn write(mut self, field: impl Into<String>, write: FieldWrite) -> Self {
        self.fields.insert(field.into(), write);
        self
    }

    /// Links a related record.
    pub fn connect(self, relation: impl Into<String>, target: UniqueWhere) -> Self {
        self.relate(
            relation,
            RelationWrite::Connect {
                target,
                replace_holder: false,
            },
        )
    }

    /// Links a related record through a one-to-one relation, unlinking
    /// whichever record held it before.
    pub fn connect_replacing(self, relation: impl Into<String>, target: UniqueWhere) -> Self {
        self.relate(
            relation,
            RelationWrite::Connect {
                target,
                replace_holder: true,
            },
        )
    }

    /// Unlinks a to-one relation.
    pub fn disconnect(self, relation: impl Into<String>) -> Self {
        self.relate(relation, RelationWrite::Disconnect)
    }

    /// Links several records of a to-many relation.
    pub fn connect_many(self, relation: impl Into<String>, targets: Vec<UniqueWhere>) -> Self {
        self.relate(relation, RelationWrite::ConnectMany(targets))
    }

    /// Unlinks several records of a to-many relation.
    pub fn disconnect_many(self, relation: impl Into<String>, targets: Vec<UniqueWhere>) -> Self {
        self.relate(relation, RelationWrite::DisconnectMany(targets))
    }

    /// Adds an arbitrary relation operation.
    pub fn relate(mut self, relation: impl Into<String>, write: RelationWrite) -> Self {
        self.relations.insert(relation.into(), write);
        self
    }

    /// Whether the payload only sets scalars.
    pub fn is_plain(&self) -> bool {
        self.relations.is_empty() && self.fields.values().all(|w| matches!(w, FieldWrite::Set(_)))
    }
}

impl From<Row> for WriteData {
    /// Sets every field of `row`.
    fn from(row: Row) -> Self {
        Self {
            fields: row
                .into_iter()
                .map(|(field, value)| (field, FieldWrite::Set(value)))
                .collect(),
            relations: BTreeMap::new(),
        }
    }
}

/// Which half of an upsert ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertBranch {
    /// No record matched; the create payload was inserted.
    Created,
    /// A record matched and was updated.
    Updated,
}

/// Result of an upsert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Upserted {
    /// Projected row after the write.
    pub row: Row,
    /// Branch taken.
    pub branch: UpsertBranch,
}
