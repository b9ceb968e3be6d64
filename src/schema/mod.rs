#![forbid(unsafe_code)]

//! Record type definitions and the finalized, read-only [`Schema`].
//!
//! Types are described with the builder-style constructors on [`RecordType`],
//! [`ScalarField`] and [`RelationSpec`], registered through
//! [`SchemaRegistry`], and frozen into an `Arc<Schema>` by
//! [`SchemaRegistry::finalize`]. After that point the schema is shared
//! read-only by every request.

mod registry;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::query::value::{parse_datetime, Value};

pub use registry::SchemaRegistry;

/// Primitive kind of a scalar field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScalarKind {
    /// UTF-8 text.
    String,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
    /// UTC timestamp with millisecond precision.
    DateTime,
    /// Free-form JSON document.
    Json,
    /// Variant of the named enum.
    Enum(String),
}

impl ScalarKind {
    /// Whether `lt`/`gt` style comparisons are meaningful for this kind.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            ScalarKind::String | ScalarKind::Int | ScalarKind::Float | ScalarKind::DateTime
        )
    }

    /// Whether sum/avg apply.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ScalarKind::Int | ScalarKind::Float)
    }

    /// Whether min/max apply.
    pub fn is_min_max(&self) -> bool {
        !matches!(self, ScalarKind::Json)
    }

    /// Diagnostic name.
    pub fn describe(&self) -> String {
        match self {
            ScalarKind::String => "string".into(),
            ScalarKind::Int => "int".into(),
            ScalarKind::Float => "float".into(),
            ScalarKind::Bool => "bool".into(),
            ScalarKind::DateTime => "datetime".into(),
            ScalarKind::Json => "json".into(),
            ScalarKind::Enum(name) => format!("enum {name}"),
        }
    }
}

/// Value generated for a field omitted from a create payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldDefault {
    /// Fixed literal.
    Literal(Value),
    /// Next value of a per-field sequence.
    AutoIncrement,
    /// Current timestamp.
    Now,
    /// Random collision-resistant identifier.
    Cuid,
}

/// Scalar field declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarField {
    /// Field name.
    pub name: String,
    /// Primitive kind of the field (or of its elements for lists).
    pub kind: ScalarKind,
    /// Whether null is a legal value.
    #[serde(default)]
    pub nullable: bool,
    /// Whether the field holds a list of `kind`.
    #[serde(default)]
    pub list: bool,
    /// Generated value when a create omits the field.
    #[serde(default)]
    pub default: Option<FieldDefault>,
    /// Set to the current time on every update.
    #[serde(default)]
    pub updated_at: bool,
}

impl ScalarField {
    /// Required field of the given kind.
    pub fn new(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            list: false,
            default: None,
            updated_at: false,
        }
    }

    /// Required string field.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ScalarKind::String)
    }

    /// Required int field.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ScalarKind::Int)
    }

    /// Required float field.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ScalarKind::Float)
    }

    /// Required bool field.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ScalarKind::Bool)
    }

    /// Required datetime field.
    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, ScalarKind::DateTime)
    }

    /// Required JSON field.
    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ScalarKind::Json)
    }

    /// Required field holding a variant of `enum_name`.
    pub fn enumeration(name: impl Into<String>, enum_name: impl Into<String>) -> Self {
        Self::new(name, ScalarKind::Enum(enum_name.into()))
    }

    /// Marks the field nullable.
    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks the field as a list of its kind.
    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    /// Sets the create-time default.
    pub fn default_to(mut self, default: FieldDefault) -> Self {
        self.default = Some(default);
        self
    }

    /// Literal default shorthand.
    pub fn default_value(self, value: impl Into<Value>) -> Self {
        self.default_to(FieldDefault::Literal(value.into()))
    }

    /// Marks the field as an update timestamp.
    pub fn updated_at(mut self) -> Self {
        self.updated_at = true;
        self
    }

    /// Describes the declared type for diagnostics.
    pub fn describe(&self) -> String {
        let base = self.kind.describe();
        match (self.list, self.nullable) {
            (true, _) => format!("list of {base}"),
            (false, true) => format!("{base} or null"),
            (false, false) => base,
        }
    }
}

/// Relation cardinality as seen from the declaring side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    /// At most one related record.
    One,
    /// Any number of related records.
    Many,
}

/// What happens to referencing records when the referenced record is deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferentialAction {
    /// Refuse the delete while referencing records exist.
    #[default]
    Restrict,
    /// Delete referencing records too.
    Cascade,
    /// Null out the foreign key of referencing records.
    SetNull,
}

/// How a relation is physically linked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationLink {
    /// Owning side: `fields` on this type hold the values of `references` on
    /// the target.
    ForeignKey {
        /// Local foreign-key scalar fields.
        fields: Vec<String>,
        /// Referenced (unique) fields on the target type.
        references: Vec<String>,
        /// Delete behavior for the referenced side.
        #[serde(default)]
        on_delete: ReferentialAction,
    },
    /// Non-owning side of a foreign-key relation declared on the target.
    Inverse,
    /// Many-to-many through explicit join records.
    Through {
        /// Join record type.
        join_type: String,
        /// Foreign-key relation on the join type pointing back at this type.
        near: String,
        /// Foreign-key relation on the join type pointing at the target.
        far: String,
    },
}

/// Relation field declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationField {
    /// Field name on the declaring type.
    pub name: String,
    /// Target record type.
    pub target: String,
    /// Cardinality from the declaring side.
    pub cardinality: Cardinality,
    /// Whether a to-one relation may be absent.
    pub nullable: bool,
    /// Name of the inverse field on the target, if bidirectional.
    pub inverse: Option<String>,
    /// Physical link.
    pub link: RelationLink,
}

impl RelationField {
    /// Foreign-key fields when this is the owning side.
    pub fn foreign_key(&self) -> Option<(&[String], &[String], ReferentialAction)> {
        match &self.link {
            RelationLink::ForeignKey {
                fields,
                references,
                on_delete,
            } => Some((fields, references, *on_delete)),
            _ => None,
        }
    }

    /// Whether this side owns the foreign key.
    pub fn is_owning(&self) -> bool {
        matches!(self.link, RelationLink::ForeignKey { .. })
    }
}

/// Arguments for [`SchemaRegistry::register_relation`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationSpec {
    /// Declaring record type.
    pub owner: String,
    /// Relation field definition.
    #[serde(flatten)]
    pub field: RelationField,
}

impl RelationSpec {
    /// Owning side of a foreign-key relation.
    pub fn foreign_key<F, R, S1, S2>(
        owner: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
        fields: F,
        references: R,
    ) -> Self
    where
        F: IntoIterator<Item = S1>,
        R: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            owner: owner.into(),
            field: RelationField {
                name: name.into(),
                target: target.into(),
                cardinality: Cardinality::One,
                nullable: false,
                inverse: None,
                link: RelationLink::ForeignKey {
                    fields: fields.into_iter().map(Into::into).collect(),
                    references: references.into_iter().map(Into::into).collect(),
                    on_delete: ReferentialAction::Restrict,
                },
            },
        }
    }

    /// Non-owning side of a foreign-key relation.
    pub fn inverse(
        owner: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            owner: owner.into(),
            field: RelationField {
                name: name.into(),
                target: target.into(),
                cardinality,
                nullable: cardinality == Cardinality::One,
                inverse: None,
                link: RelationLink::Inverse,
            },
        }
    }

    /// Many-to-many relation through explicit join records.
    pub fn through(
        owner: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
        join_type: impl Into<String>,
        near: impl Into<String>,
        far: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            field: RelationField {
                name: name.into(),
                target: target.into(),
                cardinality: Cardinality::Many,
                nullable: false,
                inverse: None,
                link: RelationLink::Through {
                    join_type: join_type.into(),
                    near: near.into(),
                    far: far.into(),
                },
            },
        }
    }

    /// Names the inverse field on the target type.
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.field.inverse = Some(inverse.into());
        self
    }

    /// Sets the delete behavior of an owning foreign key.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let RelationLink::ForeignKey { on_delete, .. } = &mut self.field.link {
            *on_delete = action;
        }
        self
    }
}

/// Uniqueness rule over one or more scalar fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueConstraint {
    /// Constraint name reported in violations.
    pub name: String,
    /// Constrained fields, in declaration order.
    pub fields: Vec<String>,
    /// Whether this is the record identity.
    #[serde(default)]
    pub primary: bool,
}

impl UniqueConstraint {
    /// Whether `fields` names exactly this constraint's fields, in any order.
    pub fn covers_exactly<S: AsRef<str>>(&self, fields: &[S]) -> bool {
        fields.len() == self.fields.len()
            && fields
                .iter()
                .all(|f| self.fields.iter().any(|own| own == f.as_ref()))
    }
}

/// Closed set of variants for enum-kinded fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDef {
    /// Enum name.
    pub name: String,
    /// Allowed variants.
    pub variants: Vec<String>,
}

impl EnumDef {
    /// Builds an enum definition.
    pub fn new<I, S>(name: impl Into<String>, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            variants: variants.into_iter().map(Into::into).collect(),
        }
    }
}

/// Named entity schema (scalars, relations, unique constraints).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordType {
    /// Type name.
    pub name: String,
    /// Scalar fields in declaration order.
    #[serde(default)]
    pub scalars: Vec<ScalarField>,
    /// Relation fields in declaration order.
    #[serde(default)]
    pub relations: Vec<RelationField>,
    /// Unique constraints; the primary one comes first.
    #[serde(default)]
    pub uniques: Vec<UniqueConstraint>,
}

impl RecordType {
    /// Empty record type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scalars: Vec::new(),
            relations: Vec::new(),
            uniques: Vec::new(),
        }
    }

    /// Adds the primary-key field and its constraint.
    pub fn id(mut self, field: ScalarField) -> Self {
        let constraint = UniqueConstraint {
            name: format!("{}_pkey", self.name),
            fields: vec![field.name.clone()],
            primary: true,
        };
        self.scalars.push(field);
        self.uniques.retain(|u| !u.primary);
        self.uniques.insert(0, constraint);
        self
    }

    /// Adds a scalar field.
    pub fn field(mut self, field: ScalarField) -> Self {
        self.scalars.push(field);
        self
    }

    /// Adds a scalar field with a single-field unique constraint.
    pub fn unique_field(mut self, field: ScalarField) -> Self {
        let name = field.name.clone();
        self.scalars.push(field);
        self.uniques.push(UniqueConstraint {
            name: unique_constraint_name(&self.name, [name.as_str()]),
            fields: vec![name],
            primary: false,
        });
        self
    }

    /// Looks up a scalar field.
    pub fn scalar(&self, name: &str) -> Option<&ScalarField> {
        self.scalars.iter().find(|f| f.name == name)
    }

    /// Looks up a relation field.
    pub fn relation(&self, name: &str) -> Option<&RelationField> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Scalar field or an [`EngineError::InvalidField`].
    pub fn require_scalar(&self, name: &str, context: &'static str) -> Result<&ScalarField> {
        self.scalar(name)
            .ok_or_else(|| EngineError::invalid_field(&self.name, name, context))
    }

    /// Relation field or an [`EngineError::RelationNotLoadable`].
    pub fn require_relation(&self, name: &str) -> Result<&RelationField> {
        self.relation(name)
            .ok_or_else(|| EngineError::relation_not_loadable(&self.name, name))
    }

    /// The primary unique constraint.
    pub fn primary(&self) -> &UniqueConstraint {
        // finalize() guarantees a primary constraint at index 0
        &self.uniques[0]
    }

    /// Unique constraint whose fields are exactly `fields`.
    pub fn unique_for<S: AsRef<str>>(&self, fields: &[S]) -> Option<&UniqueConstraint> {
        self.uniques.iter().find(|u| u.covers_exactly(fields))
    }

    /// Whether `fields` contains every field of some unique constraint.
    pub fn is_unique_superset<S: AsRef<str>>(&self, fields: &[S]) -> bool {
        self.uniques.iter().any(|u| {
            u.fields
                .iter()
                .all(|own| fields.iter().any(|f| f.as_ref() == own))
        })
    }
}

/// Conventional name for a non-primary unique constraint.
pub fn unique_constraint_name<'a>(record_type: &str, fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut name = record_type.to_owned();
    for field in fields {
        name.push('_');
        name.push_str(field);
    }
    name.push_str("_key");
    name
}

/// Finalized, immutable schema.
#[derive(Debug)]
pub struct Schema {
    types: Vec<RecordType>,
    by_name: HashMap<String, usize>,
    enums: HashMap<String, EnumDef>,
}

impl Schema {
    /// Looks up a record type by name.
    pub fn record_type(&self, name: &str) -> Result<&RecordType> {
        self.by_name
            .get(name)
            .map(|idx| &self.types[*idx])
            .ok_or_else(|| EngineError::UnknownRecordType {
                name: name.to_owned(),
            })
    }

    /// All record types in registration order.
    pub fn record_types(&self) -> impl Iterator<Item = &RecordType> {
        self.types.iter()
    }

    /// Looks up an enum definition.
    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }

    /// Foreign-key relations (on any type) that target `record_type`, as
    /// `(referencing type, relation)` pairs.
    pub fn referencing_relations<'a>(
        &'a self,
        record_type: &'a str,
    ) -> impl Iterator<Item = (&'a RecordType, &'a RelationField)> + 'a {
        self.types.iter().flat_map(move |ty| {
            ty.relations
                .iter()
                .filter(move |rel| rel.is_owning() && rel.target == record_type)
                .map(move |rel| (ty, rel))
        })
    }

    /// Resolves the foreign-key relation on the target that backs an inverse
    /// relation.
    pub fn backing_foreign_key<'a>(
        &'a self,
        owner: &RecordType,
        relation: &RelationField,
    ) -> Result<&'a RelationField> {
        let target = self.record_type(&relation.target)?;
        relation
            .inverse
            .as_deref()
            .and_then(|inverse| target.relation(inverse))
            .filter(|fk| fk.is_owning())
            .ok_or_else(|| EngineError::relation_not_loadable(&owner.name, &relation.name))
    }

    /// Coerces and type-checks a value for a scalar field. Strings become
    /// enum variants or datetimes where the field kind calls for it.
    pub fn coerce(&self, record_type: &str, field: &ScalarField, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        if field.list {
            return match value {
                Value::List(items) => items
                    .into_iter()
                    .map(|item| self.coerce_element(record_type, field, item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::List),
                other => Err(mismatch(record_type, field, &other)),
            };
        }
        self.coerce_element(record_type, field, value)
    }

    /// Coerces a single element (ignoring list-ness) for `field`.
    pub fn coerce_element(&self, record_type: &str, field: &ScalarField, value: Value) -> Result<Value> {
        let coerced = match (&field.kind, value) {
            (_, Value::Null) => Some(Value::Null),
            (ScalarKind::String, Value::String(s)) => Some(Value::String(s)),
            (ScalarKind::Int, Value::Int(v)) => Some(Value::Int(v)),
            (ScalarKind::Float, Value::Float(v)) => Some(Value::Float(v)),
            (ScalarKind::Float, Value::Int(v)) => Some(Value::Float(v as f64)),
            (ScalarKind::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
            (ScalarKind::DateTime, Value::DateTime(ms)) => Some(Value::DateTime(ms)),
            (ScalarKind::DateTime, Value::String(raw)) => parse_datetime(&raw).map(Value::DateTime),
            (ScalarKind::Json, Value::Object(_)) => None,
            (ScalarKind::Json, Value::Json(doc)) => Some(Value::Json(doc)),
            (ScalarKind::Json, other) => serde_json::to_value(&other).ok().map(Value::Json),
            (ScalarKind::Enum(name), Value::Enum(v) | Value::String(v)) => self
                .enums
                .get(name)
                .filter(|def| def.variants.iter().any(|known| known == &v))
                .map(|_| Value::Enum(v)),
            (_, other) => return Err(mismatch(record_type, field, &other)),
        };
        coerced.ok_or_else(|| EngineError::TypeMismatch {
            record_type: record_type.to_owned(),
            field: field.name.clone(),
            expected: field.kind.describe(),
            found: "incompatible literal".into(),
        })
    }
}

fn mismatch(record_type: &str, field: &ScalarField, value: &Value) -> EngineError {
    EngineError::TypeMismatch {
        record_type: record_type.to_owned(),
        field: field.name.clone(),
        expected: field.describe(),
        found: value.kind_name().to_owned(),
    }
}
