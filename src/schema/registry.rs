use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, Result, SchemaError};

use super::{
    unique_constraint_name, Cardinality, EnumDef, FieldDefault, RecordType, ReferentialAction,
    RelationLink, RelationSpec, ScalarKind, Schema, UniqueConstraint,
};

/// Mutable builder for a [`Schema`].
///
/// Registration performs the checks that only need the declaring type; every
/// check that spans types (targets, inverses, foreign-key shapes) runs in
/// [`SchemaRegistry::finalize`] so types may be registered in any order.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    types: Vec<RecordType>,
    enums: Vec<EnumDef>,
    frozen: bool,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`SchemaRegistry::finalize`] has succeeded.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn ensure_open(&self) -> std::result::Result<(), SchemaError> {
        if self.frozen {
            Err(SchemaError::Frozen)
        } else {
            Ok(())
        }
    }

    fn type_mut(&mut self, name: &str, context: &str) -> std::result::Result<&mut RecordType, SchemaError> {
        self.types
            .iter_mut()
            .find(|ty| ty.name == name)
            .ok_or_else(|| SchemaError::UnknownType {
                name: name.to_owned(),
                context: context.to_owned(),
            })
    }

    /// Registers a closed enum.
    pub fn register_enum(&mut self, def: EnumDef) -> Result<()> {
        self.ensure_open()?;
        if self.enums.iter().any(|existing| existing.name == def.name) {
            return Err(SchemaError::DuplicateEnum { name: def.name }.into());
        }
        self.enums.push(def);
        Ok(())
    }

    /// Registers a record type with its scalar fields and constraints.
    pub fn register_type(&mut self, record_type: RecordType) -> Result<()> {
        self.ensure_open()?;
        if self.types.iter().any(|ty| ty.name == record_type.name) {
            return Err(SchemaError::DuplicateType {
                name: record_type.name,
            }
            .into());
        }
        let mut seen: Vec<&str> = Vec::new();
        let names = record_type
            .scalars
            .iter()
            .map(|f| f.name.as_str())
            .chain(record_type.relations.iter().map(|r| r.name.as_str()));
        for name in names {
            if seen.contains(&name) {
                return Err(SchemaError::DuplicateField {
                    record_type: record_type.name.clone(),
                    field: name.to_owned(),
                }
                .into());
            }
            seen.push(name);
        }
        debug!(
            record_type = %record_type.name,
            scalars = record_type.scalars.len(),
            "schema.register_type"
        );
        self.types.push(record_type);
        Ok(())
    }

    /// Adds a relation field to an already registered type.
    pub fn register_relation(&mut self, spec: RelationSpec) -> Result<()> {
        self.ensure_open()?;
        let context = format!("relation '{}.{}'", spec.owner, spec.field.name);
        let owner = self.type_mut(&spec.owner, &context)?;
        if owner.scalar(&spec.field.name).is_some() || owner.relation(&spec.field.name).is_some() {
            return Err(SchemaError::DuplicateField {
                record_type: spec.owner,
                field: spec.field.name,
            }
            .into());
        }
        owner.relations.push(spec.field);
        Ok(())
    }

    /// Adds a (possibly compound) unique constraint and returns its name.
    pub fn register_unique<I, S>(&mut self, record_type: &str, fields: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let context = format!("unique constraint on '{record_type}'");
        let owner = self.type_mut(record_type, &context)?;
        if fields.is_empty() {
            return Err(SchemaError::InvalidRelation {
                record_type: record_type.to_owned(),
                relation: "<unique>".into(),
                reason: "a unique constraint needs at least one field".into(),
            }
            .into());
        }
        for field in &fields {
            if owner.scalar(field).is_none() {
                return Err(SchemaError::UnknownField {
                    record_type: record_type.to_owned(),
                    field: field.clone(),
                    context: context.clone(),
                }
                .into());
            }
        }
        let name = unique_constraint_name(record_type, fields.iter().map(String::as_str));
        if owner.unique_for(&fields).is_none() {
            owner.uniques.push(UniqueConstraint {
                name: name.clone(),
                fields,
                primary: false,
            });
        }
        Ok(name)
    }

    /// Validates every cross-type rule and freezes the registry.
    ///
    /// On failure the registry stays open so the caller can inspect it; on
    /// success every later registration fails with [`SchemaError::Frozen`].
    pub fn finalize(&mut self) -> Result<Arc<Schema>> {
        self.ensure_open()?;
        let mut types = self.types.clone();
        for ty in &mut types {
            // primary constraint first
            ty.uniques.sort_by_key(|u| !u.primary);
        }
        let by_name = types
            .iter()
            .enumerate()
            .map(|(idx, ty)| (ty.name.clone(), idx))
            .collect();
        let enums = self
            .enums
            .iter()
            .map(|def| (def.name.clone(), def.clone()))
            .collect();
        let mut schema = Schema {
            types,
            by_name,
            enums,
        };

        validate_scalars(&schema)?;
        validate_relations(&schema)?;
        link_inverses(&mut schema);

        self.frozen = true;
        debug!(
            types = schema.types.len(),
            enums = schema.enums.len(),
            "schema.finalize"
        );
        Ok(Arc::new(schema))
    }
}

fn validate_scalars(schema: &Schema) -> std::result::Result<(), EngineError> {
    for ty in &schema.types {
        let primaries = ty.uniques.iter().filter(|u| u.primary).count();
        if primaries != 1 {
            return Err(SchemaError::MissingPrimaryKey {
                record_type: ty.name.clone(),
            }
            .into());
        }
        for unique in &ty.uniques {
            if let Some(missing) = unique.fields.iter().find(|f| ty.scalar(f).is_none()) {
                return Err(SchemaError::UnknownField {
                    record_type: ty.name.clone(),
                    field: missing.clone(),
                    context: format!("unique constraint '{}'", unique.name),
                }
                .into());
            }
        }
        for field in &ty.scalars {
            if let ScalarKind::Enum(name) = &field.kind {
                if schema.enum_def(name).is_none() {
                    return Err(SchemaError::UnknownEnum {
                        record_type: ty.name.clone(),
                        field: field.name.clone(),
                        name: name.clone(),
                    }
                    .into());
                }
            }
            let invalid = |reason: &str| SchemaError::InvalidDefault {
                record_type: ty.name.clone(),
                field: field.name.clone(),
                reason: reason.to_owned(),
            };
            if field.updated_at && (field.kind != ScalarKind::DateTime || field.list) {
                return Err(invalid("updatedAt fields must be scalar datetimes").into());
            }
            match &field.default {
                None => {}
                Some(FieldDefault::Literal(value)) => {
                    schema
                        .coerce(&ty.name, field, value.clone())
                        .map_err(|err| invalid(&err.to_string()))?;
                }
                Some(_) if field.list => {
                    return Err(invalid("list fields only take literal defaults").into());
                }
                Some(FieldDefault::AutoIncrement) if field.kind != ScalarKind::Int => {
                    return Err(invalid("autoincrement requires an int field").into());
                }
                Some(FieldDefault::Now) if field.kind != ScalarKind::DateTime => {
                    return Err(invalid("now() requires a datetime field").into());
                }
                Some(FieldDefault::Cuid) if field.kind != ScalarKind::String => {
                    return Err(invalid("cuid() requires a string field").into());
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn validate_relations(schema: &Schema) -> std::result::Result<(), EngineError> {
    let mut claims: HashMap<(String, String), String> = HashMap::new();
    for ty in &schema.types {
        for rel in &ty.relations {
            let qualified = format!("{}.{}", ty.name, rel.name);
            let invalid = |reason: String| SchemaError::InvalidRelation {
                record_type: ty.name.clone(),
                relation: rel.name.clone(),
                reason,
            };
            let target = schema.record_type(&rel.target).map_err(|_| SchemaError::UnknownType {
                name: rel.target.clone(),
                context: format!("relation '{qualified}'"),
            })?;

            match &rel.link {
                RelationLink::ForeignKey {
                    fields,
                    references,
                    on_delete,
                } => {
                    if rel.cardinality != Cardinality::One {
                        return Err(invalid("the owning side of a foreign key is to-one".into()).into());
                    }
                    if fields.is_empty() || fields.len() != references.len() {
                        return Err(invalid(format!(
                            "{} foreign key fields for {} referenced fields",
                            fields.len(),
                            references.len()
                        ))
                        .into());
                    }
                    for (local, remote) in fields.iter().zip(references) {
                        let local_field = ty.scalar(local).ok_or_else(|| SchemaError::UnknownField {
                            record_type: ty.name.clone(),
                            field: local.clone(),
                            context: format!("relation '{qualified}'"),
                        })?;
                        let remote_field =
                            target.scalar(remote).ok_or_else(|| SchemaError::UnknownField {
                                record_type: target.name.clone(),
                                field: remote.clone(),
                                context: format!("relation '{qualified}'"),
                            })?;
                        if local_field.kind != remote_field.kind || local_field.list || remote_field.list {
                            return Err(invalid(format!(
                                "'{}' is {} but references {}",
                                local,
                                local_field.describe(),
                                remote_field.describe()
                            ))
                            .into());
                        }
                        if *on_delete == ReferentialAction::SetNull && !local_field.nullable {
                            return Err(invalid(format!(
                                "onDelete SetNull requires '{local}' to be nullable"
                            ))
                            .into());
                        }
                    }
                    if target.unique_for(references).is_none() {
                        return Err(invalid(format!(
                            "referenced fields {:?} are not a unique constraint of '{}'",
                            references, target.name
                        ))
                        .into());
                    }
                    if let Some(inverse) = &rel.inverse {
                        let other = target.relation(inverse).ok_or_else(|| SchemaError::MissingInverse {
                            record_type: ty.name.clone(),
                            relation: rel.name.clone(),
                            target: target.name.clone(),
                            inverse: inverse.clone(),
                        })?;
                        let mismatch = |reason: &str| SchemaError::InverseMismatch {
                            record_type: ty.name.clone(),
                            relation: rel.name.clone(),
                            target: target.name.clone(),
                            inverse: inverse.clone(),
                            reason: reason.to_owned(),
                        };
                        if other.link != RelationLink::Inverse || other.target != ty.name {
                            return Err(mismatch("inverse must be the non-owning side pointing back").into());
                        }
                        if other.inverse.as_deref().is_some_and(|back| back != rel.name) {
                            return Err(mismatch("inverse names a different relation").into());
                        }
                    }
                }
                RelationLink::Inverse => {
                    let inverse = rel.inverse.as_ref().ok_or_else(|| {
                        invalid("the non-owning side must name its foreign-key relation".into())
                    })?;
                    let other = target.relation(inverse).ok_or_else(|| SchemaError::MissingInverse {
                        record_type: ty.name.clone(),
                        relation: rel.name.clone(),
                        target: target.name.clone(),
                        inverse: inverse.clone(),
                    })?;
                    let mismatch = |reason: &str| SchemaError::InverseMismatch {
                        record_type: ty.name.clone(),
                        relation: rel.name.clone(),
                        target: target.name.clone(),
                        inverse: inverse.clone(),
                        reason: reason.to_owned(),
                    };
                    let Some((fields, _, _)) = other.foreign_key() else {
                        return Err(mismatch("both sides are non-owning").into());
                    };
                    if other.target != ty.name {
                        return Err(mismatch("inverse points at a different type").into());
                    }
                    if other.inverse.as_deref().is_some_and(|back| back != rel.name) {
                        return Err(mismatch("inverse names a different relation").into());
                    }
                    if rel.cardinality == Cardinality::One && !target.is_unique_superset(fields) {
                        return Err(mismatch("a to-one inverse requires unique foreign key fields").into());
                    }
                }
                RelationLink::Through {
                    join_type,
                    near,
                    far,
                } => {
                    let join = schema.record_type(join_type).map_err(|_| SchemaError::UnknownType {
                        name: join_type.clone(),
                        context: format!("relation '{qualified}'"),
                    })?;
                    let near_ok = join
                        .relation(near)
                        .is_some_and(|r| r.is_owning() && r.target == ty.name);
                    let far_ok = join
                        .relation(far)
                        .is_some_and(|r| r.is_owning() && r.target == target.name);
                    if !near_ok || !far_ok {
                        return Err(invalid(format!(
                            "join type '{join_type}' needs foreign keys '{near}' to '{}' and '{far}' to '{}'",
                            ty.name, target.name
                        ))
                        .into());
                    }
                    if let Some(inverse) = &rel.inverse {
                        let other = target.relation(inverse).ok_or_else(|| SchemaError::MissingInverse {
                            record_type: ty.name.clone(),
                            relation: rel.name.clone(),
                            target: target.name.clone(),
                            inverse: inverse.clone(),
                        })?;
                        let mirrored = RelationLink::Through {
                            join_type: join_type.clone(),
                            near: far.clone(),
                            far: near.clone(),
                        };
                        if other.link != mirrored {
                            return Err(SchemaError::InverseMismatch {
                                record_type: ty.name.clone(),
                                relation: rel.name.clone(),
                                target: target.name.clone(),
                                inverse: inverse.clone(),
                                reason: "inverse must go through the same join records".into(),
                            }
                            .into());
                        }
                    }
                }
            }

            if let Some(inverse) = &rel.inverse {
                let key = (target.name.clone(), inverse.clone());
                if let Some(first) = claims.insert(key, qualified.clone()) {
                    return Err(SchemaError::ConflictingInverse {
                        target: target.name.clone(),
                        inverse: inverse.clone(),
                        first,
                        second: qualified,
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

/// Fills in the inverse name on owning sides that were declared without one,
/// and derives nullability of owning sides from their foreign-key fields.
fn link_inverses(schema: &mut Schema) {
    let mut back_links: Vec<(usize, String, String)> = Vec::new();
    for ty in &schema.types {
        for rel in &ty.relations {
            if let (RelationLink::Inverse, Some(inverse)) = (&rel.link, &rel.inverse) {
                if let Some(idx) = schema.by_name.get(&rel.target) {
                    back_links.push((*idx, inverse.clone(), rel.name.clone()));
                }
            }
        }
    }
    for (idx, relation, inverse) in back_links {
        if let Some(rel) = schema.types[idx]
            .relations
            .iter_mut()
            .find(|r| r.name == relation)
        {
            rel.inverse.get_or_insert(inverse);
        }
    }
    for ty in &mut schema.types {
        let scalars = ty.scalars.clone();
        for rel in &mut ty.relations {
            if let RelationLink::ForeignKey { fields, .. } = &rel.link {
                rel.nullable = fields
                    .iter()
                    .any(|f| scalars.iter().any(|s| &s.name == f && s.nullable));
            }
        }
    }
}
