//! JSON fixtures: a schema plus seed rows, loaded into a fresh in-memory
//! engine.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::CliError;
use crate::config::EngineConfig;
use crate::engine::{Engine, QueryClient};
use crate::mutation::WriteData;
use crate::query::value::Value;
use crate::schema::{EnumDef, RecordType, RelationSpec, Schema, SchemaRegistry};
use crate::storage::{MemoryStore, RecordStore};

/// Additional unique constraint declared outside a type body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueDecl {
    /// Constrained type.
    pub record_type: String,
    /// Constrained fields.
    pub fields: Vec<String>,
}

/// Rows inserted into one type, in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedBatch {
    /// Target type.
    pub record_type: String,
    /// Plain JSON objects; values are coerced through the schema.
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// On-disk fixture document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fixture {
    /// Enums, registered first.
    pub enums: Vec<EnumDef>,
    /// Record types with their scalars and inline unique constraints.
    pub types: Vec<RecordType>,
    /// Relation fields, registered after every type.
    pub relations: Vec<RelationSpec>,
    /// Compound unique constraints.
    pub uniques: Vec<UniqueDecl>,
    /// Seed data, inserted in declaration order.
    pub seed: Vec<SeedBatch>,
}

impl Fixture {
    /// Reads and parses a fixture file.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| CliError::Message(format!("invalid fixture {}: {err}", path.display())))
    }

    /// Registers everything and freezes the schema.
    pub fn schema(&self) -> Result<Arc<Schema>, CliError> {
        let mut registry = SchemaRegistry::new();
        for def in &self.enums {
            registry.register_enum(def.clone())?;
        }
        for ty in &self.types {
            registry.register_type(ty.clone())?;
        }
        for relation in &self.relations {
            registry.register_relation(relation.clone())?;
        }
        for unique in &self.uniques {
            registry.register_unique(&unique.record_type, unique.fields.iter().cloned())?;
        }
        Ok(registry.finalize()?)
    }

    /// Builds an engine over a fresh [`MemoryStore`] and inserts the seed
    /// rows. Returns the engine and the number of rows seeded per type.
    pub fn load_engine(&self, config: EngineConfig) -> Result<(Engine, BTreeMap<String, usize>), CliError> {
        let schema = self.schema()?;
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let engine = Engine::new(schema, store, config)?;
        let mut seeded = BTreeMap::new();
        for batch in &self.seed {
            let rows: Vec<WriteData> = batch.rows.iter().map(seed_row).collect();
            let written = engine.create_many(&batch.record_type, &rows, false)?;
            debug!(record_type = %batch.record_type, rows = written, "fixture.seed");
            *seeded.entry(batch.record_type.clone()).or_insert(0) += written;
        }
        info!(
            types = self.types.len(),
            rows = seeded.values().sum::<usize>(),
            "fixture.loaded"
        );
        Ok((engine, seeded))
    }
}

fn seed_row(row: &serde_json::Map<String, serde_json::Value>) -> WriteData {
    row.iter()
        .fold(WriteData::new(), |data, (field, value)| data.set(field.as_str(), plain_value(value)))
}

/// Converts untagged JSON into a [`Value`]. Strings stay strings; the schema
/// turns them into enum variants or timestamps where the field asks for it.
pub fn plain_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(int) => Value::Int(int),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(plain_value).collect()),
        serde_json::Value::Object(_) => Value::Json(json.clone()),
    }
}
