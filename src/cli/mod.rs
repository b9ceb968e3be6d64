#![forbid(unsafe_code)]

//! Command-line support: fixture loading, request files and report
//! rendering for the `relcore` binary.

/// Schema-plus-seed fixture documents.
pub mod fixture;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::engine::{Engine, Operation, OperationResult, QueryClient};
use crate::error::EngineError;
use crate::query::aggregate::{AggregateResult, AggregateSpec};
use crate::query::ast::FindArgs;
use crate::query::executor::Row;
use crate::query::planner::PlanExplain;
use crate::txn::TransactionOptions;

pub use fixture::Fixture;

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Generic error message.
    #[error("{0}")]
    Message(String),
    /// IO error from file operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Engine rejected the request.
    #[error("{} ({})", .0, .0.code())]
    Engine(#[from] EngineError),
    /// Configuration file problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<&str> for CliError {
    fn from(value: &str) -> Self {
        CliError::Message(value.to_string())
    }
}

impl From<String> for CliError {
    fn from(value: String) -> Self {
        CliError::Message(value)
    }
}

/// A request file: the target type plus the operation's arguments inline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    /// Queried type.
    pub record_type: String,
    /// Operation arguments.
    #[serde(flatten)]
    pub args: T,
}

/// Reads a JSON request file.
pub fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|err| CliError::Message(format!("invalid request {}: {err}", path.display())))
}

/// Summary of one record type in a checked fixture.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypeSummary {
    /// Type name.
    pub name: String,
    /// Scalar field count.
    pub scalars: usize,
    /// Relation field names.
    pub relations: Vec<String>,
    /// Unique constraint names, primary first.
    pub uniques: Vec<String>,
    /// Rows seeded.
    pub seeded: usize,
}

/// Result of `relcore check`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckReport {
    /// One entry per record type.
    pub types: Vec<TypeSummary>,
}

/// Validates the fixture schema and seeds it.
pub fn run_check(fixture: &Fixture, config: EngineConfig) -> Result<CheckReport, CliError> {
    let (engine, seeded) = fixture.load_engine(config)?;
    let types = engine
        .schema()
        .record_types()
        .map(|ty| TypeSummary {
            name: ty.name.clone(),
            scalars: ty.scalars.len(),
            relations: ty.relations.iter().map(|r| r.name.clone()).collect(),
            uniques: ty.uniques.iter().map(|u| u.name.clone()).collect(),
            seeded: seeded.get(&ty.name).copied().unwrap_or(0),
        })
        .collect();
    Ok(CheckReport { types })
}

/// Runs a `findMany` request.
pub fn run_find(engine: &Engine, request: &Request<FindArgs>) -> Result<Vec<Row>, CliError> {
    Ok(engine.find_many(&request.record_type, &request.args)?)
}

/// Runs an aggregation request.
pub fn run_aggregate(engine: &Engine, request: &Request<AggregateSpec>) -> Result<AggregateResult, CliError> {
    Ok(engine.aggregate(&request.record_type, &request.args)?)
}

/// Plans a `findMany` request without running it.
pub fn run_explain(engine: &Engine, request: &Request<FindArgs>) -> Result<PlanExplain, CliError> {
    Ok(engine.explain(&request.record_type, &request.args)?)
}

/// A batch file: operations run in order inside one transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchRequest {
    /// Transaction options.
    pub options: TransactionOptions,
    /// Operations, in order.
    pub operations: Vec<Operation>,
}

/// Runs a batch; the first failure rolls the whole batch back.
pub fn run_batch(engine: &Engine, request: BatchRequest) -> Result<Vec<OperationResult>, CliError> {
    Ok(engine.run_batch(request.operations, request.options)?)
}

/// Renders a row as `{a: 1, b: "x"}`.
pub fn format_row(row: &Row) -> String {
    let mut out = String::from("{");
    for (idx, (field, value)) in row.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{field}: {value}");
    }
    out.push('}');
    out
}

/// Text form of `relcore check`.
pub fn print_check_text(report: &CheckReport) {
    for ty in &report.types {
        println!(
            "{}: {} scalars, relations [{}], uniques [{}], seeded {}",
            ty.name,
            ty.scalars,
            ty.relations.join(", "),
            ty.uniques.join(", "),
            ty.seeded
        );
    }
}

/// Text form of a row list.
pub fn print_rows_text(rows: &[Row]) {
    for row in rows {
        println!("{}", format_row(row));
    }
    println!("({} rows)", rows.len());
}

/// Text form of an aggregation.
pub fn print_aggregate_text(result: &AggregateResult) {
    for row in &result.rows {
        let mut parts: BTreeMap<String, String> = row
            .key
            .iter()
            .map(|(field, value)| (field.clone(), value.to_string()))
            .collect();
        for (prefix, values) in [("_min", &row.min), ("_max", &row.max), ("_sum", &row.sum), ("_avg", &row.avg)] {
            for (field, value) in values {
                parts.insert(format!("{prefix}.{field}"), value.to_string());
            }
        }
        for (field, count) in &row.count {
            parts.insert(format!("_count.{field}"), count.to_string());
        }
        let rendered: Vec<String> = parts.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        println!("{}", rendered.join(" "));
    }
    println!("({} groups)", result.rows.len());
}

/// Text form of batch results.
pub fn print_batch_text(results: &[OperationResult]) {
    for (idx, result) in results.iter().enumerate() {
        let line = match result {
            OperationResult::Rows(rows) => format!("{} rows", rows.len()),
            OperationResult::Row(Some(row)) => format_row(row),
            OperationResult::Row(None) => "no record".to_owned(),
            OperationResult::Count(count) => format!("count {count}"),
            OperationResult::Counts(counts) => format!("counts {counts:?}"),
            OperationResult::Aggregate(agg) => format!("{} groups", agg.rows.len()),
            OperationResult::Written(summary) => format!("{} written", summary.count),
            OperationResult::Upserted(up) => format!("{:?} {}", up.branch, format_row(&up.row)),
        };
        println!("#{idx}: {line}");
    }
}
