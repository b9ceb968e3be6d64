//! Binary entry point for the Relcore CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use relcore::cli::{
    print_aggregate_text, print_batch_text, print_check_text, print_rows_text, read_request, run_aggregate,
    run_batch, run_check, run_explain, run_find, BatchRequest, Fixture, Request,
};
use relcore::{AggregateSpec, EngineConfig, FindArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "relcore",
    version,
    about = "Run typed queries against a JSON fixture",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "RELCORE_CONFIG",
        help = "Engine configuration (TOML); defaults to the per-user config file when present"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "FILTER",
        help = "Log filter, e.g. `relcore=debug`; falls back to RELCORE_LOG then RUST_LOG"
    )]
    log: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(value_name = "FIXTURE")]
    fixture: PathBuf,

    #[arg(long, value_name = "FILE", help = "JSON request file")]
    request: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a fixture's schema and seed rows
    Check {
        #[arg(value_name = "FIXTURE")]
        fixture: PathBuf,
    },
    /// Run a findMany request
    Find(RequestArgs),
    /// Run an aggregate or groupBy request
    Aggregate(RequestArgs),
    /// Show the plan of a findMany request
    Explain(RequestArgs),
    /// Run a list of operations in one transaction
    Batch(RequestArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(explicit: Option<&str>) {
    let filter = explicit
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_env("RELCORE_LOG").ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Check { fixture } => {
            let report = run_check(&Fixture::load(&fixture)?, config)?;
            emit(cli.format, &report, || print_check_text(&report))?;
        }
        Command::Find(args) => {
            let engine = open(&args.fixture, config)?;
            let request: Request<FindArgs> = read_request(&args.request)?;
            let rows = run_find(&engine, &request)?;
            emit(cli.format, &rows, || print_rows_text(&rows))?;
        }
        Command::Aggregate(args) => {
            let engine = open(&args.fixture, config)?;
            let request: Request<AggregateSpec> = read_request(&args.request)?;
            let result = run_aggregate(&engine, &request)?;
            emit(cli.format, &result, || print_aggregate_text(&result))?;
        }
        Command::Explain(args) => {
            let engine = open(&args.fixture, config)?;
            let request: Request<FindArgs> = read_request(&args.request)?;
            let explain = run_explain(&engine, &request)?;
            emit(cli.format, &explain, || println!("{explain}"))?;
        }
        Command::Batch(args) => {
            let engine = open(&args.fixture, config)?;
            let request: BatchRequest = read_request(&args.request)?;
            let results = run_batch(&engine, request)?;
            emit(cli.format, &results, || print_batch_text(&results))?;
        }
    }
    Ok(())
}

fn open(fixture: &Path, config: EngineConfig) -> Result<relcore::Engine, Box<dyn Error>> {
    let (engine, _) = Fixture::load(fixture)?.load_engine(config)?;
    Ok(engine)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
