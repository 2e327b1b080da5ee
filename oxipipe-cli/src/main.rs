mod display;

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde_json::Value as JsonValue;

use oxipipe::{AggregateOptions, Document, MemoryStore, Pipeline};

#[derive(Parser)]
#[command(name = "oxipipe", about = "Run an aggregation pipeline over JSON documents")]
struct Cli {
    /// Pipeline as a JSON array, or @path to read it from a file
    #[arg(long)]
    pipeline: String,

    /// Input records: a JSON array or one JSON document per line (default: stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Store contents for $lookup/$graphLookup/$merge/$out, as {collection: [docs]}
    #[arg(long)]
    collections: Option<PathBuf>,

    /// Write the store back to this file after the run
    #[arg(long)]
    save: Option<PathBuf>,

    /// Run $facet sub-pipelines one after another
    #[arg(long)]
    sequential: bool,

    /// Output raw JSON (no pretty-printing)
    #[arg(long)]
    json: bool,

    /// Log verbosity (RUST_LOG is used when omitted)
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = cli.log_level {
        logger.filter_level(level.to_level_filter());
    }
    logger.init();

    if let Err(e) = run(&cli) {
        eprintln!("{} {e}", display::error_label());
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = Pipeline::parse(&load_pipeline(&cli.pipeline)?)?;

    let store = match &cli.collections {
        Some(path) => MemoryStore::from_json(&serde_json::from_str(&fs::read_to_string(path)?)?)?,
        None => MemoryStore::new(),
    };

    let text = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let records = parse_records(&text)?;
    log::info!("running {} stage(s) over {} record(s)", pipeline.stages().len(), records.len());

    let options = AggregateOptions {
        parallel_facets: !cli.sequential,
        ..AggregateOptions::default()
    };
    let output = pipeline.execute_with_options(records, &store, &options)?;
    let output = JsonValue::Array(output.iter().map(Document::to_json).collect());
    println!("{}", display::format_output(&output, cli.json));

    if let Some(path) = &cli.save {
        save_store(&store, path)?;
    }
    Ok(())
}

fn load_pipeline(arg: &str) -> Result<JsonValue, Box<dyn std::error::Error>> {
    let text = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

/// Accept either a single JSON array or newline-delimited documents.
fn parse_records(text: &str) -> oxipipe::Result<Vec<Document>> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        let value: JsonValue = serde_json::from_str(trimmed)?;
        return match value {
            JsonValue::Array(items) => items.iter().map(Document::from_json).collect(),
            _ => Err(oxipipe::Error::NotAnObject),
        };
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Document::from_json(&serde_json::from_str(line)?))
        .collect()
}

fn save_store(store: &MemoryStore, path: &Path) -> oxipipe::Result<()> {
    let dump = serde_json::to_string_pretty(&store.to_json()?)?;
    fs::write(path, dump)?;
    log::info!("store written to {}", path.display());
    Ok(())
}
