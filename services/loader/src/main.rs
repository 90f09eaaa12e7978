//! Loader - runs one catalogued pipeline against Postgres or an in-memory
//! warehouse.
//!
//! Usage:
//!   # Reviews spreadsheet, first load:
//!   cargo run --bin loader -- --pipeline product_reviews --source data/amazon.xlsx
//!
//!   # Yesterday's changes, audited:
//!   cargo run --bin loader -- --pipeline product_reviews --variant incremental --source data/ebay.csv
//!
//!   # Store sales from the latest landed API captures:
//!   cargo run --bin loader -- --pipeline store_sales \
//!       --source carts=landing:carts --source products=landing:products --source users=landing:users

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use loader::catalog::{self, Variant};
use loader::config::Config;
use loader::landing::{BlobStore, FsBlobStore};
use loader::normalizer::SourceRecord;
use loader::pipeline::{Stage, StageOutcome, StageSummary};
use loader::source::{read_bytes, read_path, read_spreadsheet, Format};
use loader::warehouse::{MemoryWarehouse, PostgresWarehouse};
use loader::{Pipeline, RunReport, Warehouse};
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LANDING_PREFIX: &str = "landing:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Sink {
    Postgres,
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads extracted records into a star schema")]
struct Args {
    /// Pipeline name (product_reviews, store_sales, movies)
    #[arg(long)]
    pipeline: String,

    /// initial or incremental
    #[arg(long, default_value = "initial")]
    variant: Variant,

    /// Input as PATH, KEY=PATH, or KEY=landing:<prefix> (repeatable)
    #[arg(long = "source", required = true)]
    sources: Vec<String>,

    #[arg(long, value_enum, default_value = "postgres")]
    sink: Sink,
}

/// Split `KEY=VALUE`; a bare value gets the key "default".
fn parse_source_arg(raw: &str) -> (&str, &str) {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() && !key.contains(['/', '\\', ':']) => (key, value),
        _ => ("default", raw),
    }
}

async fn read_source(location: &str, landing: &FsBlobStore) -> Result<Vec<SourceRecord>> {
    let Some(prefix) = location.strip_prefix(LANDING_PREFIX) else {
        return read_path(Path::new(location)).with_context(|| format!("Failed to read {}", location));
    };

    let key = landing
        .latest(prefix)
        .await?
        .with_context(|| format!("Nothing landed under '{}'", prefix))?;
    let format = Format::detect(&key).with_context(|| format!("Unknown format for blob '{}'", key))?;
    info!(%key, ?format, "reading landed blob");
    let records = match format {
        Format::Spreadsheet => read_spreadsheet(&landing.root().join(&key))?,
        other => read_bytes(other, &landing.get(&key).await?)?,
    };
    Ok(records)
}

async fn gather_records(pipeline: &str, args: &[String], landing: &FsBlobStore) -> Result<Vec<SourceRecord>> {
    let mut inputs: Vec<(&str, Vec<SourceRecord>)> = Vec::new();
    for raw in args {
        let (key, location) = parse_source_arg(raw);
        let records = read_source(location, landing).await?;
        info!(source = key, location, records = records.len(), "source read");
        inputs.push((key, records));
    }

    if pipeline != "store_sales" {
        return Ok(inputs.into_iter().flat_map(|(_, records)| records).collect());
    }
    let inputs: HashMap<&str, Vec<SourceRecord>> = inputs.into_iter().collect();
    let (Some(carts), Some(products), Some(users)) =
        (inputs.get("carts"), inputs.get("products"), inputs.get("users"))
    else {
        bail!("store_sales needs --source carts=..., --source products=... and --source users=...");
    };
    Ok(catalog::store_sales_records(carts, products, users))
}

fn log_report(report: &RunReport) {
    for stage in &report.stages {
        match &stage.outcome {
            StageOutcome::Succeeded(summary) => match summary {
                StageSummary::Normalized {
                    rows,
                    rejected,
                    filtered,
                    samples,
                } => {
                    info!(stage = %stage.stage, rows, rejected, filtered, "ok");
                    for sample in samples {
                        warn!(position = sample.source_position, error = %sample.error, "rejected");
                    }
                }
                StageSummary::Staged(counts) => info!(stage = %stage.stage, written = counts.written, "ok"),
                StageSummary::Loaded(counts) => info!(
                    stage = %stage.stage,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    skipped = counts.skipped,
                    "ok"
                ),
                StageSummary::Resolved(steps) => {
                    for step in steps {
                        info!(
                            stage = %stage.stage,
                            step = %step.step,
                            matched = step.counts.matched,
                            unmatched = step.counts.unmatched,
                            "ok"
                        );
                    }
                }
                StageSummary::Fact(counts) => info!(
                    stage = %stage.stage,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    rejected = counts.rejected,
                    "ok"
                ),
                StageSummary::Audited(entries) => {
                    for entry in entries {
                        info!(stage = %stage.stage, table = %entry.table_name, status = %entry.status, "ok");
                    }
                }
            },
            StageOutcome::Failed(e) if stage.stage == Stage::Audit => {
                warn!(stage = %stage.stage, error = %e, "failed (not fatal)")
            }
            StageOutcome::Failed(e) => error!(stage = %stage.stage, error = %e, "failed"),
            StageOutcome::Skipped => warn!(stage = %stage.stage, "skipped"),
        }
    }
}

async fn run(args: Args, config: Config) -> Result<bool> {
    let definition = catalog::definition(&args.pipeline, args.variant)?;
    let landing = FsBlobStore::new(&config.landing_dir);
    let records = gather_records(&args.pipeline, &args.sources, &landing).await?;
    info!(
        pipeline = %definition.name,
        variant = %args.variant,
        run_date = %config.run_date,
        records = records.len(),
        "records gathered"
    );

    let pipeline = Pipeline::new(&definition, config.run_date);
    let report = match args.sink {
        Sink::Postgres => {
            let warehouse = PostgresWarehouse::connect(
                config.require_db_url()?,
                config.db_max_connections,
                config.db_schema.as_deref(),
            )
            .await
            .context("Failed to connect to database")?;
            let report = pipeline.run(&warehouse, &records).await;
            warehouse.close().await;
            report
        }
        Sink::Memory => {
            let warehouse = MemoryWarehouse::columnar();
            let report = pipeline.run(&warehouse, &records).await;
            summarize_memory(&warehouse, &definition);
            report
        }
    };

    log_report(&report);
    Ok(report.is_success())
}

fn summarize_memory(warehouse: &MemoryWarehouse, definition: &loader::PipelineDefinition) {
    let tables = definition
        .dimensions
        .iter()
        .map(|d| d.name())
        .chain(definition.bridges.iter().map(|b| b.name()))
        .chain(std::iter::once(definition.fact.name()));
    for table in tables {
        info!(table, rows = warehouse.rows(table).len(), capabilities = ?warehouse.capabilities(), "table");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match Config::from_env() {
        Ok(config) => run(args, config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("run finished with a failed stage");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("loader failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_arg() {
        assert_eq!(parse_source_arg("carts=landing:carts"), ("carts", "landing:carts"));
        assert_eq!(parse_source_arg("data/amazon.xlsx"), ("default", "data/amazon.xlsx"));
        assert_eq!(parse_source_arg("landing:movies"), ("default", "landing:movies"));
        assert_eq!(parse_source_arg("data/a=b.csv"), ("default", "data/a=b.csv"));
    }
}
