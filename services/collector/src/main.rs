//! Collector Service - lands raw API extracts in the landing zone
//!
//! Responsibilities:
//! - Fetch a JSON endpoint with a rate-limit pause before each request
//! - Check the payload parses as a list of records
//! - Skip captures identical to the latest one already landed
//! - Store the payload as `<source_id>/<timestamp>.json` (or `.ndjson`)
//!
//! Usage:
//!   cargo run --bin collector -- --source-id carts --url https://fakestoreapi.com/carts
//!   cargo run --bin collector -- --source-id users --url https://fakestoreapi.com/users --ndjson

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use loader::landing::{content_hash, BlobStore, FsBlobStore};
use loader::normalizer::SourceRecord;
use loader::source::read_json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Lands raw API extracts in the landing zone")]
struct Args {
    /// Source identifier, used as the landing prefix
    #[arg(long)]
    source_id: String,

    /// URL to fetch
    #[arg(long)]
    url: String,

    /// Land as newline-delimited JSON instead of a JSON array
    #[arg(long, default_value = "false")]
    ndjson: bool,

    /// Land even if the payload matches the latest capture
    #[arg(long, default_value = "false")]
    force: bool,

    /// Fetch and validate only; nothing is written
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    landing_dir: PathBuf,
    rate_limit_ms: u64,
}

impl Config {
    fn from_env() -> Self {
        Self {
            landing_dir: PathBuf::from(
                std::env::var("LANDING_DIR").unwrap_or_else(|_| "./data/landing".to_string()),
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
        }
    }
}

/// `<source_id>/<capture time>.<ext>`; the timestamp sorts lexically.
fn blob_key(source_id: &str, captured_at: DateTime<Utc>, ndjson: bool) -> String {
    let ext = if ndjson { "ndjson" } else { "json" };
    format!("{}/{}.{}", source_id.trim_matches('/'), captured_at.format("%Y%m%dT%H%M%SZ"), ext)
}

fn to_ndjson(records: &[SourceRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(out)
}

async fn fetch(client: &reqwest::Client, config: &Config, url: &str) -> Result<Vec<u8>> {
    info!(delay_ms = config.rate_limit_ms, "rate limit");
    sleep(Duration::from_millis(config.rate_limit_ms)).await;

    info!(url, "fetching");
    let resp = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .context("HTTP request failed")?;
    Ok(resp.bytes().await?.to_vec())
}

/// Whether the newest blob under `source_id` already holds `hash`.
async fn is_unchanged(store: &FsBlobStore, source_id: &str, hash: &str) -> Result<bool> {
    let Some(latest) = store.latest(source_id).await? else {
        return Ok(false);
    };
    let existing = store.get(&latest).await?;
    Ok(content_hash(&existing) == hash)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env();
    let store = FsBlobStore::new(&config.landing_dir);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent("star-loader-collector/0.1")
        .build()?;

    let body = fetch(&client, &config, &args.url).await?;
    let records = read_json(&body).with_context(|| format!("{} did not return JSON records", args.url))?;
    let payload = if args.ndjson { to_ndjson(&records)? } else { body };
    let hash = content_hash(&payload);
    info!(source_id = %args.source_id, records = records.len(), bytes = payload.len(), %hash, "downloaded");

    if args.dry_run {
        info!("dry run, nothing landed");
        return Ok(());
    }
    if !args.force && is_unchanged(&store, &args.source_id, &hash).await? {
        warn!(source_id = %args.source_id, "payload matches the latest capture, skipping");
        return Ok(());
    }

    let key = blob_key(&args.source_id, Utc::now(), args.ndjson);
    let meta = store.put(&key, &payload).await.context("Failed to land payload")?;
    info!(key = %meta.key, size = meta.size, root = %store.root().display(), "landed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_blob_key_layout() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 5).unwrap();
        assert_eq!(blob_key("carts", at, false), "carts/20240601T083005Z.json");
        assert_eq!(blob_key("users/", at, true), "users/20240601T083005Z.ndjson");
    }

    #[test]
    fn test_to_ndjson_one_line_per_record() {
        let records = read_json(br#"[{"id": 1}, {"id": 2}]"#).unwrap();
        let out = String::from_utf8(to_ndjson(&records).unwrap()).unwrap();
        assert_eq!(out, "{\"id\":1}\n{\"id\":2}\n");
    }
}
