//! `rtm-reshard`: thin CLI wrapper over [`rtmd::reshard::run`] (SPEC_FULL.md §4.8.1).

use anyhow::{Context, Result};
use clap::Parser;
use rtmd::backend::RedisBackend;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rtm-reshard", about = "Rebalance RTM cluster hash slots by key weight")]
struct ReshardArgs {
    /// JSON weights file: `{ "<key>": <u64 weight>, ... }`
    #[arg(long)]
    weights: PathBuf,

    /// Backend connection URL, e.g. redis://host:port
    #[arg(long)]
    url: String,

    /// Per-MIGRATE timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").compact().init();
    let args = ReshardArgs::parse();

    if let Err(e) = run(args).await {
        tracing::error!(err = %e, "reshard failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: ReshardArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.weights).with_context(|| format!("reading weights file {}", args.weights.display()))?;
    let weights: HashMap<String, u64> = serde_json::from_str(&text).with_context(|| format!("parsing weights file {}", args.weights.display()))?;

    let backend = RedisBackend::connect(&args.url).await.with_context(|| format!("connecting to {}", args.url))?;

    let report = rtmd::reshard::run(&weights, &backend, args.timeout_ms).await?;
    tracing::info!(migrations = report.migrations.len(), "reshard complete");
    for m in &report.migrations {
        println!("slot {} : {} -> {}", m.slot, m.from, m.to);
    }
    Ok(())
}
