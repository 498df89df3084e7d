use anyhow::{Context, Result};
use chrono::Utc;
use common::{Phase, Store};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, Level};
use tracing_subscriber::fmt;

use pipeline::{load_config, load_price_file, load_signal_file, EveningRunner, MorningRunner, PipelineConfig};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries only the summary JSON.
    fmt()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let phase = args.next().and_then(|arg| Phase::parse(&arg));
    let config_path = args.next();

    let Some(phase) = phase else {
        eprintln!("usage: pipeline <morning|evening> [config.toml]");
        std::process::exit(2);
    };

    match run(phase, config_path.as_deref()).await {
        Ok(summary_json) => println!("{summary_json}"),
        Err(err) => {
            error!("{} run failed: {:#}", phase, err);
            std::process::exit(1);
        }
    }
}

async fn run(phase: Phase, config_path: Option<&str>) -> Result<String> {
    let config = match config_path {
        Some(path) => load_config(Path::new(path))
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => PipelineConfig::default(),
    };

    let store = Store::connect(&config.database_path).await?;
    store.initialize().await?;
    let now = Utc::now();

    match phase {
        Phase::Morning => {
            let signals = load_signal_file(&config.signals_path)?;
            let summary = MorningRunner::new(store, Arc::new(signals), config)
                .run(now)
                .await?;
            serde_json::to_string_pretty(&summary).context("Failed to serialize the morning summary")
        }
        Phase::Evening => {
            let prices = load_price_file(&config.prices_path)?;
            let summary = EveningRunner::new(store, Arc::new(prices), config)
                .run(now)
                .await?;
            serde_json::to_string_pretty(&summary).context("Failed to serialize the evening summary")
        }
    }
}
