//! File-backed source wiring for the binary.
//!
//! Upstream collectors drop their latest observations as JSON files; each
//! batch run loads them into in-memory sources. The runners themselves only
//! ever see the `SignalSource` / `PriceSource` traits.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use feature_engineering::{SignalBundle, StaticPriceSource, StaticSignalSource};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One observed price in the price drop file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub at: DateTime<Utc>,
    pub price: f64,
}

/// Load the signal drop file: a JSON array of per-symbol bundles.
pub fn load_signal_file(path: &Path) -> Result<StaticSignalSource> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read signal file {}", path.display()))?;
    let bundles: Vec<SignalBundle> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse signal file {}", path.display()))?;

    let mut source = StaticSignalSource::new();
    for bundle in bundles {
        source.insert(bundle);
    }
    Ok(source)
}

/// Load the price drop file: a JSON array of observed price points.
pub fn load_price_file(path: &Path) -> Result<StaticPriceSource> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read price file {}", path.display()))?;
    let points: Vec<PricePoint> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse price file {}", path.display()))?;

    let mut source = StaticPriceSource::new();
    for point in &points {
        source.push(&point.symbol, point.at, point.price);
    }
    Ok(source)
}
