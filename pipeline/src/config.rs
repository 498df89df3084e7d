//! Batch run configuration
//!
//! One TOML file drives both phases. Every field carries a default, so a
//! missing or partial file still yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use feature_engineering::EngineerConfig;
use model_performance::PromotionGate;
use outcome_tracking::{GuardConfig, RecorderConfig};
use prediction_models::{EnsembleSettings, TrainingConfig};

/// Everything the morning and evening runs read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Symbols processed by the morning fan-out
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Serialized active ensemble; absent means heuristic-only cold start
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Signal bundle drop file read by the morning run
    #[serde(default = "default_signals_path")]
    pub signals_path: PathBuf,

    /// Price series drop file read by the evening run
    #[serde(default = "default_prices_path")]
    pub prices_path: PathBuf,

    /// Scheduling and resource limits
    #[serde(default)]
    pub batch: BatchConfig,

    /// Feature construction settings
    #[serde(default)]
    pub engineer: EngineerConfig,

    /// Temporal integrity guard settings
    #[serde(default)]
    pub guard: GuardConfig,

    /// Outcome recording settings
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Challenger training settings
    #[serde(default)]
    pub training: TrainingConfig,

    /// Vote weights and action thresholds
    #[serde(default)]
    pub ensemble: EnsembleSettings,

    /// Promotion gate thresholds
    #[serde(default)]
    pub gate: PromotionGate,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            database_path: default_database_path(),
            model_path: default_model_path(),
            signals_path: default_signals_path(),
            prices_path: default_prices_path(),
            batch: BatchConfig::default(),
            engineer: EngineerConfig::default(),
            guard: GuardConfig::default(),
            recorder: RecorderConfig::default(),
            training: TrainingConfig::default(),
            ensemble: EnsembleSettings::default(),
            gate: PromotionGate::default(),
        }
    }
}

fn default_symbols() -> Vec<String> {
    ["AAPL", "MSFT", "GOOGL", "AMZN", "NVDA"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("pipeline.db")
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/active_model.json")
}

fn default_signals_path() -> PathBuf {
    PathBuf::from("data/signals.json")
}

fn default_prices_path() -> PathBuf {
    PathBuf::from("data/prices.json")
}

/// Scheduling and resource limits for a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Concurrent per-symbol tasks in the morning fan-out
    #[serde(default = "default_max_concurrent_symbols")]
    pub max_concurrent_symbols: usize,

    /// Upstream signal fetch timeout (seconds)
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Capacity of the stale-bundle fallback cache
    #[serde(default = "default_signal_cache_capacity")]
    pub signal_cache_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_symbols: default_max_concurrent_symbols(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            signal_cache_capacity: default_signal_cache_capacity(),
        }
    }
}

fn default_max_concurrent_symbols() -> usize {
    8
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_signal_cache_capacity() -> usize {
    64
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: PipelineConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a TOML file.
pub fn save_config(config: &PipelineConfig, path: &Path) -> anyhow::Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Write a commented default configuration file.
pub fn create_config_template(path: &Path) -> anyhow::Result<()> {
    let template = "# Trading Signal Pipeline Configuration
# Both batch phases read this file; omitted keys fall back to defaults.

# Symbols processed each morning
symbols = [\"AAPL\", \"MSFT\", \"GOOGL\", \"AMZN\", \"NVDA\"]

# SQLite database file
database_path = \"pipeline.db\"

# Serialized active ensemble; deleted or absent means heuristic-only cold start
model_path = \"models/active_model.json\"

# Drop files written by the upstream collectors
signals_path = \"data/signals.json\"
prices_path = \"data/prices.json\"

[batch]
# Concurrent per-symbol tasks in the morning fan-out
max_concurrent_symbols = 8

# Upstream signal fetch timeout (seconds)
fetch_timeout_secs = 10

# Capacity of the stale-bundle fallback cache
signal_cache_capacity = 64

[engineer]
# Quality-score ceiling for bundles served from the stale cache
degraded_quality_cap = 0.5

[guard]
# Grace period past the longest horizon before a missing outcome
# counts as a parity violation (hours)
catch_up_hours = 24

[recorder]
# Returns within +/- this percent classify the realized direction FLAT
flat_band_pct = 0.2

[training]
# Minimum paired samples before a challenger may be fitted
min_training_samples = 50

# Fraction of the newest samples withheld for evaluation
holdout_fraction = 0.2

# Returns within +/- this percent label as FLAT
flat_band_pct = 0.2

[training.forest]
n_trees = 60
max_depth = 6
min_samples_split = 4
min_samples_leaf = 2
seed = 42

[training.momentum]
learning_rate = 0.05
max_iter = 300
tolerance = 1e-5

[ensemble]
# Vote weights per family
heuristic_weight = 0.5
forest_weight = 1.0
momentum_weight = 1.0

[ensemble.thresholds]
# STRONG_BUY / STRONG_SELL gates
strong_confidence = 0.8
strong_magnitude_pct = 2.0

# BUY / SELL gates
base_confidence = 0.6
base_magnitude_pct = 0.5

[gate]
# Promotion floor on the longest horizon's holdout metrics
min_direction_accuracy = 0.60
max_magnitude_mae_pct = 2.0
";

    std::fs::write(path, template)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn default_config_is_runnable() {
        let config = PipelineConfig::default();
        assert!(!config.symbols.is_empty());
        assert_eq!(config.training.min_training_samples, 50);
        assert_eq!(config.gate.min_direction_accuracy, 0.60);
        assert_eq!(config.batch.max_concurrent_symbols, 8);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = PipelineConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: PipelineConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config.symbols, deserialized.symbols);
        assert_eq!(
            config.training.forest.n_trees,
            deserialized.training.forest.n_trees
        );
        assert_eq!(
            config.ensemble.thresholds.strong_confidence,
            deserialized.ensemble.thresholds.strong_confidence
        );
    }

    #[test]
    fn template_parses_back_to_the_defaults() {
        let path = std::env::temp_dir().join(format!("pipeline-template-{}.toml", Uuid::new_v4()));
        create_config_template(&path).unwrap();

        let config = load_config(&path).unwrap();
        let defaults = PipelineConfig::default();
        assert_eq!(config.symbols, defaults.symbols);
        assert_eq!(config.guard.catch_up_hours, defaults.guard.catch_up_hours);
        assert_eq!(config.training.flat_band_pct, defaults.training.flat_band_pct);
        assert_eq!(
            config.gate.max_magnitude_mae_pct,
            defaults.gate.max_magnitude_mae_pct
        );

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = std::env::temp_dir().join(format!("pipeline-partial-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "symbols = [\"TSLA\"]\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.symbols, vec!["TSLA".to_string()]);
        assert_eq!(config.batch.fetch_timeout_secs, 10);
        assert_eq!(config.training.min_training_samples, 50);

        std::fs::remove_file(&path).ok();
    }
}
