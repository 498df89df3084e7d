// Model persistence
// The promoted families are serialized to a JSON file next to the
// database. The stored schema hash guards against scoring fresh vectors
// with a model trained on a different feature layout.

use crate::ensemble::{EnsembleSettings, MultiOutputPredictor};
use crate::forest::ForestFamily;
use crate::momentum::MomentumFamily;
use crate::training::Challenger;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::feature_schema_hash;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// On-disk representation of a promoted model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub version: String,
    pub feature_schema_hash: String,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
    pub forest: ForestFamily,
    pub momentum: MomentumFamily,
}

impl ModelFile {
    pub fn from_challenger(challenger: &Challenger) -> Self {
        Self {
            version: challenger.version.clone(),
            feature_schema_hash: feature_schema_hash(),
            trained_at: challenger.trained_at,
            training_samples: challenger.training_samples,
            forest: challenger.forest.clone(),
            momentum: challenger.momentum.clone(),
        }
    }

    pub fn into_predictor(self, settings: &EnsembleSettings) -> MultiOutputPredictor {
        MultiOutputPredictor::from_trained(self.version, self.forest, self.momentum, settings)
    }
}

pub fn save_model_file(path: &Path, file: &ModelFile) -> Result<()> {
    let json = serde_json::to_string_pretty(file).context("Failed to serialize model file")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create model dir {}", parent.display()))?;
        }
    }
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write model file {}", path.display()))?;
    info!("Saved model {} to {}", file.version, path.display());
    Ok(())
}

pub fn load_model_file(path: &Path) -> Result<Option<ModelFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read model file {}", path.display()))?;
    let file: ModelFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse model file {}", path.display()))?;
    Ok(Some(file))
}

/// Load the persisted model, falling back to heuristic rules when the
/// file is absent or was trained on a different feature schema.
pub fn load_predictor(path: &Path, settings: &EnsembleSettings) -> Result<MultiOutputPredictor> {
    match load_model_file(path)? {
        Some(file) if file.feature_schema_hash == feature_schema_hash() => {
            info!(
                "Loaded model {} (trained {}, {} samples)",
                file.version, file.trained_at, file.training_samples
            );
            Ok(file.into_predictor(settings))
        }
        Some(file) => {
            warn!(
                "Model {} was trained on schema {} but current schema is {}; using heuristic rules",
                file.version,
                file.feature_schema_hash,
                feature_schema_hash()
            );
            Ok(MultiOutputPredictor::heuristic_only(
                settings.thresholds.clone(),
            ))
        }
        None => {
            info!(
                "No model file at {}; starting with heuristic rules",
                path.display()
            );
            Ok(MultiOutputPredictor::heuristic_only(
                settings.thresholds.clone(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::COLD_START_VERSION;
    use crate::forest::ForestSettings;
    use crate::momentum::MomentumSettings;
    use crate::training::{HorizonTargets, TrainingSet};
    use common::{Direction, FeatureRecord, Horizon};
    use std::path::PathBuf;

    fn tiny_model_file() -> ModelFile {
        let mut features = Vec::new();
        let mut classes = Vec::new();
        let mut returns = Vec::new();
        for i in 0..30 {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            let mut row = vec![0.0; FeatureRecord::FEATURE_WIDTH];
            row[0] = sign * (1.0 + (i % 3) as f64 * 0.1);
            features.push(row);
            classes.push(if sign > 0.0 {
                Direction::Up.class_index()
            } else {
                Direction::Down.class_index()
            });
            returns.push(sign * 1.5);
        }
        let targets = Horizon::ALL
            .iter()
            .map(|&horizon| HorizonTargets {
                horizon,
                classes: classes.clone(),
                returns_pct: returns.clone(),
            })
            .collect();
        let set = TrainingSet { features, targets };

        let settings = ForestSettings {
            n_trees: 8,
            ..ForestSettings::default()
        };
        ModelFile {
            version: "v20240101000000".to_string(),
            feature_schema_hash: feature_schema_hash(),
            trained_at: Utc::now(),
            training_samples: set.len(),
            forest: ForestFamily::fit(&set, &settings).unwrap(),
            momentum: MomentumFamily::fit(&set, &MomentumSettings::default()).unwrap(),
        }
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn model_file_round_trips() {
        let path = scratch_path("model-round-trip");
        let file = tiny_model_file();
        save_model_file(&path, &file).unwrap();

        let loaded = load_model_file(&path).unwrap().unwrap();
        assert_eq!(loaded.version, file.version);
        assert_eq!(loaded.training_samples, file.training_samples);

        let predictor = loaded.into_predictor(&EnsembleSettings::default());
        assert_eq!(predictor.version(), "v20240101000000");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_loads_heuristic_predictor() {
        let path = scratch_path("model-missing");
        let predictor = load_predictor(&path, &EnsembleSettings::default()).unwrap();
        assert_eq!(predictor.version(), COLD_START_VERSION);
    }

    #[test]
    fn schema_drift_falls_back_to_heuristic() {
        let path = scratch_path("model-drift");
        let mut file = tiny_model_file();
        file.feature_schema_hash = "deadbeefdeadbeef".to_string();
        save_model_file(&path, &file).unwrap();

        let predictor = load_predictor(&path, &EnsembleSettings::default()).unwrap();
        assert_eq!(predictor.version(), COLD_START_VERSION);

        std::fs::remove_file(&path).unwrap();
    }
}
