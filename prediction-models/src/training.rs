// Challenger training
// Turns paired feature/outcome samples into labelled matrices, enforces
// the minimum-history floor, and fits the learned families on the older
// split while reserving the newest tail for evaluation.

use crate::family::ModelError;
use crate::forest::{ForestFamily, ForestSettings};
use crate::momentum::{MomentumFamily, MomentumSettings};
use chrono::{DateTime, Utc};
use common::{Direction, Horizon, PairedSample, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Per-horizon labels aligned row-for-row with `TrainingSet::features`
#[derive(Debug, Clone)]
pub struct HorizonTargets {
    pub horizon: Horizon,
    /// Direction class indices (`Direction::class_index` order)
    pub classes: Vec<usize>,
    /// Realized signed returns in percent
    pub returns_pct: Vec<f64>,
}

/// Feature matrix plus one target block per horizon
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<HorizonTargets>,
}

impl TrainingSet {
    pub fn from_samples(samples: &[PairedSample], flat_band_pct: f64) -> Self {
        let features = samples.iter().map(|s| s.feature.vector()).collect();
        let targets = Horizon::ALL
            .iter()
            .map(|&horizon| {
                let mut classes = Vec::with_capacity(samples.len());
                let mut returns_pct = Vec::with_capacity(samples.len());
                for sample in samples {
                    let ret = sample.return_for(horizon);
                    classes.push(Direction::from_return(ret, flat_band_pct).class_index());
                    returns_pct.push(ret);
                }
                HorizonTargets {
                    horizon,
                    classes,
                    returns_pct,
                }
            })
            .collect();
        Self { features, targets }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn targets_for(&self, horizon: Horizon) -> Option<&HorizonTargets> {
        self.targets.iter().find(|t| t.horizon == horizon)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Minimum paired samples before a challenger may be fitted
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,
    /// Fraction of the newest samples withheld for evaluation
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    /// Returns within +/- this percent label as FLAT
    #[serde(default = "default_flat_band_pct")]
    pub flat_band_pct: f64,
    #[serde(default)]
    pub forest: ForestSettings,
    #[serde(default)]
    pub momentum: MomentumSettings,
}

fn default_min_training_samples() -> usize {
    50
}

fn default_holdout_fraction() -> f64 {
    0.2
}

fn default_flat_band_pct() -> f64 {
    0.2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_training_samples: default_min_training_samples(),
            holdout_fraction: default_holdout_fraction(),
            flat_band_pct: default_flat_band_pct(),
            forest: ForestSettings::default(),
            momentum: MomentumSettings::default(),
        }
    }
}

/// Freshly trained families awaiting evaluation against the active model
#[derive(Debug)]
pub struct Challenger {
    pub version: String,
    pub trained_at: DateTime<Utc>,
    /// Rows the families were fitted on, holdout excluded
    pub training_samples: usize,
    pub forest: ForestFamily,
    pub momentum: MomentumFamily,
    /// Newest samples, never seen during fitting
    pub holdout: Vec<PairedSample>,
}

/// Fit a challenger on all but the newest samples.
///
/// The split is by feature timestamp, oldest first, so evaluation always
/// happens on data the model could not have seen.
pub fn train_challenger(
    samples: &[PairedSample],
    config: &TrainingConfig,
    trained_at: DateTime<Utc>,
) -> PipelineResult<Challenger> {
    if samples.len() < config.min_training_samples {
        return Err(PipelineError::InsufficientData {
            required: config.min_training_samples,
            available: samples.len(),
        });
    }

    let mut ordered: Vec<PairedSample> = samples.to_vec();
    ordered.sort_by_key(|s| s.feature.timestamp);

    let holdout_len = holdout_len(ordered.len(), config.holdout_fraction);
    let split_at = ordered.len() - holdout_len;
    let (train, holdout) = ordered.split_at(split_at);

    let set = TrainingSet::from_samples(train, config.flat_band_pct);
    if set.is_empty() {
        return Err(ModelError::TrainingFailed("no training rows after split".to_string()).into());
    }

    info!(
        "Training challenger on {} samples ({} held out for evaluation)",
        train.len(),
        holdout.len()
    );

    let forest = ForestFamily::fit(&set, &config.forest)?;
    let momentum = MomentumFamily::fit(&set, &config.momentum)?;
    let version = format!("v{}", trained_at.format("%Y%m%d%H%M%S"));

    Ok(Challenger {
        version,
        trained_at,
        training_samples: train.len(),
        forest,
        momentum,
        holdout: holdout.to_vec(),
    })
}

fn holdout_len(total: usize, fraction: f64) -> usize {
    if total < 2 {
        return 0;
    }
    let raw = (total as f64 * fraction.clamp(0.0, 0.5)).round() as usize;
    raw.clamp(1, total / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::FeatureRecord;

    fn sample(idx: usize, ret: f64) -> PairedSample {
        let ts = Utc
            .with_ymd_and_hms(2024, 1, 1, 14, 30, 0)
            .unwrap()
            + chrono::Duration::days(idx as i64);
        let mut feature = FeatureRecord::neutral("AAPL", ts);
        feature.rsi = 30.0 + (idx % 40) as f64;
        feature.sentiment_score = if ret > 0.0 { 0.5 } else { -0.5 };
        PairedSample {
            feature,
            return_1h: ret * 0.3,
            return_4h: ret * 0.6,
            return_1d: ret,
        }
    }

    fn samples(n: usize) -> Vec<PairedSample> {
        (0..n)
            .map(|i| sample(i, if i % 2 == 0 { 1.5 } else { -1.5 }))
            .collect()
    }

    #[test]
    fn below_floor_is_rejected_with_counts() {
        let err = train_challenger(&samples(49), &TrainingConfig::default(), Utc::now())
            .unwrap_err();
        match err {
            PipelineError::InsufficientData {
                required,
                available,
            } => {
                assert_eq!(required, 50);
                assert_eq!(available, 49);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exactly_at_floor_trains() {
        let mut config = TrainingConfig::default();
        config.forest.n_trees = 10;
        let challenger = train_challenger(&samples(50), &config, Utc::now()).unwrap();
        assert_eq!(challenger.training_samples + challenger.holdout.len(), 50);
        assert_eq!(challenger.holdout.len(), 10);
    }

    #[test]
    fn holdout_is_the_newest_tail() {
        let mut config = TrainingConfig::default();
        config.forest.n_trees = 10;
        let challenger = train_challenger(&samples(60), &config, Utc::now()).unwrap();

        let newest_holdout = challenger
            .holdout
            .iter()
            .map(|s| s.feature.timestamp)
            .min()
            .unwrap();
        // Every holdout row is newer than every training row, which the
        // test reconstructs from the original ordering.
        let all = samples(60);
        let mut sorted: Vec<_> = all.iter().map(|s| s.feature.timestamp).collect();
        sorted.sort();
        let train_cutoff = sorted[60 - challenger.holdout.len() - 1];
        assert!(newest_holdout > train_cutoff);
    }

    #[test]
    fn version_encodes_training_time() {
        let trained_at = Utc.with_ymd_and_hms(2024, 3, 15, 21, 5, 9).unwrap();
        let mut config = TrainingConfig::default();
        config.forest.n_trees = 10;
        let challenger = train_challenger(&samples(50), &config, trained_at).unwrap();
        assert_eq!(challenger.version, "v20240315210509");
    }

    #[test]
    fn flat_band_labels_small_returns_flat() {
        let set = TrainingSet::from_samples(&[sample(0, 0.1)], 0.2);
        let targets = set.targets_for(Horizon::OneDay).unwrap();
        assert_eq!(targets.classes[0], Direction::Flat.class_index());

        let set = TrainingSet::from_samples(&[sample(0, 0.9)], 0.2);
        let targets = set.targets_for(Horizon::OneDay).unwrap();
        assert_eq!(targets.classes[0], Direction::Up.class_index());
    }
}
