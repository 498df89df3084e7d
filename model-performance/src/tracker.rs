// Model performance tracking
// Scores a freshly trained challenger on its holdout tail and either
// promotes it to active or records the rejection. A rejected challenger
// never touches the currently active version.

use chrono::{DateTime, Utc};
use common::{
    feature_schema_hash, Direction, Horizon, HorizonMetrics, ModelStatus, ModelVersionRecord,
    PairedSample, PipelineResult, Store,
};
use prediction_models::{Challenger, EnsembleSettings, MultiOutputPredictor};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{info, warn};

/// Floors a challenger must clear on the decisive horizon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionGate {
    #[serde(default = "default_min_direction_accuracy")]
    pub min_direction_accuracy: f64,
    #[serde(default = "default_max_magnitude_mae_pct")]
    pub max_magnitude_mae_pct: f64,
}

fn default_min_direction_accuracy() -> f64 {
    0.60
}

fn default_max_magnitude_mae_pct() -> f64 {
    2.0
}

impl Default for PromotionGate {
    fn default() -> Self {
        Self {
            min_direction_accuracy: default_min_direction_accuracy(),
            max_magnitude_mae_pct: default_max_magnitude_mae_pct(),
        }
    }
}

/// What happened to a challenger after holdout evaluation
#[derive(Debug)]
pub enum PromotionDecision {
    Promoted(ModelVersionRecord),
    Rejected {
        version: String,
        reason: String,
        metrics: Vec<HorizonMetrics>,
    },
}

impl PromotionDecision {
    pub fn promoted_version(&self) -> Option<&str> {
        match self {
            PromotionDecision::Promoted(record) => Some(&record.version),
            PromotionDecision::Rejected { .. } => None,
        }
    }
}

pub struct ModelPerformanceTracker {
    store: Store,
    gate: PromotionGate,
}

impl ModelPerformanceTracker {
    pub fn new(store: Store, gate: PromotionGate) -> Self {
        Self { store, gate }
    }

    /// Evaluate the challenger on its holdout and apply the promotion gate.
    ///
    /// Promotion swaps the single active version inside one transaction;
    /// rejection appends a rejected row and leaves the active model alone.
    pub async fn consider(
        &self,
        challenger: &Challenger,
        settings: &EnsembleSettings,
        flat_band_pct: f64,
        now: DateTime<Utc>,
    ) -> PipelineResult<PromotionDecision> {
        let predictor = MultiOutputPredictor::from_challenger(challenger, settings);
        let metrics = evaluate_predictor(&predictor, &challenger.holdout, flat_band_pct)?;

        for m in &metrics {
            info!(
                "Holdout {}: accuracy {:.3}, MAE {:.3}%, n={}, p={:.4}",
                m.horizon.label(),
                m.direction_accuracy,
                m.magnitude_mae,
                m.samples,
                direction_significance(m.direction_accuracy, m.samples)
            );
        }

        let mut record = ModelVersionRecord {
            version: challenger.version.clone(),
            status: ModelStatus::Active,
            trained_at: challenger.trained_at,
            training_samples: challenger.training_samples as i64,
            feature_schema_hash: feature_schema_hash(),
            metrics: metrics.clone(),
            created_at: now,
        };

        match gate_check(&self.gate, &metrics) {
            Ok(()) => {
                self.store.promote_model_version(&record).await?;
                info!("Promoted model {} to active", record.version);
                Ok(PromotionDecision::Promoted(record))
            }
            Err(reason) => {
                record.status = ModelStatus::Rejected;
                self.store.insert_model_version(&record).await?;
                warn!("Rejected model {}: {}", record.version, reason);
                Ok(PromotionDecision::Rejected {
                    version: record.version,
                    reason,
                    metrics,
                })
            }
        }
    }
}

/// Score a predictor horizon-by-horizon against held-out realized returns
pub fn evaluate_predictor(
    predictor: &MultiOutputPredictor,
    holdout: &[PairedSample],
    flat_band_pct: f64,
) -> PipelineResult<Vec<HorizonMetrics>> {
    let mut correct = [0usize; 3];
    let mut abs_err = [0.0f64; 3];
    let mut counted = [0usize; 3];

    for sample in holdout {
        let prediction = predictor.predict(&sample.feature)?;
        for (idx, &horizon) in Horizon::ALL.iter().enumerate() {
            let forecast = match prediction.forecast(horizon) {
                Some(f) => f,
                None => continue,
            };
            let realized = sample.return_for(horizon);
            if forecast.direction == Direction::from_return(realized, flat_band_pct) {
                correct[idx] += 1;
            }
            abs_err[idx] += (forecast.magnitude_pct - realized).abs();
            counted[idx] += 1;
        }
    }

    Ok(Horizon::ALL
        .iter()
        .enumerate()
        .map(|(idx, &horizon)| {
            let n = counted[idx];
            HorizonMetrics {
                horizon,
                direction_accuracy: if n > 0 { correct[idx] as f64 / n as f64 } else { 0.0 },
                magnitude_mae: if n > 0 { abs_err[idx] / n as f64 } else { 0.0 },
                samples: n as i64,
            }
        })
        .collect())
}

/// Gate on the decisive horizon only; the shorter horizons are reported
/// but do not block promotion.
fn gate_check(gate: &PromotionGate, metrics: &[HorizonMetrics]) -> Result<(), String> {
    let decisive = metrics
        .iter()
        .find(|m| m.horizon == Horizon::LONGEST)
        .ok_or_else(|| format!("no {} metrics", Horizon::LONGEST.label()))?;

    if decisive.samples == 0 {
        return Err(format!("no holdout samples at {}", Horizon::LONGEST.label()));
    }
    if decisive.direction_accuracy < gate.min_direction_accuracy {
        return Err(format!(
            "direction accuracy {:.3} below floor {:.2}",
            decisive.direction_accuracy, gate.min_direction_accuracy
        ));
    }
    if decisive.magnitude_mae > gate.max_magnitude_mae_pct {
        return Err(format!(
            "magnitude MAE {:.3}% above ceiling {:.2}%",
            decisive.magnitude_mae, gate.max_magnitude_mae_pct
        ));
    }
    Ok(())
}

/// One-sided p-value that the observed accuracy beats 3-class chance
pub fn direction_significance(direction_accuracy: f64, samples: i64) -> f64 {
    if samples <= 0 {
        return 1.0;
    }
    let chance = 1.0 / 3.0;
    let std_err = (chance * (1.0 - chance) / samples as f64).sqrt();
    if std_err == 0.0 {
        return 1.0;
    }
    let z = (direction_accuracy - chance) / std_err;
    match Normal::new(0.0, 1.0) {
        Ok(normal) => 1.0 - normal.cdf(z),
        Err(_) => 1.0,
    }
}
