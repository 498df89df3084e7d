// Model family abstraction
// Every forecasting approach plugs in through the same trait so the
// ensemble can treat rule-based and learned models uniformly.

use common::{Direction, Horizon, PipelineError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while fitting or querying a model family
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    #[error("Prediction failed: {0}")]
    PredictionFailed(String),

    #[error("Invalid input data: {0}")]
    InvalidData(String),

    #[error("Model not trained for horizon {0}")]
    NotTrained(Horizon),
}

impl From<ModelError> for PipelineError {
    fn from(err: ModelError) -> Self {
        PipelineError::Model(err.to_string())
    }
}

/// Single-horizon output of one model family.
///
/// Families report a full class distribution rather than a bare label so
/// the ensemble can blend opinions before committing to a direction.
/// Index order follows `Direction::class_index`: DOWN, FLAT, UP.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FamilyForecast {
    pub class_probs: [f64; 3],
    /// Signed expected move over the horizon, in percent
    pub magnitude_pct: f64,
}

impl FamilyForecast {
    pub fn new(class_probs: [f64; 3], magnitude_pct: f64) -> Self {
        Self {
            class_probs,
            magnitude_pct,
        }
    }

    /// Most probable direction under this family's distribution
    pub fn direction(&self) -> Direction {
        let mut best = 0;
        for idx in 1..self.class_probs.len() {
            if self.class_probs[idx] > self.class_probs[best] {
                best = idx;
            }
        }
        Direction::from_class_index(best)
    }

    /// Probability mass on the winning class
    pub fn confidence(&self) -> f64 {
        self.class_probs
            .iter()
            .fold(f64::MIN, |acc, p| acc.max(*p))
    }
}

/// One forecasting approach inside the ensemble.
///
/// Implementations must be immutable once constructed: the morning batch
/// shares a single predictor across concurrent per-symbol tasks.
pub trait ModelFamily: Send + Sync {
    /// Short stable identifier used in logs and vote breakdowns
    fn name(&self) -> &'static str;

    /// Forecast one horizon from a full feature vector
    fn forecast(&self, features: &[f64], horizon: Horizon) -> Result<FamilyForecast, ModelError>;
}

/// Normalize a class mass vector in place; uniform fallback when empty
pub(crate) fn normalize_probs(probs: &mut [f64; 3]) {
    let total: f64 = probs.iter().sum();
    if total > f64::EPSILON {
        for p in probs.iter_mut() {
            *p /= total;
        }
    } else {
        for p in probs.iter_mut() {
            *p = 1.0 / 3.0;
        }
    }
}
