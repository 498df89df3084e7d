// Momentum model family
// Multinomial logistic head for direction plus a linear head for move
// size, both trained by batch gradient descent on standardized features.

use crate::family::{FamilyForecast, ModelError, ModelFamily};
use crate::training::TrainingSet;
use common::Horizon;
use serde::{Deserialize, Serialize};

const N_CLASSES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumSettings {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_max_iter() -> usize {
    300
}

fn default_tolerance() -> f64 {
    1e-5
}

impl Default for MomentumSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            max_iter: default_max_iter(),
            tolerance: default_tolerance(),
        }
    }
}

/// Per-feature z-score parameters learned on the training matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Standardizer {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Standardizer {
    fn fit(features: &[Vec<f64>]) -> Self {
        let n = features.len() as f64;
        let width = features[0].len();
        let mut means = vec![0.0; width];
        for row in features {
            for (m, &v) in means.iter_mut().zip(row.iter()) {
                *m += v;
            }
        }
        for m in means.iter_mut() {
            *m /= n;
        }

        let mut stds = vec![0.0; width];
        for row in features {
            for ((s, &v), &m) in stds.iter_mut().zip(row.iter()).zip(means.iter()) {
                *s += (v - m).powi(2);
            }
        }
        for s in stds.iter_mut() {
            *s = (*s / n).sqrt();
            // Constant columns pass through unscaled
            if *s < 1e-9 {
                *s = 1.0;
            }
        }

        Self { means, stds }
    }

    fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter())
            .zip(self.stds.iter())
            .map(|((&v, &m), &s)| (v - m) / s)
            .collect()
    }

    fn width(&self) -> usize {
        self.means.len()
    }
}

/// Multinomial logistic regression weights, one row per class
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SoftmaxHead {
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

impl SoftmaxHead {
    fn fit(features: &[Vec<f64>], classes: &[usize], settings: &MomentumSettings) -> Self {
        let width = features[0].len();
        let mut head = Self {
            weights: vec![vec![0.0; width]; N_CLASSES],
            biases: vec![0.0; N_CLASSES],
        };
        let n = features.len() as f64;

        for _ in 0..settings.max_iter {
            let mut grad_w = vec![vec![0.0; width]; N_CLASSES];
            let mut grad_b = vec![0.0; N_CLASSES];

            for (row, &class) in features.iter().zip(classes.iter()) {
                let probs = head.probs_row(row);
                for c in 0..N_CLASSES {
                    // One-hot residual drives both gradients
                    let err = probs[c] - if c == class { 1.0 } else { 0.0 };
                    grad_b[c] += err;
                    for (g, &x) in grad_w[c].iter_mut().zip(row.iter()) {
                        *g += err * x;
                    }
                }
            }

            let mut total_step = 0.0;
            for c in 0..N_CLASSES {
                for (w, g) in head.weights[c].iter_mut().zip(grad_w[c].iter()) {
                    let step = settings.learning_rate * g / n;
                    *w -= step;
                    total_step += step.abs();
                }
                let step = settings.learning_rate * grad_b[c] / n;
                head.biases[c] -= step;
                total_step += step.abs();
            }

            if total_step < settings.tolerance {
                break;
            }
        }

        head
    }

    fn probs_row(&self, row: &[f64]) -> [f64; N_CLASSES] {
        let mut scores = [0.0; N_CLASSES];
        for (c, score) in scores.iter_mut().enumerate() {
            *score = self.biases[c]
                + self.weights[c]
                    .iter()
                    .zip(row.iter())
                    .map(|(&w, &x)| w * x)
                    .sum::<f64>();
        }
        softmax(scores)
    }
}

/// Numerically stable softmax via max subtraction
fn softmax(scores: [f64; N_CLASSES]) -> [f64; N_CLASSES] {
    let max = scores.iter().fold(f64::MIN, |acc, &s| acc.max(s));
    let mut out = [0.0; N_CLASSES];
    let mut total = 0.0;
    for (o, &s) in out.iter_mut().zip(scores.iter()) {
        *o = (s - max).exp();
        total += *o;
    }
    for o in out.iter_mut() {
        *o /= total;
    }
    out
}

/// Linear regression head trained with squared-loss gradient descent
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MagnitudeHead {
    weights: Vec<f64>,
    bias: f64,
}

impl MagnitudeHead {
    fn fit(features: &[Vec<f64>], targets: &[f64], settings: &MomentumSettings) -> Self {
        let width = features[0].len();
        let mut head = Self {
            weights: vec![0.0; width],
            bias: 0.0,
        };
        let n = features.len() as f64;
        // Squared loss tolerates a smaller step than the logistic head
        let learning_rate = settings.learning_rate * 0.2;

        for _ in 0..settings.max_iter {
            let mut grad_w = vec![0.0; width];
            let mut grad_b = 0.0;

            for (row, &y) in features.iter().zip(targets.iter()) {
                let err = head.predict_row(row) - y;
                grad_b += err;
                for (g, &x) in grad_w.iter_mut().zip(row.iter()) {
                    *g += err * x;
                }
            }

            let mut total_step = 0.0;
            for (w, g) in head.weights.iter_mut().zip(grad_w.iter()) {
                let step = learning_rate * g / n;
                *w -= step;
                total_step += step.abs();
            }
            let step = learning_rate * grad_b / n;
            head.bias -= step;
            total_step += step.abs();

            if total_step < settings.tolerance {
                break;
            }
        }

        head
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(row.iter())
                .map(|(&w, &x)| w * x)
                .sum::<f64>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HorizonMomentum {
    horizon: Horizon,
    softmax: SoftmaxHead,
    magnitude: MagnitudeHead,
}

/// Momentum family: linear decision surfaces over standardized features,
/// one softmax and one magnitude head per horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumFamily {
    scaler: Standardizer,
    horizons: Vec<HorizonMomentum>,
}

impl MomentumFamily {
    pub fn fit(set: &TrainingSet, settings: &MomentumSettings) -> Result<Self, ModelError> {
        if set.is_empty() {
            return Err(ModelError::TrainingFailed(
                "empty training set".to_string(),
            ));
        }

        let scaler = Standardizer::fit(&set.features);
        let scaled: Vec<Vec<f64>> = set
            .features
            .iter()
            .map(|row| scaler.transform_row(row))
            .collect();

        let mut horizons = Vec::with_capacity(set.targets.len());
        for targets in &set.targets {
            if targets.classes.len() != scaled.len() {
                return Err(ModelError::InvalidData(format!(
                    "horizon {} has {} labels for {} rows",
                    targets.horizon,
                    targets.classes.len(),
                    scaled.len()
                )));
            }
            let softmax = SoftmaxHead::fit(&scaled, &targets.classes, settings);
            let magnitude = MagnitudeHead::fit(&scaled, &targets.returns_pct, settings);
            horizons.push(HorizonMomentum {
                horizon: targets.horizon,
                softmax,
                magnitude,
            });
        }

        Ok(Self { scaler, horizons })
    }
}

impl ModelFamily for MomentumFamily {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn forecast(&self, features: &[f64], horizon: Horizon) -> Result<FamilyForecast, ModelError> {
        if features.len() != self.scaler.width() {
            return Err(ModelError::InvalidData(format!(
                "expected {} features, got {}",
                self.scaler.width(),
                features.len()
            )));
        }
        let heads = self
            .horizons
            .iter()
            .find(|h| h.horizon == horizon)
            .ok_or(ModelError::NotTrained(horizon))?;

        let row = self.scaler.transform_row(features);
        let class_probs = heads.softmax.probs_row(&row);
        let magnitude_pct = heads.magnitude.predict_row(&row);
        Ok(FamilyForecast::new(class_probs, magnitude_pct))
    }
}
