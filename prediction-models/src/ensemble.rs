// Ensemble predictor
// Blends family class distributions with fixed vote weights, then maps
// the blended view through the action decision table.

use crate::family::{normalize_probs, ModelFamily};
use crate::forest::ForestFamily;
use crate::heuristic::HeuristicFamily;
use crate::momentum::MomentumFamily;
use crate::training::Challenger;
use common::{
    Direction, FeatureRecord, Horizon, HorizonForecast, PipelineError, PipelineResult, Prediction,
    TradingAction,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version label used before any trained model has been promoted
pub const COLD_START_VERSION: &str = "heuristic-v0";

/// Confidence and magnitude gates for the action decision table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionThresholds {
    #[serde(default = "default_strong_confidence")]
    pub strong_confidence: f64,
    #[serde(default = "default_strong_magnitude_pct")]
    pub strong_magnitude_pct: f64,
    #[serde(default = "default_base_confidence")]
    pub base_confidence: f64,
    #[serde(default = "default_base_magnitude_pct")]
    pub base_magnitude_pct: f64,
}

fn default_strong_confidence() -> f64 {
    0.8
}

fn default_strong_magnitude_pct() -> f64 {
    2.0
}

fn default_base_confidence() -> f64 {
    0.6
}

fn default_base_magnitude_pct() -> f64 {
    0.5
}

impl Default for ActionThresholds {
    fn default() -> Self {
        Self {
            strong_confidence: default_strong_confidence(),
            strong_magnitude_pct: default_strong_magnitude_pct(),
            base_confidence: default_base_confidence(),
            base_magnitude_pct: default_base_magnitude_pct(),
        }
    }
}

/// Vote weights for each family plus the shared action gates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleSettings {
    #[serde(default = "default_heuristic_weight")]
    pub heuristic_weight: f64,
    #[serde(default = "default_learned_weight")]
    pub forest_weight: f64,
    #[serde(default = "default_learned_weight")]
    pub momentum_weight: f64,
    #[serde(default)]
    pub thresholds: ActionThresholds,
}

fn default_heuristic_weight() -> f64 {
    0.5
}

fn default_learned_weight() -> f64 {
    1.0
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            heuristic_weight: default_heuristic_weight(),
            forest_weight: default_learned_weight(),
            momentum_weight: default_learned_weight(),
            thresholds: ActionThresholds::default(),
        }
    }
}

/// Deterministic map from the longest-horizon view to a trading action.
///
/// FLAT never trades. Directional calls need both conviction and a move
/// worth trading; the strong tier needs more of each.
pub fn decide_action(
    direction: Direction,
    confidence: f64,
    magnitude_pct: f64,
    thresholds: &ActionThresholds,
) -> TradingAction {
    let strong = confidence >= thresholds.strong_confidence
        && magnitude_pct.abs() >= thresholds.strong_magnitude_pct;
    let actionable = confidence >= thresholds.base_confidence
        && magnitude_pct.abs() >= thresholds.base_magnitude_pct;

    match direction {
        Direction::Flat => TradingAction::Hold,
        Direction::Up if strong => TradingAction::StrongBuy,
        Direction::Up if actionable => TradingAction::Buy,
        Direction::Down if strong => TradingAction::StrongSell,
        Direction::Down if actionable => TradingAction::Sell,
        _ => TradingAction::Hold,
    }
}

/// Multi-horizon predictor backed by weighted family voting.
///
/// Immutable after construction; the morning batch shares one instance
/// across concurrent symbol tasks behind an `Arc`.
pub struct MultiOutputPredictor {
    version: String,
    families: Vec<(Box<dyn ModelFamily>, f64)>,
    thresholds: ActionThresholds,
}

impl MultiOutputPredictor {
    /// Cold-start predictor: heuristic rules only, no training required
    pub fn heuristic_only(thresholds: ActionThresholds) -> Self {
        Self {
            version: COLD_START_VERSION.to_string(),
            families: vec![(Box::new(HeuristicFamily::new()), 1.0)],
            thresholds,
        }
    }

    /// Full ensemble around a freshly trained challenger
    pub fn from_challenger(challenger: &Challenger, settings: &EnsembleSettings) -> Self {
        Self::from_trained(
            challenger.version.clone(),
            challenger.forest.clone(),
            challenger.momentum.clone(),
            settings,
        )
    }

    /// Full ensemble from previously persisted families
    pub fn from_trained(
        version: String,
        forest: ForestFamily,
        momentum: MomentumFamily,
        settings: &EnsembleSettings,
    ) -> Self {
        Self {
            version,
            families: vec![
                (
                    Box::new(HeuristicFamily::new()) as Box<dyn ModelFamily>,
                    settings.heuristic_weight,
                ),
                (Box::new(forest), settings.forest_weight),
                (Box::new(momentum), settings.momentum_weight),
            ],
            thresholds: settings.thresholds.clone(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn family_names(&self) -> Vec<&'static str> {
        self.families.iter().map(|(f, _)| f.name()).collect()
    }

    /// Forecast every horizon for one feature record and derive the action.
    ///
    /// `created_at` is pinned to the feature timestamp so a prediction can
    /// never claim to be older than the evidence it was built from.
    pub fn predict(&self, feature: &FeatureRecord) -> PipelineResult<Prediction> {
        let features = feature.vector();
        let mut forecasts = Vec::with_capacity(Horizon::ALL.len());

        for &horizon in Horizon::ALL.iter() {
            let mut mass = [0.0_f64; 3];
            let mut magnitude_acc = 0.0;
            let mut weight_acc = 0.0;

            for (family, weight) in &self.families {
                let vote = family.forecast(&features, horizon)?;
                for (m, p) in mass.iter_mut().zip(vote.class_probs.iter()) {
                    *m += p * weight;
                }
                magnitude_acc += vote.magnitude_pct * weight;
                weight_acc += weight;
            }

            if weight_acc <= f64::EPSILON {
                return Err(PipelineError::Model(
                    "ensemble has no weighted families".to_string(),
                ));
            }

            normalize_probs(&mut mass);
            let mut winner = 0;
            for idx in 1..mass.len() {
                if mass[idx] > mass[winner] {
                    winner = idx;
                }
            }

            forecasts.push(HorizonForecast {
                horizon,
                direction: Direction::from_class_index(winner),
                magnitude_pct: magnitude_acc / weight_acc,
                confidence: mass[winner],
            });
        }

        let decisive = forecasts
            .iter()
            .find(|f| f.horizon == Horizon::LONGEST)
            .ok_or_else(|| PipelineError::Model("missing longest-horizon forecast".to_string()))?;
        let optimal_action = decide_action(
            decisive.direction,
            decisive.confidence,
            decisive.magnitude_pct,
            &self.thresholds,
        );
        let avg_confidence =
            forecasts.iter().map(|f| f.confidence).sum::<f64>() / forecasts.len() as f64;

        Ok(Prediction {
            id: Uuid::new_v4(),
            feature_id: feature.id,
            symbol: feature.symbol.clone(),
            prediction_date: feature.trading_date(),
            created_at: feature.timestamp,
            model_version: self.version.clone(),
            forecasts,
            optimal_action,
            avg_confidence,
        })
    }
}
