// Multi-output prediction ensemble
// Three model families vote per horizon; the blended view maps through a
// deterministic decision table to a trading action.

pub mod ensemble;
pub mod family;
pub mod forest;
pub mod heuristic;
pub mod momentum;
pub mod persistence;
pub mod training;

pub use ensemble::{
    decide_action, ActionThresholds, EnsembleSettings, MultiOutputPredictor, COLD_START_VERSION,
};
pub use family::{FamilyForecast, ModelError, ModelFamily};
pub use forest::{ForestFamily, ForestSettings};
pub use heuristic::HeuristicFamily;
pub use momentum::{MomentumFamily, MomentumSettings};
pub use persistence::{load_model_file, load_predictor, save_model_file, ModelFile};
pub use training::{train_challenger, Challenger, HorizonTargets, TrainingConfig, TrainingSet};
