// Shared domain model for the trading signal pipeline
// Types, error taxonomy, the canonical return formula, and the embedded store

pub mod error;
pub mod returns;
pub mod store;
pub mod types;

pub use error::{IntegrityCheck, PipelineError, PipelineResult, Violation, ViolationReport};
pub use returns::{position_return_pct, return_pct};
pub use store::{PairedSample, PendingOutcome, ReplayRow, Store};
pub use types::{
    feature_schema_hash, Direction, EveningSummary, FeatureRecord, Horizon, HorizonForecast,
    HorizonMetrics, HorizonOutcome, ModelStatus, ModelVersionRecord, MorningSummary, Outcome,
    Phase, PhaseCompletion, Prediction, SymbolFailure, TradingAction,
};
