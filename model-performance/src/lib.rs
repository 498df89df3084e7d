// Model performance
// Holdout evaluation with a promotion gate, and historical replay of
// recorded predictions against realized outcomes.

pub mod backtest;
pub mod tracker;

pub use backtest::{evaluate_rows, ActionBreakdown, BacktestEngine, BacktestSummary};
pub use tracker::{
    direction_significance, evaluate_predictor, ModelPerformanceTracker, PromotionDecision,
    PromotionGate,
};
