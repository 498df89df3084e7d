use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Horizon, Phase};

/// The five temporal-integrity checks plus the phase-order precondition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityCheck {
    DuplicatePredictions,
    FeatureOutcomeParity,
    FutureLeakage,
    SchemaPresence,
    ReferentialIntegrity,
    PhaseOrder,
}

impl IntegrityCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityCheck::DuplicatePredictions => "duplicate_predictions",
            IntegrityCheck::FeatureOutcomeParity => "feature_outcome_parity",
            IntegrityCheck::FutureLeakage => "future_leakage",
            IntegrityCheck::SchemaPresence => "schema_presence",
            IntegrityCheck::ReferentialIntegrity => "referential_integrity",
            IntegrityCheck::PhaseOrder => "phase_order",
        }
    }
}

/// A single failed integrity check with the evidence that failed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub check: IntegrityCheck,
    pub affected_rows: i64,
    pub detail: String,
}

/// Structured result of a guard pass. Any violation aborts the phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationReport {
    pub phase: Phase,
    pub checked_at: DateTime<Utc>,
    pub violations: Vec<Violation>,
}

impl ViolationReport {
    pub fn clean(phase: Phase) -> ViolationReport {
        ViolationReport {
            phase,
            checked_at: Utc::now(),
            violations: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn push(&mut self, check: IntegrityCheck, affected_rows: i64, detail: impl Into<String>) {
        self.violations.push(Violation {
            check,
            affected_rows,
            detail: detail.into(),
        });
    }
}

impl std::fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.passed() {
            return write!(f, "{} guard passed", self.phase);
        }
        write!(f, "{} guard failed:", self.phase)?;
        for violation in &self.violations {
            write!(
                f,
                " [{} rows={} {}]",
                violation.check.as_str(),
                violation.affected_rows,
                violation.detail
            )?;
        }
        Ok(())
    }
}

/// Typed failure taxonomy shared across the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("incomplete signal for {symbol}: {reason}")]
    IncompleteSignal { symbol: String, reason: String },

    #[error("insufficient training data: {available} paired samples, {required} required")]
    InsufficientData { required: usize, available: usize },

    #[error("stale price for {symbol} at horizon {horizon}")]
    StalePrice { symbol: String, horizon: Horizon },

    #[error("temporal integrity violation: {0}")]
    TemporalIntegrity(ViolationReport),

    #[error("model version {version} rejected: {reason}")]
    ModelRejected { version: String, reason: String },

    #[error("duplicate prediction for {symbol} on {date}")]
    DuplicatePrediction { symbol: String, date: NaiveDate },

    #[error("duplicate outcome for feature {feature_id}")]
    DuplicateOutcome { feature_id: Uuid },

    #[error("model error: {0}")]
    Model(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// True for failures that stay scoped to one symbol; the batch continues.
    pub fn is_symbol_scoped(&self) -> bool {
        matches!(
            self,
            PipelineError::IncompleteSignal { .. } | PipelineError::StalePrice { .. }
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
