// Temporal integrity guard
// Audits the store for the ways past runs have silently corrupted
// training data: duplicate predictions, missing outcomes, future
// leakage, schema drift, and broken references. Any violation aborts
// the phase before it writes anything.

use chrono::{DateTime, Duration, Utc};
use common::{
    FeatureRecord, Horizon, IntegrityCheck, Phase, PipelineError, PipelineResult, Store,
    ViolationReport,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Grace period past the longest horizon before a missing outcome
    /// counts as a parity violation
    #[serde(default = "default_catch_up_hours")]
    pub catch_up_hours: i64,
}

fn default_catch_up_hours() -> i64 {
    24
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            catch_up_hours: default_catch_up_hours(),
        }
    }
}

/// Pre-phase data audit over the whole store.
pub struct TemporalIntegrityGuard {
    store: Store,
    config: GuardConfig,
}

impl TemporalIntegrityGuard {
    pub fn new(store: Store, config: GuardConfig) -> Self {
        Self { store, config }
    }

    /// Run every check and return the full report without judging it.
    pub async fn check(&self, phase: Phase, now: DateTime<Utc>) -> PipelineResult<ViolationReport> {
        let mut report = ViolationReport::clean(phase);

        // Schema first: the data checks query these tables and would
        // fail with raw store errors instead of a usable report.
        self.check_schema(&mut report).await?;
        if !report.passed() {
            return Ok(report);
        }

        self.check_duplicate_predictions(&mut report).await?;
        self.check_feature_outcome_parity(&mut report, now).await?;
        self.check_future_leakage(&mut report).await?;
        self.check_referential_integrity(&mut report).await?;
        if phase == Phase::Evening {
            self.check_phase_order(&mut report, now).await?;
        }

        Ok(report)
    }

    /// Run every check and fail the phase on any violation.
    pub async fn enforce(
        &self,
        phase: Phase,
        now: DateTime<Utc>,
    ) -> PipelineResult<ViolationReport> {
        let report = self.check(phase, now).await?;
        if report.passed() {
            info!("{} integrity checks passed", phase);
            Ok(report)
        } else {
            warn!("{}", report);
            Err(PipelineError::TemporalIntegrity(report))
        }
    }

    async fn check_schema(&self, report: &mut ViolationReport) -> PipelineResult<()> {
        for (table, required) in contract_tables() {
            let columns = self.store.table_columns(table).await?;
            if columns.is_empty() {
                report.push(
                    IntegrityCheck::SchemaPresence,
                    0,
                    format!("table {table} is missing"),
                );
                continue;
            }
            let missing: Vec<&str> = required
                .iter()
                .filter(|name| !columns.iter().any(|c| c == *name))
                .copied()
                .collect();
            if !missing.is_empty() {
                report.push(
                    IntegrityCheck::SchemaPresence,
                    0,
                    format!("table {table} lacks columns: {}", missing.join(", ")),
                );
            }
        }
        Ok(())
    }

    async fn check_duplicate_predictions(
        &self,
        report: &mut ViolationReport,
    ) -> PipelineResult<()> {
        let groups = self.store.duplicate_prediction_groups().await?;
        if groups.is_empty() {
            return Ok(());
        }
        let affected: i64 = groups.iter().map(|(_, _, count)| count).sum();
        let preview = preview(
            groups
                .iter()
                .map(|(symbol, date, count)| format!("{symbol} {date} x{count}")),
        );
        report.push(IntegrityCheck::DuplicatePredictions, affected, preview);
        Ok(())
    }

    async fn check_feature_outcome_parity(
        &self,
        report: &mut ViolationReport,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let due_cutoff =
            now - Horizon::LONGEST.duration() - Duration::hours(self.config.catch_up_hours);
        let overdue = self.store.overdue_features(due_cutoff).await?;
        if overdue.is_empty() {
            return Ok(());
        }
        let preview = preview(
            overdue
                .iter()
                .map(|(_, symbol, ts)| format!("{symbol}@{}", ts.format("%Y-%m-%d %H:%M"))),
        );
        report.push(
            IntegrityCheck::FeatureOutcomeParity,
            overdue.len() as i64,
            format!("features without outcomes past the due window: {preview}"),
        );
        Ok(())
    }

    async fn check_future_leakage(&self, report: &mut ViolationReport) -> PipelineResult<()> {
        let leaky = self.store.leaky_features().await?;
        if !leaky.is_empty() {
            let preview = preview(leaky.iter().map(|(_, symbol)| symbol.clone()));
            report.push(
                IntegrityCheck::FutureLeakage,
                leaky.len() as i64,
                format!("features built from signals newer than their timestamp: {preview}"),
            );
        }

        let mismatched = self.store.prediction_timestamp_mismatches().await?;
        if !mismatched.is_empty() {
            let preview = preview(mismatched.iter().map(|(_, symbol)| symbol.clone()));
            report.push(
                IntegrityCheck::FutureLeakage,
                mismatched.len() as i64,
                format!("predictions whose created_at drifted from the feature: {preview}"),
            );
        }

        let premature = self.premature_recordings().await?;
        if !premature.is_empty() {
            let preview = preview(
                premature
                    .iter()
                    .map(|(id, horizon)| format!("{id} {}", horizon.label())),
            );
            report.push(
                IntegrityCheck::FutureLeakage,
                premature.len() as i64,
                format!("outcome horizons recorded before they elapsed: {preview}"),
            );
        }
        Ok(())
    }

    /// Outcome horizons whose recorded_at predate feature_ts + horizon
    async fn premature_recordings(&self) -> PipelineResult<Vec<(Uuid, Horizon)>> {
        let audit = self.store.outcome_recording_audit().await?;
        let mut premature = Vec::new();
        for (feature_id, feature_ts, rec_1h, rec_4h, rec_1d) in audit {
            let slots = [
                (Horizon::OneHour, rec_1h),
                (Horizon::FourHours, rec_4h),
                (Horizon::OneDay, rec_1d),
            ];
            for (horizon, recorded_at) in slots {
                if let Some(recorded_at) = recorded_at {
                    if recorded_at < feature_ts + horizon.duration() {
                        premature.push((feature_id, horizon));
                    }
                }
            }
        }
        Ok(premature)
    }

    async fn check_referential_integrity(
        &self,
        report: &mut ViolationReport,
    ) -> PipelineResult<()> {
        let orphan_predictions = self.store.orphan_prediction_count().await?;
        if orphan_predictions > 0 {
            report.push(
                IntegrityCheck::ReferentialIntegrity,
                orphan_predictions,
                "predictions referencing no feature row",
            );
        }

        let orphan_outcomes = self.store.orphan_outcome_count().await?;
        if orphan_outcomes > 0 {
            report.push(
                IntegrityCheck::ReferentialIntegrity,
                orphan_outcomes,
                "outcomes referencing no feature row",
            );
        }

        for (table, columns) in unique_contracts() {
            if !self.has_unique_index(table, &columns).await? {
                report.push(
                    IntegrityCheck::ReferentialIntegrity,
                    0,
                    format!(
                        "table {table} lost its unique constraint on ({})",
                        columns.join(", ")
                    ),
                );
            }
        }
        Ok(())
    }

    async fn has_unique_index(&self, table: &str, columns: &[String]) -> PipelineResult<bool> {
        let mut wanted: Vec<String> = columns.to_vec();
        wanted.sort();
        let indexes = self.store.unique_index_columns(table).await?;
        Ok(indexes.into_iter().any(|mut index| {
            index.sort();
            index == wanted
        }))
    }

    async fn check_phase_order(
        &self,
        report: &mut ViolationReport,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let trading_date = now.date_naive();
        if !self
            .store
            .phase_completed_on(Phase::Morning, trading_date)
            .await?
        {
            report.push(
                IntegrityCheck::PhaseOrder,
                0,
                format!("no completed morning run for {trading_date}"),
            );
        }
        Ok(())
    }
}

fn contract_tables() -> Vec<(&'static str, Vec<&'static str>)> {
    let mut feature_columns = vec!["id", "symbol", "timestamp", "signal_max_timestamp"];
    feature_columns.extend(FeatureRecord::FEATURE_NAMES);
    vec![
        ("enhanced_features", feature_columns),
        (
            "predictions",
            vec![
                "id",
                "feature_id",
                "symbol",
                "prediction_date",
                "created_at",
                "model_version",
                "direction_1h",
                "magnitude_1h",
                "confidence_1h",
                "direction_4h",
                "magnitude_4h",
                "confidence_4h",
                "direction_1d",
                "magnitude_1d",
                "confidence_1d",
                "optimal_action",
                "avg_confidence",
            ],
        ),
        (
            "enhanced_outcomes",
            vec![
                "id",
                "feature_id",
                "symbol",
                "entry_price",
                "first_recorded_at",
                "exit_price_1h",
                "return_pct_1h",
                "direction_1h",
                "recorded_at_1h",
                "exit_price_4h",
                "return_pct_4h",
                "direction_4h",
                "recorded_at_4h",
                "exit_price_1d",
                "return_pct_1d",
                "direction_1d",
                "recorded_at_1d",
            ],
        ),
        (
            "model_performance",
            vec![
                "version",
                "status",
                "trained_at",
                "training_samples",
                "feature_schema_hash",
                "created_at",
            ],
        ),
        ("morning_analysis", vec!["id", "trading_date", "guard_passed"]),
        ("evening_analysis", vec!["id", "trading_date", "guard_passed"]),
        ("phase_log", vec!["id", "phase", "trading_date", "completed_at"]),
    ]
}

fn unique_contracts() -> Vec<(&'static str, Vec<String>)> {
    vec![
        (
            "enhanced_features",
            vec!["symbol".to_string(), "timestamp".to_string()],
        ),
        (
            "predictions",
            vec!["symbol".to_string(), "prediction_date".to_string()],
        ),
        ("enhanced_outcomes", vec!["feature_id".to_string()]),
        ("model_performance", vec!["status".to_string()]),
    ]
}

fn preview(items: impl Iterator<Item = String>) -> String {
    let collected: Vec<String> = items.take(5).collect();
    collected.join(", ")
}
