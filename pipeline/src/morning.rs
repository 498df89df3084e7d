//! Morning batch: integrity gate, then a bounded per-symbol fan-out that
//! fetches signals, builds a feature record, and writes one prediction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::{MorningSummary, Phase, PipelineError, PipelineResult, Store, SymbolFailure};
use feature_engineering::{CachedSignalSource, FeatureEngineer, SignalSource};
use outcome_tracking::TemporalIntegrityGuard;
use prediction_models::{load_predictor, MultiOutputPredictor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;

/// Pre-market phase runner. Clients are injected per run; the runner keeps
/// no global state.
pub struct MorningRunner {
    store: Store,
    signals: Arc<dyn SignalSource>,
    config: PipelineConfig,
}

enum SymbolOutcome {
    Predicted,
    Skipped,
}

impl MorningRunner {
    pub fn new(store: Store, signals: Arc<dyn SignalSource>, config: PipelineConfig) -> Self {
        Self {
            store,
            signals,
            config,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<MorningSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let trading_date = now.date_naive();
        info!(
            "Morning run {} for {} ({} symbols)",
            run_id,
            trading_date,
            self.config.symbols.len()
        );

        let guard = TemporalIntegrityGuard::new(self.store.clone(), self.config.guard.clone());
        if let Err(err) = guard.enforce(Phase::Morning, now).await {
            let summary = MorningSummary {
                run_id,
                trading_date,
                started_at,
                finished_at: Utc::now(),
                symbols_total: self.config.symbols.len(),
                features_built: 0,
                predictions_made: 0,
                skipped_existing: 0,
                failures: Vec::new(),
                guard_passed: false,
                model_version: String::new(),
            };
            self.store
                .insert_morning_summary(&summary)
                .await
                .context("Failed to record the aborted morning run")?;
            return Err(err.into());
        }

        let predictor = Arc::new(
            load_predictor(&self.config.model_path, &self.config.ensemble)
                .context("Failed to load the active model")?,
        );
        info!("Scoring with model {}", predictor.version());

        let signals: Arc<dyn SignalSource> = Arc::new(CachedSignalSource::new(
            self.signals.clone(),
            self.config.batch.signal_cache_capacity,
            Duration::from_secs(self.config.batch.fetch_timeout_secs),
        ));
        let engineer = Arc::new(FeatureEngineer::new(self.config.engineer.clone()));

        // Limit concurrent symbols
        let semaphore = Arc::new(Semaphore::new(self.config.batch.max_concurrent_symbols));
        let mut tasks = Vec::with_capacity(self.config.symbols.len());

        for symbol in &self.config.symbols {
            let store = self.store.clone();
            let signals = signals.clone();
            let engineer = engineer.clone();
            let predictor = predictor.clone();
            let semaphore = semaphore.clone();
            let task_symbol = symbol.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                process_symbol(&store, signals.as_ref(), &engineer, &predictor, &task_symbol, now)
                    .await
            });
            tasks.push((symbol.clone(), handle));
        }

        let mut features_built = 0;
        let mut predictions_made = 0;
        let mut skipped_existing = 0;
        let mut failures = Vec::new();

        for (symbol, handle) in tasks {
            match handle.await {
                Ok(Ok(SymbolOutcome::Predicted)) => {
                    features_built += 1;
                    predictions_made += 1;
                }
                Ok(Ok(SymbolOutcome::Skipped)) => skipped_existing += 1,
                Ok(Err(err)) => {
                    warn!("{} failed: {}", symbol, err);
                    failures.push(SymbolFailure {
                        symbol,
                        error: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!("{} task aborted: {}", symbol, err);
                    failures.push(SymbolFailure {
                        symbol,
                        error: format!("task aborted: {err}"),
                    });
                }
            }
        }

        let summary = MorningSummary {
            run_id,
            trading_date,
            started_at,
            finished_at: Utc::now(),
            symbols_total: self.config.symbols.len(),
            features_built,
            predictions_made,
            skipped_existing,
            failures,
            guard_passed: true,
            model_version: predictor.version().to_string(),
        };

        self.store
            .insert_morning_summary(&summary)
            .await
            .context("Failed to record the morning summary")?;
        self.store
            .record_phase_completion(Phase::Morning, trading_date)
            .await?;

        info!(
            "Morning run {} finished: {}/{} predicted, {} skipped, {} failed",
            run_id,
            summary.predictions_made,
            summary.symbols_total,
            summary.skipped_existing,
            summary.failures.len()
        );
        Ok(summary)
    }
}

/// Fetch, build, predict, persist for one symbol. Every error stays scoped
/// to this symbol; the caller records it and moves on.
async fn process_symbol(
    store: &Store,
    signals: &dyn SignalSource,
    engineer: &FeatureEngineer,
    predictor: &MultiOutputPredictor,
    symbol: &str,
    now: DateTime<Utc>,
) -> PipelineResult<SymbolOutcome> {
    if store.prediction_exists(symbol, now.date_naive()).await? {
        debug!("{} already predicted for {}; skipping", symbol, now.date_naive());
        return Ok(SymbolOutcome::Skipped);
    }

    let bundle = signals
        .fetch(symbol)
        .await
        .map_err(|err| PipelineError::IncompleteSignal {
            symbol: symbol.to_string(),
            reason: format!("{err:#}"),
        })?;

    let feature = engineer.build(&bundle, now)?;
    store.insert_feature(&feature).await?;

    let prediction = predictor.predict(&feature)?;
    match store.insert_prediction(&prediction).await {
        Ok(()) => {}
        // Lost an insert race with a concurrent run; the row exists.
        Err(PipelineError::DuplicatePrediction { .. }) => {
            debug!("{} prediction already written elsewhere", symbol);
            return Ok(SymbolOutcome::Skipped);
        }
        Err(err) => return Err(err),
    }

    info!(
        "{}: {} (avg confidence {:.2}, quality {:.2})",
        symbol,
        prediction.optimal_action.as_str(),
        prediction.avg_confidence,
        feature.quality_score
    );
    Ok(SymbolOutcome::Predicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::FeatureRecord;
    use feature_engineering::{
        SentimentSnapshot, SignalBundle, StaticSignalSource, TechnicalSnapshot,
    };
    use prediction_models::COLD_START_VERSION;

    fn run_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap()
    }

    fn bundle(symbol: &str, at: DateTime<Utc>) -> SignalBundle {
        let mut bundle = SignalBundle::new(symbol, at);
        let mut technical = TechnicalSnapshot::empty(at);
        technical.rsi = Some(62.0);
        technical.macd_histogram = Some(0.4);
        technical.atr_pct = Some(1.2);
        technical.current_price = Some(100.0);
        bundle.technical = Some(technical);
        let mut sentiment = SentimentSnapshot::empty(at);
        sentiment.score = Some(0.4);
        sentiment.confidence = Some(0.8);
        bundle.sentiment = Some(sentiment);
        bundle
    }

    fn test_config(symbols: &[&str]) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.symbols = symbols.iter().map(|s| s.to_string()).collect();
        config.model_path =
            std::env::temp_dir().join(format!("morning-model-{}.json", Uuid::new_v4()));
        config
    }

    async fn store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn predicts_every_configured_symbol() {
        let store = store().await;
        let now = run_time();
        let collected = now - chrono::Duration::minutes(5);
        let source = StaticSignalSource::new()
            .with_bundle(bundle("AAPL", collected))
            .with_bundle(bundle("MSFT", collected));

        let runner = MorningRunner::new(
            store.clone(),
            Arc::new(source),
            test_config(&["AAPL", "MSFT"]),
        );
        let summary = runner.run(now).await.unwrap();

        assert!(summary.guard_passed);
        assert_eq!(summary.symbols_total, 2);
        assert_eq!(summary.features_built, 2);
        assert_eq!(summary.predictions_made, 2);
        assert_eq!(summary.skipped_existing, 0);
        assert!(summary.failures.is_empty());
        assert_eq!(summary.model_version, COLD_START_VERSION);

        assert!(store.prediction_exists("AAPL", now.date_naive()).await.unwrap());
        assert!(store.prediction_exists("MSFT", now.date_naive()).await.unwrap());
        assert!(store
            .phase_completed_on(Phase::Morning, now.date_naive())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn second_run_on_the_same_day_skips() {
        let store = store().await;
        let now = run_time();
        let collected = now - chrono::Duration::minutes(5);
        let source = Arc::new(
            StaticSignalSource::new()
                .with_bundle(bundle("AAPL", collected))
                .with_bundle(bundle("MSFT", collected)),
        );
        let config = test_config(&["AAPL", "MSFT"]);

        let first = MorningRunner::new(store.clone(), source.clone(), config.clone())
            .run(now)
            .await
            .unwrap();
        assert_eq!(first.predictions_made, 2);

        let second = MorningRunner::new(store.clone(), source, config)
            .run(now + chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(second.predictions_made, 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(store.count_features().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_symbol_fails_without_aborting_the_batch() {
        let store = store().await;
        let now = run_time();
        let source = StaticSignalSource::new()
            .with_bundle(bundle("AAPL", now - chrono::Duration::minutes(5)));

        let runner = MorningRunner::new(
            store.clone(),
            Arc::new(source),
            test_config(&["AAPL", "MISSING"]),
        );
        let summary = runner.run(now).await.unwrap();

        assert_eq!(summary.predictions_made, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].symbol, "MISSING");
        assert!(summary.failures[0].error.contains("incomplete signal"));
        assert!(store.prediction_exists("AAPL", now.date_naive()).await.unwrap());
    }

    #[tokio::test]
    async fn guard_failure_aborts_before_any_prediction() {
        let store = store().await;
        let now = run_time();

        // A stored feature stamped before its newest constituent signal.
        let mut leaky = FeatureRecord::neutral("AAPL", now - chrono::Duration::hours(2));
        leaky.signal_max_timestamp = now;
        store.insert_feature(&leaky).await.unwrap();

        let source = StaticSignalSource::new()
            .with_bundle(bundle("MSFT", now - chrono::Duration::minutes(5)));
        let runner =
            MorningRunner::new(store.clone(), Arc::new(source), test_config(&["MSFT"]));

        let err = runner.run(now).await.unwrap_err();
        assert!(err.to_string().contains("future_leakage"), "{err}");

        assert!(!store.prediction_exists("MSFT", now.date_naive()).await.unwrap());
        assert!(!store
            .phase_completed_on(Phase::Morning, now.date_naive())
            .await
            .unwrap());

        // The aborted run still leaves an audit row.
        let aborted: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM morning_analysis WHERE guard_passed = 0")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(aborted, 1);
    }
}
