//! Evening batch: integrity gate, outcome recording, challenger training
//! against the promotion gate, and a replay of the predictions whose
//! outcomes just settled.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use common::{EveningSummary, Horizon, Phase, PipelineError, Store};
use feature_engineering::PriceSource;
use model_performance::{BacktestEngine, ModelPerformanceTracker, PromotionDecision};
use outcome_tracking::{OutcomeRecorder, TemporalIntegrityGuard};
use prediction_models::{save_model_file, train_challenger, ModelFile, COLD_START_VERSION};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;

/// Post-market phase runner. Clients are injected per run; the runner keeps
/// no global state.
pub struct EveningRunner {
    store: Store,
    prices: Arc<dyn PriceSource>,
    config: PipelineConfig,
}

impl EveningRunner {
    pub fn new(store: Store, prices: Arc<dyn PriceSource>, config: PipelineConfig) -> Self {
        Self {
            store,
            prices,
            config,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<EveningSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let trading_date = now.date_naive();
        info!("Evening run {} for {}", run_id, trading_date);

        let guard = TemporalIntegrityGuard::new(self.store.clone(), self.config.guard.clone());
        if let Err(err) = guard.enforce(Phase::Evening, now).await {
            let summary = aborted_summary(run_id, trading_date, started_at);
            self.store
                .insert_evening_summary(&summary)
                .await
                .context("Failed to record the aborted evening run")?;
            return Err(err.into());
        }

        // The version that made the stored predictions owns tonight's replay;
        // capture it before a promotion changes the answer.
        let replay_version = self
            .store
            .active_model_version()
            .await?
            .map(|record| record.version)
            .unwrap_or_else(|| COLD_START_VERSION.to_string());

        let recorder = OutcomeRecorder::new(
            self.store.clone(),
            self.prices.clone(),
            self.config.recorder.clone(),
        );
        let recorded = recorder.record_due(now).await?;

        let samples = self.store.paired_samples().await?;
        let mut training_skipped = false;
        let mut model_promoted = None;
        let mut model_rejected = None;
        let mut details = serde_json::Map::new();

        match train_challenger(&samples, &self.config.training, now) {
            Ok(challenger) => {
                let tracker =
                    ModelPerformanceTracker::new(self.store.clone(), self.config.gate.clone());
                let decision = tracker
                    .consider(
                        &challenger,
                        &self.config.ensemble,
                        self.config.training.flat_band_pct,
                        now,
                    )
                    .await?;
                match decision {
                    PromotionDecision::Promoted(record) => {
                        let file = ModelFile::from_challenger(&challenger);
                        save_model_file(&self.config.model_path, &file)
                            .context("Failed to persist the promoted model")?;
                        info!(
                            "Promoted model {} to {}",
                            record.version,
                            self.config.model_path.display()
                        );
                        details.insert(
                            "promotion_metrics".to_string(),
                            serde_json::to_value(&record.metrics)?,
                        );
                        model_promoted = Some(record.version);
                    }
                    PromotionDecision::Rejected {
                        version,
                        reason,
                        metrics,
                    } => {
                        warn!("Challenger {} rejected: {}", version, reason);
                        details.insert("rejection_reason".to_string(), json!(reason));
                        details.insert(
                            "rejection_metrics".to_string(),
                            serde_json::to_value(&metrics)?,
                        );
                        model_rejected = Some(version);
                    }
                }
            }
            Err(PipelineError::InsufficientData {
                required,
                available,
            }) => {
                info!("Training skipped: {available} of {required} required paired samples");
                training_skipped = true;
            }
            Err(err) => return Err(err.into()),
        }

        let backtest = BacktestEngine::new(self.store.clone())
            .evaluate(&replay_version, Horizon::LONGEST)
            .await?;
        details.insert("backtest".to_string(), serde_json::to_value(&backtest)?);

        let summary = EveningSummary {
            run_id,
            trading_date,
            started_at,
            finished_at: Utc::now(),
            outcomes_recorded: recorded.outcomes_created,
            horizons_backfilled: recorded.horizons_backfilled,
            outcomes_pending: recorded.horizons_pending,
            failures: recorded.failures,
            guard_passed: true,
            training_skipped,
            training_samples: samples.len(),
            model_promoted,
            model_rejected,
            details: serde_json::Value::Object(details),
        };

        self.store
            .insert_evening_summary(&summary)
            .await
            .context("Failed to record the evening summary")?;
        self.store
            .record_phase_completion(Phase::Evening, trading_date)
            .await?;

        info!(
            "Evening run {} finished: {} outcomes recorded, {} horizons pending, training {}",
            run_id,
            summary.outcomes_recorded,
            summary.outcomes_pending,
            if summary.training_skipped { "skipped" } else { "ran" }
        );
        Ok(summary)
    }
}

fn aborted_summary(run_id: Uuid, trading_date: NaiveDate, started_at: DateTime<Utc>) -> EveningSummary {
    EveningSummary {
        run_id,
        trading_date,
        started_at,
        finished_at: Utc::now(),
        outcomes_recorded: 0,
        horizons_backfilled: 0,
        outcomes_pending: 0,
        failures: Vec::new(),
        guard_passed: false,
        training_skipped: true,
        training_samples: 0,
        model_promoted: None,
        model_rejected: None,
        details: json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morning::MorningRunner;
    use chrono::TimeZone;
    use common::{Direction, FeatureRecord, HorizonOutcome, ModelStatus, Outcome};
    use feature_engineering::{
        SentimentSnapshot, SignalBundle, StaticPriceSource, StaticSignalSource, TechnicalSnapshot,
    };
    use model_performance::PromotionGate;

    async fn store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        config.model_path =
            std::env::temp_dir().join(format!("evening-model-{}.json", Uuid::new_v4()));
        config.training.forest.n_trees = 8;
        config
    }

    fn bundle(symbol: &str, at: DateTime<Utc>, price: f64) -> SignalBundle {
        let mut bundle = SignalBundle::new(symbol, at);
        let mut technical = TechnicalSnapshot::empty(at);
        technical.rsi = Some(58.0);
        technical.macd_histogram = Some(0.2);
        technical.atr_pct = Some(1.0);
        technical.current_price = Some(price);
        bundle.technical = Some(technical);
        let mut sentiment = SentimentSnapshot::empty(at);
        sentiment.score = Some(0.3);
        sentiment.confidence = Some(0.7);
        bundle.sentiment = Some(sentiment);
        bundle
    }

    fn realized_outcome(feature: &FeatureRecord, ret_1d: f64) -> Outcome {
        let entry = feature.current_price;
        let horizons = Horizon::ALL
            .iter()
            .map(|&horizon| {
                let ret = match horizon {
                    Horizon::OneHour => ret_1d * 0.3,
                    Horizon::FourHours => ret_1d * 0.6,
                    Horizon::OneDay => ret_1d,
                };
                HorizonOutcome {
                    horizon,
                    exit_price: Some(entry * (1.0 + ret / 100.0)),
                    return_pct: Some(ret),
                    direction: Some(Direction::from_return(ret, 0.2)),
                    recorded_at: Some(
                        feature.timestamp + horizon.duration() + chrono::Duration::minutes(5),
                    ),
                }
            })
            .collect();
        Outcome {
            id: Uuid::new_v4(),
            feature_id: feature.id,
            symbol: feature.symbol.clone(),
            entry_price: entry,
            first_recorded_at: feature.timestamp
                + Horizon::OneHour.duration()
                + chrono::Duration::minutes(5),
            horizons,
        }
    }

    /// Learnable history: sentiment sign decides the move.
    async fn seed_paired_samples(store: &Store, n: usize) {
        for i in 0..n {
            let ts = Utc.with_ymd_and_hms(2024, 1, 1, 14, 30, 0).unwrap()
                + chrono::Duration::days(i as i64);
            let ret = if i % 2 == 0 { 1.5 } else { -1.5 };
            let mut feature = FeatureRecord::neutral("AAPL", ts);
            feature.sentiment_score = if ret > 0.0 { 0.6 } else { -0.6 };
            feature.sentiment_confidence = 0.9;
            store.insert_feature(&feature).await.unwrap();
            store
                .insert_outcome(&realized_outcome(&feature, ret))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn refuses_to_run_before_the_morning_phase() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 18, 0, 0).unwrap();

        let runner = EveningRunner::new(
            store.clone(),
            Arc::new(StaticPriceSource::new()),
            test_config(),
        );
        let err = runner.run(now).await.unwrap_err();
        assert!(err.to_string().contains("phase_order"), "{err}");

        assert!(!store
            .phase_completed_on(Phase::Evening, now.date_naive())
            .await
            .unwrap());
        let aborted: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM evening_analysis WHERE guard_passed = 0")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn full_day_cycle_records_outcomes_and_skips_training() {
        let store = store().await;
        let config = test_config();

        let day1 = Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();

        // Two morning runs on consecutive days.
        for morning_at in [day1, day2] {
            let collected = morning_at - chrono::Duration::minutes(5);
            let source = StaticSignalSource::new()
                .with_bundle(bundle("AAPL", collected, 100.0))
                .with_bundle(bundle("MSFT", collected, 50.0));
            MorningRunner::new(store.clone(), Arc::new(source), config.clone())
                .run(morning_at)
                .await
                .unwrap();
        }

        // Exit prices for every horizon of the day-1 features.
        let mut prices = StaticPriceSource::new();
        for (symbol, base) in [("AAPL", 100.0), ("MSFT", 50.0)] {
            prices.push(symbol, day1 + Horizon::OneHour.duration(), base * 1.01);
            prices.push(symbol, day1 + Horizon::FourHours.duration(), base * 1.004);
            prices.push(symbol, day1 + Horizon::OneDay.duration(), base * 0.97);
        }

        let evening_at = day2 + chrono::Duration::minutes(30);
        let runner = EveningRunner::new(store.clone(), Arc::new(prices), config);
        let summary = runner.run(evening_at).await.unwrap();

        assert!(summary.guard_passed);
        assert_eq!(summary.outcomes_recorded, 2);
        assert_eq!(summary.outcomes_pending, 0);
        assert!(summary.failures.is_empty());

        // Two realized samples are far below the training floor.
        assert!(summary.training_skipped);
        assert_eq!(summary.training_samples, 2);
        assert!(summary.model_promoted.is_none());
        assert!(summary.model_rejected.is_none());

        assert!(store
            .phase_completed_on(Phase::Evening, evening_at.date_naive())
            .await
            .unwrap());
        // The replay section covers the cold-start version's settled rows.
        assert_eq!(summary.details["backtest"]["model_version"], COLD_START_VERSION);
    }

    #[tokio::test]
    async fn promotes_a_challenger_and_feeds_the_next_morning() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 18, 0, 0).unwrap();
        seed_paired_samples(&store, 60).await;
        store
            .record_phase_completion(Phase::Morning, now.date_naive())
            .await
            .unwrap();

        let mut config = test_config();
        config.gate = PromotionGate {
            min_direction_accuracy: 0.0,
            max_magnitude_mae_pct: 1e9,
        };

        let runner = EveningRunner::new(
            store.clone(),
            Arc::new(StaticPriceSource::new()),
            config.clone(),
        );
        let summary = runner.run(now).await.unwrap();

        assert!(!summary.training_skipped);
        assert_eq!(summary.training_samples, 60);
        assert!(summary.model_rejected.is_none());
        let promoted = summary.model_promoted.clone().unwrap();
        assert!(config.model_path.exists());

        let active = store.active_model_version().await.unwrap().unwrap();
        assert_eq!(active.version, promoted);

        // The next morning loads the promoted ensemble from disk.
        let tomorrow = now + chrono::Duration::hours(16);
        let source = StaticSignalSource::new().with_bundle(bundle(
            "TSLA",
            tomorrow - chrono::Duration::minutes(5),
            200.0,
        ));
        let mut morning_config = config.clone();
        morning_config.symbols = vec!["TSLA".to_string()];
        let morning = MorningRunner::new(store.clone(), Arc::new(source), morning_config)
            .run(tomorrow)
            .await
            .unwrap();
        assert_eq!(morning.model_version, promoted);

        std::fs::remove_file(&config.model_path).ok();
    }

    #[tokio::test]
    async fn rejected_challenger_leaves_the_champion_in_place() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 18, 0, 0).unwrap();
        seed_paired_samples(&store, 60).await;
        store
            .record_phase_completion(Phase::Morning, now.date_naive())
            .await
            .unwrap();

        let mut config = test_config();
        config.gate = PromotionGate {
            min_direction_accuracy: 1.1,
            max_magnitude_mae_pct: 0.0,
        };

        let runner = EveningRunner::new(
            store.clone(),
            Arc::new(StaticPriceSource::new()),
            config.clone(),
        );
        let summary = runner.run(now).await.unwrap();

        assert!(summary.model_promoted.is_none());
        let rejected = summary.model_rejected.clone().unwrap();
        assert!(!config.model_path.exists());
        assert!(store.active_model_version().await.unwrap().is_none());

        let history = store.model_version_history().await.unwrap();
        let row = history.iter().find(|r| r.version == rejected).unwrap();
        assert_eq!(row.status, ModelStatus::Rejected);
        assert!(summary.details["rejection_reason"]
            .as_str()
            .unwrap_or_default()
            .contains("accuracy"));
    }
}
