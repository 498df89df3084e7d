// Outcome recording
// Realizes horizons for features whose waiting period has elapsed and
// backfills previously stale horizons, each exactly once. Every realized
// return goes through the canonical formula in `common::returns`.

use chrono::{DateTime, Utc};
use common::{
    return_pct, Direction, FeatureRecord, Horizon, HorizonOutcome, Outcome, PipelineError,
    PipelineResult, Store, SymbolFailure,
};
use feature_engineering::PriceSource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Returns within +/- this percent classify the realized direction FLAT
    #[serde(default = "default_flat_band_pct")]
    pub flat_band_pct: f64,
}

fn default_flat_band_pct() -> f64 {
    0.2
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flat_band_pct: default_flat_band_pct(),
        }
    }
}

/// What one recording pass accomplished, for the evening summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecorderReport {
    pub outcomes_created: usize,
    pub horizons_recorded: usize,
    pub horizons_backfilled: usize,
    pub horizons_pending: usize,
    pub failures: Vec<SymbolFailure>,
}

/// Records realized price outcomes against stored features.
///
/// A horizon is only ever realized after its full duration has elapsed;
/// a missing price leaves the column NULL for a later backfill pass.
pub struct OutcomeRecorder {
    store: Store,
    prices: Arc<dyn PriceSource>,
    config: RecorderConfig,
}

impl OutcomeRecorder {
    pub fn new(store: Store, prices: Arc<dyn PriceSource>, config: RecorderConfig) -> Self {
        Self {
            store,
            prices,
            config,
        }
    }

    /// One full recording pass: create outcome rows for features past
    /// their shortest horizon, then backfill stale horizons.
    pub async fn record_due(&self, now: DateTime<Utc>) -> PipelineResult<RecorderReport> {
        let mut report = RecorderReport::default();

        let cutoff = now - Horizon::OneHour.duration();
        let due = self.store.features_awaiting_outcome(cutoff).await?;
        debug!("{} features due for outcome recording", due.len());

        for feature in &due {
            match self.record_feature(feature, now).await {
                Ok(outcome) => {
                    report.outcomes_created += 1;
                    report.horizons_recorded +=
                        outcome.horizons.iter().filter(|h| h.is_realized()).count();
                }
                Err(err) if err.is_symbol_scoped() => {
                    warn!("Skipping outcome for {}: {}", feature.symbol, err);
                    report.failures.push(SymbolFailure {
                        symbol: feature.symbol.clone(),
                        error: err.to_string(),
                    });
                }
                // Another writer beat us to the insert; theirs stands
                Err(PipelineError::DuplicateOutcome { feature_id }) => {
                    debug!("Outcome for feature {} already recorded", feature_id);
                }
                Err(err) => return Err(err),
            }
        }

        self.backfill_pending(now, &mut report).await?;

        info!(
            "Outcome pass: {} created, {} horizons recorded, {} backfilled, {} pending",
            report.outcomes_created,
            report.horizons_recorded,
            report.horizons_backfilled,
            report.horizons_pending
        );
        Ok(report)
    }

    /// Build and insert the initial outcome row for one feature
    async fn record_feature(
        &self,
        feature: &FeatureRecord,
        now: DateTime<Utc>,
    ) -> PipelineResult<Outcome> {
        let entry_price = self.entry_price(feature).await?;

        let mut horizons = Vec::with_capacity(Horizon::ALL.len());
        for &horizon in Horizon::ALL.iter() {
            horizons.push(
                self.realize_horizon(feature, horizon, entry_price, now)
                    .await,
            );
        }

        let outcome = Outcome {
            id: Uuid::new_v4(),
            feature_id: feature.id,
            symbol: feature.symbol.clone(),
            entry_price,
            first_recorded_at: now,
            horizons,
        };
        self.store.insert_outcome(&outcome).await?;
        Ok(outcome)
    }

    /// Entry price comes from the feature's own observation when it was
    /// priced at build time, else from the price source at that instant.
    async fn entry_price(&self, feature: &FeatureRecord) -> PipelineResult<f64> {
        if feature.current_price > 0.0 {
            return Ok(feature.current_price);
        }
        let looked_up = self
            .prices
            .price_at(&feature.symbol, feature.timestamp)
            .await
            .map_err(|e| PipelineError::IncompleteSignal {
                symbol: feature.symbol.clone(),
                reason: format!("entry price lookup failed: {e}"),
            })?;
        looked_up.ok_or_else(|| PipelineError::StalePrice {
            symbol: feature.symbol.clone(),
            horizon: Horizon::OneHour,
        })
    }

    /// Realize one horizon if it has elapsed and a price is available;
    /// otherwise leave it pending. Never prices a horizon early.
    async fn realize_horizon(
        &self,
        feature: &FeatureRecord,
        horizon: Horizon,
        entry_price: f64,
        now: DateTime<Utc>,
    ) -> HorizonOutcome {
        let due_at = feature.timestamp + horizon.duration();
        if now < due_at {
            return HorizonOutcome::pending(horizon);
        }

        match self.prices.price_at(&feature.symbol, due_at).await {
            Ok(Some(exit_price)) => {
                let ret = return_pct(entry_price, exit_price);
                HorizonOutcome {
                    horizon,
                    exit_price: Some(exit_price),
                    return_pct: Some(ret),
                    direction: Some(Direction::from_return(ret, self.config.flat_band_pct)),
                    recorded_at: Some(now),
                }
            }
            Ok(None) => {
                warn!(
                    "Stale {} price for {}: nothing at {}, leaving pending",
                    horizon.label(),
                    feature.symbol,
                    due_at
                );
                HorizonOutcome::pending(horizon)
            }
            Err(err) => {
                warn!(
                    "Price lookup failed for {} at {}: {}",
                    feature.symbol,
                    horizon.label(),
                    err
                );
                HorizonOutcome::pending(horizon)
            }
        }
    }

    /// Fill in stale horizons on existing outcome rows. The store applies
    /// each backfill at most once; a second writer loses the race cleanly.
    async fn backfill_pending(
        &self,
        now: DateTime<Utc>,
        report: &mut RecorderReport,
    ) -> PipelineResult<()> {
        let pending = self.store.pending_outcomes().await?;

        for row in &pending {
            for slot in &row.horizons {
                if slot.is_realized() {
                    continue;
                }
                let horizon = slot.horizon;
                let due_at = row.feature_timestamp + horizon.duration();
                if now < due_at {
                    report.horizons_pending += 1;
                    continue;
                }

                match self.prices.price_at(&row.symbol, due_at).await {
                    Ok(Some(exit_price)) => {
                        let ret = return_pct(row.entry_price, exit_price);
                        let direction = Direction::from_return(ret, self.config.flat_band_pct);
                        let applied = self
                            .store
                            .backfill_outcome_horizon(
                                row.feature_id,
                                horizon,
                                exit_price,
                                ret,
                                direction,
                                now,
                            )
                            .await?;
                        if applied {
                            debug!(
                                "Backfilled {} {} for {}: {:.4}%",
                                row.symbol,
                                horizon.label(),
                                row.feature_id,
                                ret
                            );
                            report.horizons_backfilled += 1;
                        }
                    }
                    Ok(None) => {
                        debug!(
                            "Still no {} price for {}; backfill deferred",
                            horizon.label(),
                            row.symbol
                        );
                        report.horizons_pending += 1;
                    }
                    Err(err) => {
                        warn!(
                            "Backfill price lookup failed for {} {}: {}",
                            row.symbol,
                            horizon.label(),
                            err
                        );
                        report.horizons_pending += 1;
                        report.failures.push(SymbolFailure {
                            symbol: row.symbol.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    /// Price stub that only answers for exact timestamps, so a horizon
    /// without its own price point stays pending instead of being served
    /// an older last-trade value.
    #[derive(Default)]
    struct ExactPriceSource {
        points: HashMap<(String, DateTime<Utc>), f64>,
    }

    impl ExactPriceSource {
        fn with_price(mut self, symbol: &str, at: DateTime<Utc>, price: f64) -> Self {
            self.points.insert((symbol.to_string(), at), price);
            self
        }
    }

    #[async_trait]
    impl PriceSource for ExactPriceSource {
        async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> anyhow::Result<Option<f64>> {
            Ok(self.points.get(&(symbol.to_string(), at)).copied())
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
    }

    async fn store_with_feature(symbol: &str, price: f64) -> (Store, FeatureRecord) {
        let store = Store::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        let mut feature = FeatureRecord::neutral(symbol, ts());
        feature.current_price = price;
        store.insert_feature(&feature).await.unwrap();
        (store, feature)
    }

    #[tokio::test]
    async fn records_elapsed_horizons_and_leaves_stale_ones_pending() {
        let (store, feature) = store_with_feature("AAPL", 100.0).await;
        let prices = ExactPriceSource::default().with_price("AAPL", ts() + Duration::hours(1), 105.0);
        let recorder = OutcomeRecorder::new(
            store.clone(),
            Arc::new(prices),
            RecorderConfig::default(),
        );

        // 4h has elapsed but has no price; 1d has not elapsed
        let report = recorder.record_due(ts() + Duration::hours(5)).await.unwrap();
        assert_eq!(report.outcomes_created, 1);
        assert_eq!(report.horizons_recorded, 1);
        assert_eq!(report.horizons_pending, 2);
        assert!(report.failures.is_empty());

        let outcome = store.fetch_outcome(feature.id).await.unwrap().unwrap();
        let one_hour = outcome.horizon(Horizon::OneHour).unwrap();
        assert_eq!(one_hour.exit_price, Some(105.0));
        assert!((one_hour.return_pct.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(one_hour.direction, Some(Direction::Up));
        assert!(!outcome.horizon(Horizon::FourHours).unwrap().is_realized());
        assert!(!outcome.horizon(Horizon::OneDay).unwrap().is_realized());
    }

    #[tokio::test]
    async fn horizons_are_never_realized_early() {
        let (store, feature) = store_with_feature("MSFT", 200.0).await;
        // Prices exist well past every horizon
        let prices = ExactPriceSource::default()
            .with_price("MSFT", ts() + Duration::hours(1), 202.0)
            .with_price("MSFT", ts() + Duration::hours(4), 204.0)
            .with_price("MSFT", ts() + Duration::hours(24), 210.0);
        let recorder = OutcomeRecorder::new(
            store.clone(),
            Arc::new(prices),
            RecorderConfig::default(),
        );

        let report = recorder
            .record_due(ts() + Duration::minutes(90))
            .await
            .unwrap();
        assert_eq!(report.horizons_recorded, 1);

        let outcome = store.fetch_outcome(feature.id).await.unwrap().unwrap();
        assert!(outcome.horizon(Horizon::OneHour).unwrap().is_realized());
        assert!(!outcome.horizon(Horizon::FourHours).unwrap().is_realized());
        assert!(!outcome.horizon(Horizon::OneDay).unwrap().is_realized());
    }

    #[tokio::test]
    async fn backfill_applies_exactly_once_per_horizon() {
        let (store, feature) = store_with_feature("NVDA", 500.0).await;
        let sparse = ExactPriceSource::default().with_price("NVDA", ts() + Duration::hours(1), 505.0);
        let recorder = OutcomeRecorder::new(
            store.clone(),
            Arc::new(sparse),
            RecorderConfig::default(),
        );
        recorder.record_due(ts() + Duration::hours(5)).await.unwrap();

        // The 4h price arrives later
        let full = ExactPriceSource::default()
            .with_price("NVDA", ts() + Duration::hours(1), 505.0)
            .with_price("NVDA", ts() + Duration::hours(4), 490.0);
        let recorder = OutcomeRecorder::new(store.clone(), Arc::new(full), RecorderConfig::default());

        let second = recorder.record_due(ts() + Duration::hours(6)).await.unwrap();
        assert_eq!(second.outcomes_created, 0);
        assert_eq!(second.horizons_backfilled, 1);

        let third = recorder.record_due(ts() + Duration::hours(7)).await.unwrap();
        assert_eq!(third.horizons_backfilled, 0);

        let outcome = store.fetch_outcome(feature.id).await.unwrap().unwrap();
        let four_hour = outcome.horizon(Horizon::FourHours).unwrap();
        assert!((four_hour.return_pct.unwrap() - (-2.0)).abs() < 1e-9);
        assert_eq!(four_hour.direction, Some(Direction::Down));
    }

    #[tokio::test]
    async fn unpriced_feature_is_isolated_and_retried_later() {
        let store = Store::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();

        let mut unpriced = FeatureRecord::neutral("GME", ts());
        unpriced.current_price = 0.0;
        store.insert_feature(&unpriced).await.unwrap();
        let mut priced = FeatureRecord::neutral("AAPL", ts());
        priced.current_price = 100.0;
        store.insert_feature(&priced).await.unwrap();

        let prices = ExactPriceSource::default().with_price("AAPL", ts() + Duration::hours(1), 101.0);
        let recorder = OutcomeRecorder::new(
            store.clone(),
            Arc::new(prices),
            RecorderConfig::default(),
        );

        let report = recorder.record_due(ts() + Duration::hours(2)).await.unwrap();
        assert_eq!(report.outcomes_created, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].symbol, "GME");

        assert!(store.fetch_outcome(unpriced.id).await.unwrap().is_none());
        assert!(store.fetch_outcome(priced.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn small_moves_classify_flat_inside_the_band() {
        let (store, feature) = store_with_feature("KO", 100.0).await;
        let prices = ExactPriceSource::default().with_price("KO", ts() + Duration::hours(1), 100.1);
        let recorder = OutcomeRecorder::new(
            store.clone(),
            Arc::new(prices),
            RecorderConfig::default(),
        );

        recorder.record_due(ts() + Duration::hours(2)).await.unwrap();
        let outcome = store.fetch_outcome(feature.id).await.unwrap().unwrap();
        let one_hour = outcome.horizon(Horizon::OneHour).unwrap();
        assert_eq!(one_hour.direction, Some(Direction::Flat));
        assert!((one_hour.return_pct.unwrap() - 0.1).abs() < 1e-6);
    }
}
