use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use common::{
    FeatureRecord, IntegrityCheck, Phase, PipelineError, PipelineResult, ViolationReport,
};

use crate::bundle::SignalBundle;

/// Neutral defaults substituted for missing or invalid observations. A
/// defaulted field is never counted as observed.
const DEFAULT_RSI: f64 = 50.0;
const DEFAULT_STOCH: f64 = 50.0;
const DEFAULT_RATIO: f64 = 1.0;
const DEFAULT_VIX: f64 = 20.0;

fn default_degraded_quality_cap() -> f64 {
    0.5
}

/// Feature engineering knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineerConfig {
    /// Ceiling applied to quality_score when the bundle came from the
    /// stale-fetch cache.
    #[serde(default = "default_degraded_quality_cap")]
    pub degraded_quality_cap: f64,
}

impl Default for EngineerConfig {
    fn default() -> Self {
        Self {
            degraded_quality_cap: default_degraded_quality_cap(),
        }
    }
}

/// Folds one symbol's signal bundle into a fixed-width feature record.
///
/// Every optional observation is range-validated here, at the boundary:
/// out-of-range and non-finite values are discarded exactly like missing
/// ones. The mandatory floor is a non-empty symbol plus at least one valid
/// technical observation.
pub struct FeatureEngineer {
    config: EngineerConfig,
}

struct FieldLedger {
    observed: usize,
    total: usize,
}

impl FieldLedger {
    fn new() -> Self {
        Self { observed: 0, total: 0 }
    }

    fn observe(
        &mut self,
        symbol: &str,
        name: &str,
        value: Option<f64>,
        min: f64,
        max: f64,
        default: f64,
    ) -> f64 {
        self.total += 1;
        match value {
            Some(v) if v.is_finite() && v >= min && v <= max => {
                self.observed += 1;
                v
            }
            Some(v) => {
                debug!("Discarding out-of-range {} for {}: {}", name, symbol, v);
                default
            }
            None => default,
        }
    }

    fn observe_flag(&mut self, value: Option<bool>) -> f64 {
        self.total += 1;
        match value {
            Some(flag) => {
                self.observed += 1;
                if flag {
                    1.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn quality(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.observed as f64 / self.total as f64
        }
    }
}

impl FeatureEngineer {
    pub fn new(config: EngineerConfig) -> Self {
        Self { config }
    }

    /// Build the feature record for `bundle` stamped at `timestamp`.
    pub fn build(
        &self,
        bundle: &SignalBundle,
        timestamp: DateTime<Utc>,
    ) -> PipelineResult<FeatureRecord> {
        let symbol = bundle.symbol.trim();
        if symbol.is_empty() {
            return Err(PipelineError::IncompleteSignal {
                symbol: bundle.symbol.clone(),
                reason: "empty symbol".to_string(),
            });
        }

        // No constituent observation may postdate the record itself.
        if let Some(max_observed) = bundle.max_observed_at() {
            if max_observed > timestamp {
                let mut report = ViolationReport::clean(Phase::Morning);
                report.push(
                    IntegrityCheck::FutureLeakage,
                    1,
                    format!(
                        "{}: signal observed at {} postdates feature timestamp {}",
                        symbol, max_observed, timestamp
                    ),
                );
                return Err(PipelineError::TemporalIntegrity(report));
            }
        }

        let mut ledger = FieldLedger::new();

        let sentiment = bundle.sentiment.as_ref();
        let sentiment_score = ledger.observe(
            symbol,
            "sentiment_score",
            sentiment.and_then(|s| s.score),
            -1.0,
            1.0,
            0.0,
        );
        let sentiment_confidence = ledger.observe(
            symbol,
            "sentiment_confidence",
            sentiment.and_then(|s| s.confidence),
            0.0,
            1.0,
            0.0,
        );
        let article_count = ledger.observe(
            symbol,
            "article_count",
            sentiment.and_then(|s| s.article_count),
            0.0,
            f64::INFINITY,
            0.0,
        );
        let social_score = ledger.observe(
            symbol,
            "social_score",
            sentiment.and_then(|s| s.social_score),
            -1.0,
            1.0,
            0.0,
        );
        let social_volume = ledger.observe(
            symbol,
            "social_volume",
            sentiment.and_then(|s| s.social_volume),
            0.0,
            f64::INFINITY,
            0.0,
        );

        let technical = bundle.technical.as_ref();
        let observed_before_technical = ledger.observed;
        let rsi = ledger.observe(symbol, "rsi", technical.and_then(|t| t.rsi), 0.0, 100.0, DEFAULT_RSI);
        let stoch_k = ledger.observe(
            symbol,
            "stoch_k",
            technical.and_then(|t| t.stoch_k),
            0.0,
            100.0,
            DEFAULT_STOCH,
        );
        let stoch_d = ledger.observe(
            symbol,
            "stoch_d",
            technical.and_then(|t| t.stoch_d),
            0.0,
            100.0,
            DEFAULT_STOCH,
        );
        let macd_line = ledger.observe(
            symbol,
            "macd_line",
            technical.and_then(|t| t.macd_line),
            f64::NEG_INFINITY,
            f64::INFINITY,
            0.0,
        );
        let macd_signal = ledger.observe(
            symbol,
            "macd_signal",
            technical.and_then(|t| t.macd_signal),
            f64::NEG_INFINITY,
            f64::INFINITY,
            0.0,
        );
        let macd_histogram = ledger.observe(
            symbol,
            "macd_histogram",
            technical.and_then(|t| t.macd_histogram),
            f64::NEG_INFINITY,
            f64::INFINITY,
            0.0,
        );
        let sma_ratio_short = ledger.observe(
            symbol,
            "sma_ratio_short",
            technical.and_then(|t| t.sma_ratio_short),
            1e-6,
            f64::INFINITY,
            DEFAULT_RATIO,
        );
        let sma_ratio_long = ledger.observe(
            symbol,
            "sma_ratio_long",
            technical.and_then(|t| t.sma_ratio_long),
            1e-6,
            f64::INFINITY,
            DEFAULT_RATIO,
        );
        let sma_cross = ledger.observe(
            symbol,
            "sma_cross",
            technical.and_then(|t| t.sma_cross),
            1e-6,
            f64::INFINITY,
            DEFAULT_RATIO,
        );
        let ema_ratio = ledger.observe(
            symbol,
            "ema_ratio",
            technical.and_then(|t| t.ema_ratio),
            1e-6,
            f64::INFINITY,
            DEFAULT_RATIO,
        );
        let bollinger_width = ledger.observe(
            symbol,
            "bollinger_width",
            technical.and_then(|t| t.bollinger_width),
            0.0,
            f64::INFINITY,
            0.0,
        );
        let bollinger_position = ledger.observe(
            symbol,
            "bollinger_position",
            technical.and_then(|t| t.bollinger_position),
            -2.0,
            2.0,
            0.0,
        );
        let atr_pct = ledger.observe(
            symbol,
            "atr_pct",
            technical.and_then(|t| t.atr_pct),
            0.0,
            f64::INFINITY,
            0.0,
        );
        let volatility_5d = ledger.observe(
            symbol,
            "volatility_5d",
            technical.and_then(|t| t.volatility_5d),
            0.0,
            f64::INFINITY,
            0.0,
        );
        let volatility_20d = ledger.observe(
            symbol,
            "volatility_20d",
            technical.and_then(|t| t.volatility_20d),
            0.0,
            f64::INFINITY,
            0.0,
        );
        let volume_ratio = ledger.observe(
            symbol,
            "volume_ratio",
            technical.and_then(|t| t.volume_ratio),
            0.0,
            f64::INFINITY,
            DEFAULT_RATIO,
        );
        let price_change_1d = ledger.observe(
            symbol,
            "price_change_1d",
            technical.and_then(|t| t.price_change_1d),
            -100.0,
            f64::INFINITY,
            0.0,
        );
        let current_price = ledger.observe(
            symbol,
            "current_price",
            technical.and_then(|t| t.current_price),
            1e-6,
            f64::INFINITY,
            0.0,
        );
        let technical_observed = ledger.observed - observed_before_technical;

        if technical_observed == 0 {
            return Err(PipelineError::IncompleteSignal {
                symbol: symbol.to_string(),
                reason: "no valid technical observations".to_string(),
            });
        }

        let context = bundle.context.as_ref();
        let index_change_pct = ledger.observe(
            symbol,
            "index_change_pct",
            context.and_then(|c| c.index_change_pct),
            -50.0,
            50.0,
            0.0,
        );
        let sector_change_pct = ledger.observe(
            symbol,
            "sector_change_pct",
            context.and_then(|c| c.sector_change_pct),
            -50.0,
            50.0,
            0.0,
        );
        let vix = ledger.observe(
            symbol,
            "vix",
            context.and_then(|c| c.vix),
            0.0,
            200.0,
            DEFAULT_VIX,
        );
        let market_hours = ledger.observe_flag(context.and_then(|c| c.market_hours));

        let mut quality_score = ledger.quality();
        if bundle.degraded {
            quality_score = quality_score.min(self.config.degraded_quality_cap);
        }

        let volatility_regime = if volatility_20d > f64::EPSILON {
            volatility_5d / volatility_20d
        } else {
            1.0
        };

        let record = FeatureRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timestamp,
            signal_max_timestamp: bundle.max_observed_at().unwrap_or(timestamp),
            sentiment_score,
            sentiment_confidence,
            article_count,
            social_score,
            social_volume,
            rsi,
            stoch_k,
            stoch_d,
            macd_line,
            macd_signal,
            macd_histogram,
            sma_ratio_short,
            sma_ratio_long,
            sma_cross,
            ema_ratio,
            bollinger_width,
            bollinger_position,
            atr_pct,
            volatility_5d,
            volatility_20d,
            volume_ratio,
            price_change_1d,
            current_price,
            index_change_pct,
            sector_change_pct,
            vix,
            market_hours,
            sentiment_momentum: sentiment_score * macd_histogram,
            volume_sentiment: volume_ratio * sentiment_score,
            sentiment_rsi: sentiment_score * ((rsi - 50.0) / 50.0),
            vix_volatility: vix * volatility_20d,
            news_weight: sentiment_confidence * (1.0 + article_count).ln(),
            trend_alignment: macd_histogram * (sma_cross - 1.0),
            volatility_regime,
            hour_of_day: timestamp.hour() as f64,
            day_of_week: timestamp.weekday().num_days_from_monday() as f64,
            quarter_end: if matches!(timestamp.month(), 3 | 6 | 9 | 12) && timestamp.day() > 24 {
                1.0
            } else {
                0.0
            },
            quality_score,
        };

        debug!(
            "Built feature record for {} at {} (quality {:.2})",
            symbol, timestamp, quality_score
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{MarketContext, SentimentSnapshot, SignalBundle, TechnicalSnapshot};
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, 0).unwrap()
    }

    fn full_bundle(observed_at: DateTime<Utc>) -> SignalBundle {
        let mut bundle = SignalBundle::new("AAPL", observed_at);
        bundle.sentiment = Some(SentimentSnapshot {
            score: Some(0.4),
            confidence: Some(0.8),
            article_count: Some(9.0),
            social_score: Some(0.2),
            social_volume: Some(150.0),
            observed_at,
        });
        bundle.technical = Some(TechnicalSnapshot {
            rsi: Some(62.0),
            stoch_k: Some(70.0),
            stoch_d: Some(64.0),
            macd_line: Some(0.8),
            macd_signal: Some(0.5),
            macd_histogram: Some(0.3),
            sma_ratio_short: Some(1.02),
            sma_ratio_long: Some(1.05),
            sma_cross: Some(1.03),
            ema_ratio: Some(1.01),
            bollinger_width: Some(0.06),
            bollinger_position: Some(0.4),
            atr_pct: Some(1.8),
            volatility_5d: Some(1.1),
            volatility_20d: Some(1.4),
            volume_ratio: Some(1.6),
            price_change_1d: Some(0.9),
            current_price: Some(187.5),
            observed_at,
        });
        bundle.context = Some(MarketContext {
            index_change_pct: Some(0.3),
            sector_change_pct: Some(0.5),
            vix: Some(16.0),
            market_hours: Some(true),
            observed_at,
        });
        bundle
    }

    #[test]
    fn full_bundle_scores_full_quality() {
        let engineer = FeatureEngineer::new(EngineerConfig::default());
        let observed = ts(9, 25);
        let stamp = ts(9, 30);

        let record = engineer.build(&full_bundle(observed), stamp).unwrap();
        assert_eq!(record.symbol, "AAPL");
        assert_eq!(record.timestamp, stamp);
        assert_eq!(record.signal_max_timestamp, observed);
        assert!((record.quality_score - 1.0).abs() < 1e-9);

        // Interaction terms derive from the validated values.
        assert!((record.sentiment_momentum - 0.4 * 0.3).abs() < 1e-9);
        assert!((record.volume_sentiment - 1.6 * 0.4).abs() < 1e-9);
        assert!((record.volatility_regime - 1.1 / 1.4).abs() < 1e-9);
        assert!((record.hour_of_day - 9.0).abs() < 1e-9);
        assert_eq!(record.vector().len(), FeatureRecord::FEATURE_WIDTH);
    }

    #[test]
    fn missing_sentiment_defaults_neutral_and_flags_quality() {
        let engineer = FeatureEngineer::new(EngineerConfig::default());
        let mut bundle = full_bundle(ts(9, 25));
        bundle.sentiment = None;

        let record = engineer.build(&bundle, ts(9, 30)).unwrap();
        assert_eq!(record.sentiment_score, 0.0);
        assert_eq!(record.sentiment_confidence, 0.0);
        assert_eq!(record.article_count, 0.0);
        // 22 of 27 optional observations present.
        assert!((record.quality_score - 22.0 / 27.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_values_are_treated_as_missing() {
        let engineer = FeatureEngineer::new(EngineerConfig::default());
        let mut bundle = full_bundle(ts(9, 25));
        if let Some(technical) = bundle.technical.as_mut() {
            technical.rsi = Some(140.0);
            technical.volume_ratio = Some(f64::NAN);
        }

        let record = engineer.build(&bundle, ts(9, 30)).unwrap();
        assert_eq!(record.rsi, 50.0);
        assert_eq!(record.volume_ratio, 1.0);
        assert!((record.quality_score - 25.0 / 27.0).abs() < 1e-9);
    }

    #[test]
    fn bundle_without_technical_observations_is_rejected() {
        let engineer = FeatureEngineer::new(EngineerConfig::default());
        let stamp = ts(9, 30);

        let mut no_block = SignalBundle::new("AAPL", stamp);
        no_block.sentiment = Some(SentimentSnapshot::empty(ts(9, 25)));
        let err = engineer.build(&no_block, stamp).unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteSignal { .. }));

        let mut empty_block = SignalBundle::new("AAPL", stamp);
        empty_block.technical = Some(TechnicalSnapshot::empty(ts(9, 25)));
        let err = engineer.build(&empty_block, stamp).unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteSignal { .. }));
    }

    #[test]
    fn empty_symbol_is_rejected() {
        let engineer = FeatureEngineer::new(EngineerConfig::default());
        let mut bundle = full_bundle(ts(9, 25));
        bundle.symbol = "  ".to_string();
        let err = engineer.build(&bundle, ts(9, 30)).unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteSignal { .. }));
    }

    #[test]
    fn future_dated_signal_is_rejected() {
        let engineer = FeatureEngineer::new(EngineerConfig::default());
        let stamp = ts(9, 30);
        let bundle = full_bundle(ts(9, 31));

        let err = engineer.build(&bundle, stamp).unwrap_err();
        match err {
            PipelineError::TemporalIntegrity(report) => {
                assert_eq!(report.violations.len(), 1);
                assert_eq!(report.violations[0].check, IntegrityCheck::FutureLeakage);
            }
            other => panic!("expected temporal integrity error, got {other}"),
        }
    }

    #[test]
    fn degraded_bundle_quality_is_capped() {
        let engineer = FeatureEngineer::new(EngineerConfig::default());
        let mut bundle = full_bundle(ts(9, 25));
        bundle.degraded = true;

        let record = engineer.build(&bundle, ts(9, 30)).unwrap();
        assert!((record.quality_score - 0.5).abs() < 1e-9);
    }
}
