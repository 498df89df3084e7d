// Heuristic model family
// Deterministic indicator cascade that needs no training, so the
// ensemble can produce recommendations before any history accumulates.

use crate::family::{normalize_probs, FamilyForecast, ModelError, ModelFamily};
use common::{FeatureRecord, Horizon};

/// Rule-based scorer over the named feature layout
#[derive(Debug, Clone, Default)]
pub struct HeuristicFamily;

impl HeuristicFamily {
    pub fn new() -> Self {
        Self
    }

    /// Bullish/bearish tilt in [-1, 1] from classic indicator rules
    fn tilt(features: &[f64]) -> f64 {
        let rsi = named(features, "rsi", 50.0);
        let macd_histogram = named(features, "macd_histogram", 0.0);
        let sma_cross = named(features, "sma_cross", 1.0);
        let bollinger_position = named(features, "bollinger_position", 0.0);
        let sentiment = named(features, "sentiment_score", 0.0);
        let sentiment_confidence = named(features, "sentiment_confidence", 0.0);
        let quality = named(features, "quality_score", 1.0);

        let mut score = 0.0;

        // Overbought/oversold mean reversion
        score += ((50.0 - rsi) / 50.0).clamp(-1.0, 1.0) * 0.30;

        // Trend confirmation from MACD and the moving-average cross
        score += macd_histogram.tanh() * 0.25;
        score += ((sma_cross - 1.0) * 10.0).clamp(-1.0, 1.0) * 0.15;

        // Price stretched outside the bands tends to snap back
        if bollinger_position < -1.0 {
            score += 0.10;
        } else if bollinger_position > 1.0 {
            score -= 0.10;
        }

        // News tilt weighted by how sure the sentiment source was
        score += (sentiment * sentiment_confidence).clamp(-1.0, 1.0) * 0.30;

        // Thin inputs shrink conviction toward neutral
        let dampening = 0.5 + 0.5 * quality.clamp(0.0, 1.0);
        (score * dampening).clamp(-1.0, 1.0)
    }

    fn expected_move_pct(features: &[f64], tilt: f64, horizon: Horizon) -> f64 {
        let atr_pct = named(features, "atr_pct", 0.0);
        let volatility = named(features, "volatility_5d", 0.0);
        let daily_range = atr_pct.max(volatility).max(0.5);
        let hours = horizon.duration().num_minutes() as f64 / 60.0;
        let horizon_scale = (hours / 24.0).sqrt();
        tilt * daily_range * horizon_scale
    }
}

fn named(features: &[f64], name: &str, default: f64) -> f64 {
    FeatureRecord::FEATURE_NAMES
        .iter()
        .position(|&n| n == name)
        .and_then(|idx| features.get(idx))
        .copied()
        .unwrap_or(default)
}

impl ModelFamily for HeuristicFamily {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn forecast(&self, features: &[f64], horizon: Horizon) -> Result<FamilyForecast, ModelError> {
        if features.len() != FeatureRecord::FEATURE_WIDTH {
            return Err(ModelError::InvalidData(format!(
                "expected {} features, got {}",
                FeatureRecord::FEATURE_WIDTH,
                features.len()
            )));
        }

        let tilt = Self::tilt(features);
        let mut probs = [
            0.5 * (1.0 - tilt),
            0.5 * (1.0 - tilt.abs()) + 0.1,
            0.5 * (1.0 + tilt),
        ];
        normalize_probs(&mut probs);

        let magnitude_pct = Self::expected_move_pct(features, tilt, horizon);
        Ok(FamilyForecast::new(probs, magnitude_pct))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Direction;

    fn set(features: &mut [f64], name: &str, value: f64) {
        let idx = FeatureRecord::FEATURE_NAMES
            .iter()
            .position(|&n| n == name)
            .unwrap();
        features[idx] = value;
    }

    fn neutral_features() -> Vec<f64> {
        let mut features = vec![0.0; FeatureRecord::FEATURE_WIDTH];
        set(&mut features, "rsi", 50.0);
        set(&mut features, "stoch_k", 50.0);
        set(&mut features, "stoch_d", 50.0);
        set(&mut features, "sma_ratio_short", 1.0);
        set(&mut features, "sma_ratio_long", 1.0);
        set(&mut features, "sma_cross", 1.0);
        set(&mut features, "ema_ratio", 1.0);
        set(&mut features, "volume_ratio", 1.0);
        set(&mut features, "current_price", 100.0);
        set(&mut features, "vix", 20.0);
        set(&mut features, "atr_pct", 1.5);
        set(&mut features, "volatility_5d", 1.2);
        set(&mut features, "quality_score", 1.0);
        features
    }

    #[test]
    fn neutral_inputs_lean_flat() {
        let family = HeuristicFamily::new();
        let features = neutral_features();
        let forecast = family.forecast(&features, Horizon::OneDay).unwrap();
        assert_eq!(forecast.direction(), Direction::Flat);
        assert!(forecast.magnitude_pct.abs() < 0.1);
    }

    #[test]
    fn oversold_bullish_inputs_lean_up() {
        let family = HeuristicFamily::new();
        let mut features = neutral_features();
        set(&mut features, "rsi", 22.0);
        set(&mut features, "macd_histogram", 0.8);
        set(&mut features, "sentiment_score", 0.7);
        set(&mut features, "sentiment_confidence", 0.9);

        let forecast = family.forecast(&features, Horizon::OneDay).unwrap();
        assert_eq!(forecast.direction(), Direction::Up);
        assert!(forecast.magnitude_pct > 0.5);
    }

    #[test]
    fn overbought_bearish_inputs_lean_down() {
        let family = HeuristicFamily::new();
        let mut features = neutral_features();
        set(&mut features, "rsi", 81.0);
        set(&mut features, "macd_histogram", -0.6);
        set(&mut features, "bollinger_position", 1.4);
        set(&mut features, "sentiment_score", -0.5);
        set(&mut features, "sentiment_confidence", 0.8);

        let forecast = family.forecast(&features, Horizon::FourHours).unwrap();
        assert_eq!(forecast.direction(), Direction::Down);
        assert!(forecast.magnitude_pct < 0.0);
    }

    #[test]
    fn longer_horizons_expect_bigger_moves() {
        let family = HeuristicFamily::new();
        let mut features = neutral_features();
        set(&mut features, "rsi", 25.0);
        set(&mut features, "sentiment_score", 0.6);
        set(&mut features, "sentiment_confidence", 0.9);

        let short = family.forecast(&features, Horizon::OneHour).unwrap();
        let long = family.forecast(&features, Horizon::OneDay).unwrap();
        assert!(long.magnitude_pct > short.magnitude_pct);
    }

    #[test]
    fn low_quality_shrinks_conviction() {
        let family = HeuristicFamily::new();
        let mut bullish = neutral_features();
        set(&mut bullish, "rsi", 25.0);
        set(&mut bullish, "sentiment_score", 0.8);
        set(&mut bullish, "sentiment_confidence", 0.9);

        let mut degraded = bullish.clone();
        set(&mut degraded, "quality_score", 0.2);

        let full = family.forecast(&bullish, Horizon::OneDay).unwrap();
        let thin = family.forecast(&degraded, Horizon::OneDay).unwrap();
        assert!(thin.confidence() < full.confidence());
        assert!(thin.magnitude_pct.abs() < full.magnitude_pct.abs());
    }

    #[test]
    fn wrong_width_is_rejected() {
        let family = HeuristicFamily::new();
        assert!(family.forecast(&[1.0, 2.0], Horizon::OneDay).is_err());
    }
}
