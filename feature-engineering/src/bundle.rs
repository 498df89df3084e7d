use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// News/social sentiment observations for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentimentSnapshot {
    pub score: Option<f64>,      // -1.0 to 1.0
    pub confidence: Option<f64>, // 0.0 to 1.0
    pub article_count: Option<f64>,
    pub social_score: Option<f64>,
    pub social_volume: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl SentimentSnapshot {
    pub fn empty(observed_at: DateTime<Utc>) -> Self {
        Self {
            score: None,
            confidence: None,
            article_count: None,
            social_score: None,
            social_volume: None,
            observed_at,
        }
    }
}

/// Technical indicator observations for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TechnicalSnapshot {
    pub rsi: Option<f64>, // 0 to 100
    pub stoch_k: Option<f64>,
    pub stoch_d: Option<f64>,
    pub macd_line: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub sma_ratio_short: Option<f64>,
    pub sma_ratio_long: Option<f64>,
    pub sma_cross: Option<f64>,
    pub ema_ratio: Option<f64>,
    pub bollinger_width: Option<f64>,
    pub bollinger_position: Option<f64>, // -1.0 to 1.0
    pub atr_pct: Option<f64>,
    pub volatility_5d: Option<f64>,
    pub volatility_20d: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub price_change_1d: Option<f64>,
    pub current_price: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl TechnicalSnapshot {
    pub fn empty(observed_at: DateTime<Utc>) -> Self {
        Self {
            rsi: None,
            stoch_k: None,
            stoch_d: None,
            macd_line: None,
            macd_signal: None,
            macd_histogram: None,
            sma_ratio_short: None,
            sma_ratio_long: None,
            sma_cross: None,
            ema_ratio: None,
            bollinger_width: None,
            bollinger_position: None,
            atr_pct: None,
            volatility_5d: None,
            volatility_20d: None,
            volume_ratio: None,
            price_change_1d: None,
            current_price: None,
            observed_at,
        }
    }
}

/// Broad-market context observations shared by every symbol in a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    pub index_change_pct: Option<f64>,
    pub sector_change_pct: Option<f64>,
    pub vix: Option<f64>,
    pub market_hours: Option<bool>,
    pub observed_at: DateTime<Utc>,
}

impl MarketContext {
    pub fn empty(observed_at: DateTime<Utc>) -> Self {
        Self {
            index_change_pct: None,
            sector_change_pct: None,
            vix: None,
            market_hours: None,
            observed_at,
        }
    }
}

/// Everything one fetch produced for one symbol. Each source block is a typed
/// struct; a missing block means the source produced nothing this cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalBundle {
    pub symbol: String,
    pub collected_at: DateTime<Utc>,
    pub sentiment: Option<SentimentSnapshot>,
    pub technical: Option<TechnicalSnapshot>,
    pub context: Option<MarketContext>,
    /// True when the bundle was served from the stale-fetch cache.
    pub degraded: bool,
}

impl SignalBundle {
    pub fn new(symbol: impl Into<String>, collected_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            collected_at,
            sentiment: None,
            technical: None,
            context: None,
            degraded: false,
        }
    }

    /// Latest observation timestamp across all present source blocks.
    pub fn max_observed_at(&self) -> Option<DateTime<Utc>> {
        let mut latest = None;
        let mut consider = |ts: DateTime<Utc>| match latest {
            Some(current) if current >= ts => {}
            _ => latest = Some(ts),
        };
        if let Some(s) = &self.sentiment {
            consider(s.observed_at);
        }
        if let Some(t) = &self.technical {
            consider(t.observed_at);
        }
        if let Some(c) = &self.context {
            consider(c.observed_at);
        }
        latest
    }
}
