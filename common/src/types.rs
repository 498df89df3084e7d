use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prediction horizon. The set is fixed because the per-horizon column names
/// (`*_1h`, `*_4h`, `*_1d`) are part of the external table contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Horizon {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::OneHour, Horizon::FourHours, Horizon::OneDay];

    /// The horizon that drives the optimal-action decision.
    pub const LONGEST: Horizon = Horizon::OneDay;

    pub fn label(&self) -> &'static str {
        match self {
            Horizon::OneHour => "1h",
            Horizon::FourHours => "4h",
            Horizon::OneDay => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Horizon::OneHour => Duration::hours(1),
            Horizon::FourHours => Duration::hours(4),
            Horizon::OneDay => Duration::hours(24),
        }
    }

    pub fn parse(label: &str) -> Option<Horizon> {
        match label {
            "1h" => Some(Horizon::OneHour),
            "4h" => Some(Horizon::FourHours),
            "1d" => Some(Horizon::OneDay),
            _ => None,
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Predicted price direction over one horizon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Down,
    Flat,
    Up,
}

impl Direction {
    /// Class index used by classification models: DOWN=0, FLAT=1, UP=2.
    pub fn class_index(&self) -> usize {
        match self {
            Direction::Down => 0,
            Direction::Flat => 1,
            Direction::Up => 2,
        }
    }

    pub fn from_class_index(index: usize) -> Direction {
        match index {
            0 => Direction::Down,
            1 => Direction::Flat,
            _ => Direction::Up,
        }
    }

    /// Classify a realized percent return with a flat band around zero.
    pub fn from_return(return_pct: f64, flat_band_pct: f64) -> Direction {
        if return_pct > flat_band_pct {
            Direction::Up
        } else if return_pct < -flat_band_pct {
            Direction::Down
        } else {
            Direction::Flat
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Flat => "FLAT",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s {
            "UP" => Some(Direction::Up),
            "DOWN" => Some(Direction::Down),
            "FLAT" => Some(Direction::Flat),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recommended trading action for one symbol/day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingAction {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl TradingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingAction::StrongBuy => "STRONG_BUY",
            TradingAction::Buy => "BUY",
            TradingAction::Hold => "HOLD",
            TradingAction::Sell => "SELL",
            TradingAction::StrongSell => "STRONG_SELL",
        }
    }

    pub fn parse(s: &str) -> Option<TradingAction> {
        match s {
            "STRONG_BUY" => Some(TradingAction::StrongBuy),
            "BUY" => Some(TradingAction::Buy),
            "HOLD" => Some(TradingAction::Hold),
            "SELL" => Some(TradingAction::Sell),
            "STRONG_SELL" => Some(TradingAction::StrongSell),
            _ => None,
        }
    }

    /// +1 for long actions, -1 for short actions, 0 for HOLD.
    pub fn position_sign(&self) -> f64 {
        match self {
            TradingAction::StrongBuy | TradingAction::Buy => 1.0,
            TradingAction::Sell | TradingAction::StrongSell => -1.0,
            TradingAction::Hold => 0.0,
        }
    }
}

impl std::fmt::Display for TradingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fixed-width engineered feature record for one symbol at one timestamp.
///
/// Every numeric field is always present; missing upstream observations are
/// replaced by the documented neutral default and reflected in
/// `quality_score`. `signal_max_timestamp` is the newest constituent signal
/// observation and must never exceed `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureRecord {
    pub id: Uuid,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub signal_max_timestamp: DateTime<Utc>,

    // Sentiment block
    pub sentiment_score: f64,      // -1.0 to 1.0
    pub sentiment_confidence: f64, // 0.0 to 1.0
    pub article_count: f64,
    pub social_score: f64,
    pub social_volume: f64,

    // Technical block
    pub rsi: f64, // 0 to 100
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub sma_ratio_short: f64, // price / SMA(5)
    pub sma_ratio_long: f64,  // price / SMA(20)
    pub sma_cross: f64,       // SMA(5) / SMA(20)
    pub ema_ratio: f64,
    pub bollinger_width: f64,
    pub bollinger_position: f64, // -1.0 (lower band) to 1.0 (upper band)
    pub atr_pct: f64,
    pub volatility_5d: f64,
    pub volatility_20d: f64,
    pub volume_ratio: f64,
    pub price_change_1d: f64,
    pub current_price: f64, // 0.0 when unpriced; always quality-flagged

    // Market context block
    pub index_change_pct: f64,
    pub sector_change_pct: f64,
    pub vix: f64,
    pub market_hours: f64, // 1.0 during regular session

    // Interaction block
    pub sentiment_momentum: f64,
    pub volume_sentiment: f64,
    pub sentiment_rsi: f64,
    pub vix_volatility: f64,
    pub news_weight: f64,
    pub trend_alignment: f64,
    pub volatility_regime: f64,

    // Calendar block
    pub hour_of_day: f64,
    pub day_of_week: f64,
    pub quarter_end: f64,

    /// Fraction of optional inputs actually observed, 0.0 to 1.0.
    pub quality_score: f64,
}

impl FeatureRecord {
    /// Ordered feature schema consumed by models. The order is load-bearing:
    /// `vector()` and every trained model depend on it.
    pub const FEATURE_NAMES: [&'static str; 38] = [
        "sentiment_score",
        "sentiment_confidence",
        "article_count",
        "social_score",
        "social_volume",
        "rsi",
        "stoch_k",
        "stoch_d",
        "macd_line",
        "macd_signal",
        "macd_histogram",
        "sma_ratio_short",
        "sma_ratio_long",
        "sma_cross",
        "ema_ratio",
        "bollinger_width",
        "bollinger_position",
        "atr_pct",
        "volatility_5d",
        "volatility_20d",
        "volume_ratio",
        "price_change_1d",
        "current_price",
        "index_change_pct",
        "sector_change_pct",
        "vix",
        "market_hours",
        "sentiment_momentum",
        "volume_sentiment",
        "sentiment_rsi",
        "vix_volatility",
        "news_weight",
        "trend_alignment",
        "volatility_regime",
        "hour_of_day",
        "day_of_week",
        "quarter_end",
        "quality_score",
    ];

    pub const FEATURE_WIDTH: usize = Self::FEATURE_NAMES.len();

    /// Fixed-width model input vector in `FEATURE_NAMES` order.
    pub fn vector(&self) -> Vec<f64> {
        vec![
            self.sentiment_score,
            self.sentiment_confidence,
            self.article_count,
            self.social_score,
            self.social_volume,
            self.rsi,
            self.stoch_k,
            self.stoch_d,
            self.macd_line,
            self.macd_signal,
            self.macd_histogram,
            self.sma_ratio_short,
            self.sma_ratio_long,
            self.sma_cross,
            self.ema_ratio,
            self.bollinger_width,
            self.bollinger_position,
            self.atr_pct,
            self.volatility_5d,
            self.volatility_20d,
            self.volume_ratio,
            self.price_change_1d,
            self.current_price,
            self.index_change_pct,
            self.sector_change_pct,
            self.vix,
            self.market_hours,
            self.sentiment_momentum,
            self.volume_sentiment,
            self.sentiment_rsi,
            self.vix_volatility,
            self.news_weight,
            self.trend_alignment,
            self.volatility_regime,
            self.hour_of_day,
            self.day_of_week,
            self.quarter_end,
            self.quality_score,
        ]
    }

    pub fn trading_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Fully-observed baseline record with every indicator at its neutral
    /// value. Callers overwrite the fields they care about.
    pub fn neutral(symbol: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timestamp,
            signal_max_timestamp: timestamp,
            sentiment_score: 0.0,
            sentiment_confidence: 0.0,
            article_count: 0.0,
            social_score: 0.0,
            social_volume: 0.0,
            rsi: 50.0,
            stoch_k: 50.0,
            stoch_d: 50.0,
            macd_line: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            sma_ratio_short: 1.0,
            sma_ratio_long: 1.0,
            sma_cross: 1.0,
            ema_ratio: 1.0,
            bollinger_width: 0.0,
            bollinger_position: 0.0,
            atr_pct: 0.0,
            volatility_5d: 0.0,
            volatility_20d: 0.0,
            volume_ratio: 1.0,
            price_change_1d: 0.0,
            current_price: 100.0,
            index_change_pct: 0.0,
            sector_change_pct: 0.0,
            vix: 20.0,
            market_hours: 1.0,
            sentiment_momentum: 0.0,
            volume_sentiment: 0.0,
            sentiment_rsi: 0.0,
            vix_volatility: 0.0,
            news_weight: 0.0,
            trend_alignment: 0.0,
            volatility_regime: 1.0,
            hour_of_day: 0.0,
            day_of_week: 0.0,
            quarter_end: 0.0,
            quality_score: 1.0,
        }
    }
}

/// FNV-1a hash of the ordered feature schema. Stored with every model version
/// so a schema drift is caught before stale models score fresh vectors.
pub fn feature_schema_hash() -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for name in FeatureRecord::FEATURE_NAMES {
        for byte in name.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash ^= b'|' as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{:016x}", hash)
}

/// One horizon's forecast inside a prediction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HorizonForecast {
    pub horizon: Horizon,
    pub direction: Direction,
    /// Expected percent price change, signed.
    pub magnitude_pct: f64,
    /// Calibrated probability of the predicted direction, 0.0 to 1.0.
    pub confidence: f64,
}

/// Per-symbol/day prediction across all horizons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub symbol: String,
    pub prediction_date: NaiveDate,
    /// Equal to the source feature's timestamp by construction.
    pub created_at: DateTime<Utc>,
    pub model_version: String,
    pub forecasts: Vec<HorizonForecast>,
    pub optimal_action: TradingAction,
    pub avg_confidence: f64,
}

impl Prediction {
    pub fn forecast(&self, horizon: Horizon) -> Option<&HorizonForecast> {
        self.forecasts.iter().find(|f| f.horizon == horizon)
    }
}

/// One horizon's realized outcome. Exit fields stay `None` while the price is
/// pending and are backfilled exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HorizonOutcome {
    pub horizon: Horizon,
    pub exit_price: Option<f64>,
    pub return_pct: Option<f64>,
    pub direction: Option<Direction>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl HorizonOutcome {
    pub fn pending(horizon: Horizon) -> HorizonOutcome {
        HorizonOutcome {
            horizon,
            exit_price: None,
            return_pct: None,
            direction: None,
            recorded_at: None,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.return_pct.is_some()
    }
}

/// Realized outcome for one feature record, one row per feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub first_recorded_at: DateTime<Utc>,
    pub horizons: Vec<HorizonOutcome>,
}

impl Outcome {
    pub fn horizon(&self, horizon: Horizon) -> Option<&HorizonOutcome> {
        self.horizons.iter().find(|h| h.horizon == horizon)
    }

    /// True once every horizon has a realized return.
    pub fn is_complete(&self) -> bool {
        Horizon::ALL
            .iter()
            .all(|h| self.horizon(*h).map(|o| o.is_realized()).unwrap_or(false))
    }
}

/// Lifecycle status of a model version. Rows are append-only; exactly one
/// version is `Active` at any time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Active,
    Superseded,
    Rejected,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Active => "active",
            ModelStatus::Superseded => "superseded",
            ModelStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<ModelStatus> {
        match s {
            "active" => Some(ModelStatus::Active),
            "superseded" => Some(ModelStatus::Superseded),
            "rejected" => Some(ModelStatus::Rejected),
            _ => None,
        }
    }
}

/// Per-horizon evaluation metrics attached to a model version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HorizonMetrics {
    pub horizon: Horizon,
    pub direction_accuracy: f64,
    pub magnitude_mae: f64,
    pub samples: i64,
}

/// One evaluated model version (accepted or rejected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersionRecord {
    pub version: String,
    pub status: ModelStatus,
    pub trained_at: DateTime<Utc>,
    pub training_samples: i64,
    pub feature_schema_hash: String,
    pub metrics: Vec<HorizonMetrics>,
    pub created_at: DateTime<Utc>,
}

impl ModelVersionRecord {
    pub fn metrics_for(&self, horizon: Horizon) -> Option<&HorizonMetrics> {
        self.metrics.iter().find(|m| m.horizon == horizon)
    }
}

/// Batch phase identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Morning,
    Evening,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Morning => "morning",
            Phase::Evening => "evening",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        match s {
            "morning" => Some(Phase::Morning),
            "evening" => Some(Phase::Evening),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only phase completion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCompletion {
    pub phase: Phase,
    pub trading_date: NaiveDate,
    pub completed_at: DateTime<Utc>,
}

/// Per-symbol failure captured in a batch summary; never aborts the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFailure {
    pub symbol: String,
    pub error: String,
}

/// Machine-readable result of a morning batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorningSummary {
    pub run_id: Uuid,
    pub trading_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub symbols_total: usize,
    pub features_built: usize,
    pub predictions_made: usize,
    pub skipped_existing: usize,
    pub failures: Vec<SymbolFailure>,
    pub guard_passed: bool,
    pub model_version: String,
}

/// Machine-readable result of an evening batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EveningSummary {
    pub run_id: Uuid,
    pub trading_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes_recorded: usize,
    pub horizons_backfilled: usize,
    pub outcomes_pending: usize,
    pub failures: Vec<SymbolFailure>,
    pub guard_passed: bool,
    pub training_skipped: bool,
    pub training_samples: usize,
    pub model_promoted: Option<String>,
    pub model_rejected: Option<String>,
    pub details: serde_json::Value,
}
