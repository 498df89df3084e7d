use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    Direction, EveningSummary, FeatureRecord, Horizon, HorizonForecast, HorizonMetrics,
    HorizonOutcome, ModelStatus, ModelVersionRecord, MorningSummary, Outcome, Phase,
    PhaseCompletion, Prediction, TradingAction,
};

/// Embedded store for the pipeline. All uniqueness rules live here as schema
/// constraints: concurrent writers rely on insert-or-reject, never on
/// application-side locking.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// One prediction joined to its feature and outcome, for backtest replay.
#[derive(Debug, Clone)]
pub struct ReplayRow {
    pub feature_id: Uuid,
    pub symbol: String,
    pub feature_timestamp: DateTime<Utc>,
    pub model_version: String,
    pub optimal_action: TradingAction,
    pub forecasts: Vec<HorizonForecast>,
    pub entry_price: f64,
    pub outcomes: Vec<HorizonOutcome>,
}

/// A feature joined to its fully-realized outcome; the unit counted against
/// the training floor.
#[derive(Debug, Clone)]
pub struct PairedSample {
    pub feature: FeatureRecord,
    pub return_1h: f64,
    pub return_4h: f64,
    pub return_1d: f64,
}

impl PairedSample {
    pub fn return_for(&self, horizon: Horizon) -> f64 {
        match horizon {
            Horizon::OneHour => self.return_1h,
            Horizon::FourHours => self.return_4h,
            Horizon::OneDay => self.return_1d,
        }
    }
}

/// Outcome row with at least one unrealized horizon, joined to feature
/// timing so the recorder can decide which horizons have elapsed.
#[derive(Debug, Clone)]
pub struct PendingOutcome {
    pub feature_id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub feature_timestamp: DateTime<Utc>,
    pub horizons: Vec<HorizonOutcome>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl Store {
    /// Open (or create) the store at the given path.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. Pinned to a single connection: a second
    /// pooled connection would see a different empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory store")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and the constraint indexes that back the
    /// insert-or-reject contracts.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enhanced_features (
                id BLOB PRIMARY KEY,
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                signal_max_timestamp TEXT NOT NULL,
                sentiment_score REAL NOT NULL,
                sentiment_confidence REAL NOT NULL,
                article_count REAL NOT NULL,
                social_score REAL NOT NULL,
                social_volume REAL NOT NULL,
                rsi REAL NOT NULL,
                stoch_k REAL NOT NULL,
                stoch_d REAL NOT NULL,
                macd_line REAL NOT NULL,
                macd_signal REAL NOT NULL,
                macd_histogram REAL NOT NULL,
                sma_ratio_short REAL NOT NULL,
                sma_ratio_long REAL NOT NULL,
                sma_cross REAL NOT NULL,
                ema_ratio REAL NOT NULL,
                bollinger_width REAL NOT NULL,
                bollinger_position REAL NOT NULL,
                atr_pct REAL NOT NULL,
                volatility_5d REAL NOT NULL,
                volatility_20d REAL NOT NULL,
                volume_ratio REAL NOT NULL,
                price_change_1d REAL NOT NULL,
                current_price REAL NOT NULL,
                index_change_pct REAL NOT NULL,
                sector_change_pct REAL NOT NULL,
                vix REAL NOT NULL,
                market_hours REAL NOT NULL,
                sentiment_momentum REAL NOT NULL,
                volume_sentiment REAL NOT NULL,
                sentiment_rsi REAL NOT NULL,
                vix_volatility REAL NOT NULL,
                news_weight REAL NOT NULL,
                trend_alignment REAL NOT NULL,
                volatility_regime REAL NOT NULL,
                hour_of_day REAL NOT NULL,
                day_of_week REAL NOT NULL,
                quarter_end REAL NOT NULL,
                quality_score REAL NOT NULL,
                UNIQUE(symbol, timestamp)
            );

            CREATE INDEX IF NOT EXISTS idx_features_timestamp ON enhanced_features(timestamp);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create enhanced_features table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id BLOB PRIMARY KEY,
                feature_id BLOB NOT NULL REFERENCES enhanced_features(id),
                symbol TEXT NOT NULL,
                prediction_date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                model_version TEXT NOT NULL,
                direction_1h TEXT NOT NULL,
                magnitude_1h REAL NOT NULL,
                confidence_1h REAL NOT NULL,
                direction_4h TEXT NOT NULL,
                magnitude_4h REAL NOT NULL,
                confidence_4h REAL NOT NULL,
                direction_1d TEXT NOT NULL,
                magnitude_1d REAL NOT NULL,
                confidence_1d REAL NOT NULL,
                optimal_action TEXT NOT NULL,
                avg_confidence REAL NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_predictions_symbol_date
                ON predictions(symbol, prediction_date);
            CREATE INDEX IF NOT EXISTS idx_predictions_version ON predictions(model_version);
            CREATE INDEX IF NOT EXISTS idx_predictions_feature ON predictions(feature_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create predictions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enhanced_outcomes (
                id BLOB PRIMARY KEY,
                feature_id BLOB NOT NULL UNIQUE REFERENCES enhanced_features(id),
                symbol TEXT NOT NULL,
                entry_price REAL NOT NULL,
                first_recorded_at TEXT NOT NULL,
                exit_price_1h REAL,
                return_pct_1h REAL,
                direction_1h TEXT,
                recorded_at_1h TEXT,
                exit_price_4h REAL,
                return_pct_4h REAL,
                direction_4h TEXT,
                recorded_at_4h TEXT,
                exit_price_1d REAL,
                return_pct_1d REAL,
                direction_1d TEXT,
                recorded_at_1d TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_outcomes_symbol ON enhanced_outcomes(symbol);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create enhanced_outcomes table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_performance (
                version TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                trained_at TEXT NOT NULL,
                training_samples INTEGER NOT NULL,
                feature_schema_hash TEXT NOT NULL,
                accuracy_1h REAL,
                mae_1h REAL,
                samples_1h INTEGER,
                accuracy_4h REAL,
                mae_4h REAL,
                samples_4h INTEGER,
                accuracy_1d REAL,
                mae_1d REAL,
                samples_1d INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_performance_active
                ON model_performance(status) WHERE status = 'active';
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create model_performance table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS morning_analysis (
                id BLOB PRIMARY KEY,
                trading_date TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                symbols_total INTEGER NOT NULL,
                features_built INTEGER NOT NULL,
                predictions_made INTEGER NOT NULL,
                skipped_existing INTEGER NOT NULL,
                failure_count INTEGER NOT NULL,
                failures TEXT NOT NULL,
                guard_passed INTEGER NOT NULL,
                model_version TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evening_analysis (
                id BLOB PRIMARY KEY,
                trading_date TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                outcomes_recorded INTEGER NOT NULL,
                horizons_backfilled INTEGER NOT NULL,
                outcomes_pending INTEGER NOT NULL,
                failure_count INTEGER NOT NULL,
                failures TEXT NOT NULL,
                guard_passed INTEGER NOT NULL,
                training_skipped INTEGER NOT NULL,
                training_samples INTEGER NOT NULL,
                model_promoted TEXT,
                model_rejected TEXT,
                details TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS phase_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phase TEXT NOT NULL,
                trading_date TEXT NOT NULL,
                completed_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create analysis tables")?;

        info!("Store schema initialized");
        Ok(())
    }

    // ---- features ----

    pub async fn insert_feature(&self, record: &FeatureRecord) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO enhanced_features (
                id, symbol, timestamp, signal_max_timestamp,
                sentiment_score, sentiment_confidence, article_count, social_score, social_volume,
                rsi, stoch_k, stoch_d, macd_line, macd_signal, macd_histogram,
                sma_ratio_short, sma_ratio_long, sma_cross, ema_ratio,
                bollinger_width, bollinger_position, atr_pct,
                volatility_5d, volatility_20d, volume_ratio, price_change_1d, current_price,
                index_change_pct, sector_change_pct, vix, market_hours,
                sentiment_momentum, volume_sentiment, sentiment_rsi, vix_volatility,
                news_weight, trend_alignment, volatility_regime,
                hour_of_day, day_of_week, quarter_end, quality_score
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(&record.symbol)
        .bind(record.timestamp)
        .bind(record.signal_max_timestamp)
        .bind(record.sentiment_score)
        .bind(record.sentiment_confidence)
        .bind(record.article_count)
        .bind(record.social_score)
        .bind(record.social_volume)
        .bind(record.rsi)
        .bind(record.stoch_k)
        .bind(record.stoch_d)
        .bind(record.macd_line)
        .bind(record.macd_signal)
        .bind(record.macd_histogram)
        .bind(record.sma_ratio_short)
        .bind(record.sma_ratio_long)
        .bind(record.sma_cross)
        .bind(record.ema_ratio)
        .bind(record.bollinger_width)
        .bind(record.bollinger_position)
        .bind(record.atr_pct)
        .bind(record.volatility_5d)
        .bind(record.volatility_20d)
        .bind(record.volume_ratio)
        .bind(record.price_change_1d)
        .bind(record.current_price)
        .bind(record.index_change_pct)
        .bind(record.sector_change_pct)
        .bind(record.vix)
        .bind(record.market_hours)
        .bind(record.sentiment_momentum)
        .bind(record.volume_sentiment)
        .bind(record.sentiment_rsi)
        .bind(record.vix_volatility)
        .bind(record.news_weight)
        .bind(record.trend_alignment)
        .bind(record.volatility_regime)
        .bind(record.hour_of_day)
        .bind(record.day_of_week)
        .bind(record.quarter_end)
        .bind(record.quality_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_feature(&self, id: Uuid) -> PipelineResult<Option<FeatureRecord>> {
        let row = sqlx::query("SELECT * FROM enhanced_features WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| feature_from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn count_features(&self) -> PipelineResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enhanced_features")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Features older than the cutoff that have no outcome row yet.
    pub async fn features_awaiting_outcome(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<FeatureRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT f.* FROM enhanced_features f
            LEFT JOIN enhanced_outcomes o ON o.feature_id = f.id
            WHERE o.id IS NULL AND f.timestamp <= ?
            ORDER BY f.timestamp ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| feature_from_row(r).map_err(Into::into)).collect()
    }

    /// Features that embed a constituent signal newer than their own
    /// timestamp. Any row here is a future-leakage violation.
    pub async fn leaky_features(&self) -> PipelineResult<Vec<(Uuid, String)>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, symbol FROM enhanced_features WHERE signal_max_timestamp > timestamp",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Features past their due window with no outcome row.
    pub async fn overdue_features(
        &self,
        due_cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<(Uuid, String, DateTime<Utc>)>> {
        let rows = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>)>(
            r#"
            SELECT f.id, f.symbol, f.timestamp FROM enhanced_features f
            LEFT JOIN enhanced_outcomes o ON o.feature_id = f.id
            WHERE o.id IS NULL AND f.timestamp <= ?
            ORDER BY f.timestamp ASC
            "#,
        )
        .bind(due_cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- predictions ----

    pub async fn insert_prediction(&self, prediction: &Prediction) -> PipelineResult<()> {
        let forecast = |h: Horizon| -> PipelineResult<&HorizonForecast> {
            prediction.forecast(h).ok_or_else(|| {
                PipelineError::Model(format!("prediction missing {} forecast", h.label()))
            })
        };
        let f1h = *forecast(Horizon::OneHour)?;
        let f4h = *forecast(Horizon::FourHours)?;
        let f1d = *forecast(Horizon::OneDay)?;

        let result = sqlx::query(
            r#"
            INSERT INTO predictions (
                id, feature_id, symbol, prediction_date, created_at, model_version,
                direction_1h, magnitude_1h, confidence_1h,
                direction_4h, magnitude_4h, confidence_4h,
                direction_1d, magnitude_1d, confidence_1d,
                optimal_action, avg_confidence
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(prediction.id)
        .bind(prediction.feature_id)
        .bind(&prediction.symbol)
        .bind(prediction.prediction_date)
        .bind(prediction.created_at)
        .bind(&prediction.model_version)
        .bind(f1h.direction.as_str())
        .bind(f1h.magnitude_pct)
        .bind(f1h.confidence)
        .bind(f4h.direction.as_str())
        .bind(f4h.magnitude_pct)
        .bind(f4h.confidence)
        .bind(f1d.direction.as_str())
        .bind(f1d.magnitude_pct)
        .bind(f1d.confidence)
        .bind(prediction.optimal_action.as_str())
        .bind(prediction.avg_confidence)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(PipelineError::DuplicatePrediction {
                symbol: prediction.symbol.clone(),
                date: prediction.prediction_date,
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn prediction_exists(&self, symbol: &str, date: NaiveDate) -> PipelineResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM predictions WHERE symbol = ? AND prediction_date = ?",
        )
        .bind(symbol)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// (symbol, date) pairs holding more than one prediction. Always empty
    /// unless the uniqueness constraint has been tampered with.
    pub async fn duplicate_prediction_groups(
        &self,
    ) -> PipelineResult<Vec<(String, NaiveDate, i64)>> {
        let rows = sqlx::query_as::<_, (String, NaiveDate, i64)>(
            r#"
            SELECT symbol, prediction_date, COUNT(*) FROM predictions
            GROUP BY symbol, prediction_date
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Predictions whose created_at differs from their feature's timestamp.
    pub async fn prediction_timestamp_mismatches(&self) -> PipelineResult<Vec<(Uuid, String)>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT p.id, p.symbol FROM predictions p
            JOIN enhanced_features f ON f.id = p.feature_id
            WHERE p.created_at != f.timestamp
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn orphan_prediction_count(&self) -> PipelineResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM predictions p
            LEFT JOIN enhanced_features f ON f.id = p.feature_id
            WHERE f.id IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ---- outcomes ----

    pub async fn insert_outcome(&self, outcome: &Outcome) -> PipelineResult<()> {
        let horizon = |h: Horizon| outcome.horizon(h).copied().unwrap_or(HorizonOutcome::pending(h));
        let o1h = horizon(Horizon::OneHour);
        let o4h = horizon(Horizon::FourHours);
        let o1d = horizon(Horizon::OneDay);

        let result = sqlx::query(
            r#"
            INSERT INTO enhanced_outcomes (
                id, feature_id, symbol, entry_price, first_recorded_at,
                exit_price_1h, return_pct_1h, direction_1h, recorded_at_1h,
                exit_price_4h, return_pct_4h, direction_4h, recorded_at_4h,
                exit_price_1d, return_pct_1d, direction_1d, recorded_at_1d
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(outcome.id)
        .bind(outcome.feature_id)
        .bind(&outcome.symbol)
        .bind(outcome.entry_price)
        .bind(outcome.first_recorded_at)
        .bind(o1h.exit_price)
        .bind(o1h.return_pct)
        .bind(o1h.direction.map(|d| d.as_str()))
        .bind(o1h.recorded_at)
        .bind(o4h.exit_price)
        .bind(o4h.return_pct)
        .bind(o4h.direction.map(|d| d.as_str()))
        .bind(o4h.recorded_at)
        .bind(o1d.exit_price)
        .bind(o1d.return_pct)
        .bind(o1d.direction.map(|d| d.as_str()))
        .bind(o1d.recorded_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(PipelineError::DuplicateOutcome {
                feature_id: outcome.feature_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Fill one horizon's pending fields. Applies only when the exit is still
    /// null; returns false when a previous backfill already claimed it.
    pub async fn backfill_outcome_horizon(
        &self,
        feature_id: Uuid,
        horizon: Horizon,
        exit_price: f64,
        return_pct: f64,
        direction: Direction,
        recorded_at: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let sql = match horizon {
            Horizon::OneHour => {
                r#"UPDATE enhanced_outcomes
                   SET exit_price_1h = ?, return_pct_1h = ?, direction_1h = ?, recorded_at_1h = ?
                   WHERE feature_id = ? AND exit_price_1h IS NULL"#
            }
            Horizon::FourHours => {
                r#"UPDATE enhanced_outcomes
                   SET exit_price_4h = ?, return_pct_4h = ?, direction_4h = ?, recorded_at_4h = ?
                   WHERE feature_id = ? AND exit_price_4h IS NULL"#
            }
            Horizon::OneDay => {
                r#"UPDATE enhanced_outcomes
                   SET exit_price_1d = ?, return_pct_1d = ?, direction_1d = ?, recorded_at_1d = ?
                   WHERE feature_id = ? AND exit_price_1d IS NULL"#
            }
        };
        let result = sqlx::query(sql)
            .bind(exit_price)
            .bind(return_pct)
            .bind(direction.as_str())
            .bind(recorded_at)
            .bind(feature_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fetch_outcome(&self, feature_id: Uuid) -> PipelineResult<Option<Outcome>> {
        let row = sqlx::query("SELECT * FROM enhanced_outcomes WHERE feature_id = ?")
            .bind(feature_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| outcome_from_row(&r)).transpose().map_err(Into::into)
    }

    /// Outcome rows with at least one unrealized horizon.
    pub async fn pending_outcomes(&self) -> PipelineResult<Vec<PendingOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT o.*, f.timestamp AS feature_timestamp
            FROM enhanced_outcomes o
            JOIN enhanced_features f ON f.id = o.feature_id
            WHERE o.exit_price_1h IS NULL OR o.exit_price_4h IS NULL OR o.exit_price_1d IS NULL
            ORDER BY f.timestamp ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            let outcome = outcome_from_row(row)?;
            pending.push(PendingOutcome {
                feature_id: outcome.feature_id,
                symbol: outcome.symbol.clone(),
                entry_price: outcome.entry_price,
                feature_timestamp: row.try_get("feature_timestamp")?,
                horizons: outcome.horizons,
            });
        }
        Ok(pending)
    }

    pub async fn orphan_outcome_count(&self) -> PipelineResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM enhanced_outcomes o
            LEFT JOIN enhanced_features f ON f.id = o.feature_id
            WHERE f.id IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Per-horizon recording timestamps joined to feature timestamps, for the
    /// guard's premature-recording audit.
    pub async fn outcome_recording_audit(
        &self,
    ) -> PipelineResult<
        Vec<(Uuid, DateTime<Utc>, Option<DateTime<Utc>>, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
    > {
        let rows = sqlx::query_as::<
            _,
            (Uuid, DateTime<Utc>, Option<DateTime<Utc>>, Option<DateTime<Utc>>, Option<DateTime<Utc>>),
        >(
            r#"
            SELECT o.feature_id, f.timestamp, o.recorded_at_1h, o.recorded_at_4h, o.recorded_at_1d
            FROM enhanced_outcomes o
            JOIN enhanced_features f ON f.id = o.feature_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- training / replay reads ----

    /// Features joined to fully-realized outcomes, oldest first.
    pub async fn paired_samples(&self) -> PipelineResult<Vec<PairedSample>> {
        let rows = sqlx::query(
            r#"
            SELECT f.*, o.return_pct_1h AS paired_1h, o.return_pct_4h AS paired_4h,
                   o.return_pct_1d AS paired_1d
            FROM enhanced_features f
            JOIN enhanced_outcomes o ON o.feature_id = f.id
            WHERE o.return_pct_1h IS NOT NULL
              AND o.return_pct_4h IS NOT NULL
              AND o.return_pct_1d IS NOT NULL
            ORDER BY f.timestamp ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in &rows {
            samples.push(PairedSample {
                feature: feature_from_row(row)?,
                return_1h: row.try_get("paired_1h")?,
                return_4h: row.try_get("paired_4h")?,
                return_1d: row.try_get("paired_1d")?,
            });
        }
        Ok(samples)
    }

    /// Prediction/feature/outcome joins for one model version, oldest first.
    pub async fn replay_rows(&self, model_version: &str) -> PipelineResult<Vec<ReplayRow>> {
        let rows = sqlx::query(
            r#"
            SELECT p.feature_id, p.symbol, f.timestamp AS feature_timestamp,
                   p.model_version, p.optimal_action,
                   p.direction_1h, p.magnitude_1h, p.confidence_1h,
                   p.direction_4h, p.magnitude_4h, p.confidence_4h,
                   p.direction_1d, p.magnitude_1d, p.confidence_1d,
                   o.entry_price,
                   o.exit_price_1h, o.return_pct_1h, o.direction_1h AS out_direction_1h, o.recorded_at_1h,
                   o.exit_price_4h, o.return_pct_4h, o.direction_4h AS out_direction_4h, o.recorded_at_4h,
                   o.exit_price_1d, o.return_pct_1d, o.direction_1d AS out_direction_1d, o.recorded_at_1d
            FROM predictions p
            JOIN enhanced_features f ON f.id = p.feature_id
            JOIN enhanced_outcomes o ON o.feature_id = p.feature_id
            WHERE p.model_version = ?
            ORDER BY f.timestamp ASC, p.symbol ASC
            "#,
        )
        .bind(model_version)
        .fetch_all(&self.pool)
        .await?;

        let mut replay = Vec::with_capacity(rows.len());
        for row in &rows {
            replay.push(replay_from_row(row)?);
        }
        Ok(replay)
    }

    // ---- model versions ----

    /// Append a version row and atomically make it the single active one.
    pub async fn promote_model_version(&self, record: &ModelVersionRecord) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE model_performance SET status = 'superseded' WHERE status = 'active'")
            .execute(&mut *tx)
            .await?;
        insert_model_version_conn(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append an evaluation row without touching the active version.
    pub async fn insert_model_version(&self, record: &ModelVersionRecord) -> PipelineResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_model_version_conn(&mut conn, record).await?;
        Ok(())
    }

    pub async fn active_model_version(&self) -> PipelineResult<Option<ModelVersionRecord>> {
        let row = sqlx::query("SELECT * FROM model_performance WHERE status = 'active'")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| model_version_from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn model_version_history(&self) -> PipelineResult<Vec<ModelVersionRecord>> {
        let rows = sqlx::query("SELECT * FROM model_performance ORDER BY created_at ASC, version ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| model_version_from_row(r).map_err(Into::into)).collect()
    }

    // ---- phase log & summaries ----

    pub async fn record_phase_completion(
        &self,
        phase: Phase,
        trading_date: NaiveDate,
    ) -> PipelineResult<()> {
        sqlx::query("INSERT INTO phase_log (phase, trading_date, completed_at) VALUES (?, ?, ?)")
            .bind(phase.as_str())
            .bind(trading_date)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn phase_completed_on(
        &self,
        phase: Phase,
        trading_date: NaiveDate,
    ) -> PipelineResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM phase_log WHERE phase = ? AND trading_date = ?",
        )
        .bind(phase.as_str())
        .bind(trading_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn last_phase_completion(&self) -> PipelineResult<Option<PhaseCompletion>> {
        let row = sqlx::query_as::<_, (String, NaiveDate, DateTime<Utc>)>(
            "SELECT phase, trading_date, completed_at FROM phase_log ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(phase, trading_date, completed_at)| {
            Phase::parse(&phase).map(|phase| PhaseCompletion {
                phase,
                trading_date,
                completed_at,
            })
        }))
    }

    pub async fn insert_morning_summary(&self, summary: &MorningSummary) -> Result<()> {
        let failures = serde_json::to_string(&summary.failures)
            .context("Failed to serialize morning failures")?;
        sqlx::query(
            r#"
            INSERT INTO morning_analysis (
                id, trading_date, started_at, finished_at, symbols_total, features_built,
                predictions_made, skipped_existing, failure_count, failures, guard_passed,
                model_version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.trading_date)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.symbols_total as i64)
        .bind(summary.features_built as i64)
        .bind(summary.predictions_made as i64)
        .bind(summary.skipped_existing as i64)
        .bind(summary.failures.len() as i64)
        .bind(failures)
        .bind(summary.guard_passed)
        .bind(&summary.model_version)
        .execute(&self.pool)
        .await
        .context("Failed to store morning analysis row")?;
        Ok(())
    }

    pub async fn insert_evening_summary(&self, summary: &EveningSummary) -> Result<()> {
        let failures = serde_json::to_string(&summary.failures)
            .context("Failed to serialize evening failures")?;
        let details = serde_json::to_string(&summary.details)
            .context("Failed to serialize evening details")?;
        sqlx::query(
            r#"
            INSERT INTO evening_analysis (
                id, trading_date, started_at, finished_at, outcomes_recorded,
                horizons_backfilled, outcomes_pending, failure_count, failures, guard_passed,
                training_skipped, training_samples, model_promoted, model_rejected, details
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.trading_date)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.outcomes_recorded as i64)
        .bind(summary.horizons_backfilled as i64)
        .bind(summary.outcomes_pending as i64)
        .bind(summary.failures.len() as i64)
        .bind(failures)
        .bind(summary.guard_passed)
        .bind(summary.training_skipped)
        .bind(summary.training_samples as i64)
        .bind(summary.model_promoted.as_deref())
        .bind(summary.model_rejected.as_deref())
        .bind(details)
        .execute(&self.pool)
        .await
        .context("Failed to store evening analysis row")?;
        Ok(())
    }

    // ---- schema introspection for the integrity guard ----

    pub async fn table_columns(&self, table: &str) -> PipelineResult<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT name FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Column sets of every UNIQUE index declared on a table.
    pub async fn unique_index_columns(&self, table: &str) -> PipelineResult<Vec<Vec<String>>> {
        let indexes = sqlx::query_as::<_, (String,)>(
            r#"SELECT name FROM pragma_index_list(?) WHERE "unique" = 1"#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut sets = Vec::with_capacity(indexes.len());
        for (index_name,) in indexes {
            let columns = sqlx::query_as::<_, (Option<String>,)>(
                "SELECT name FROM pragma_index_info(?) ORDER BY seqno",
            )
            .bind(&index_name)
            .fetch_all(&self.pool)
            .await?;
            sets.push(columns.into_iter().flat_map(|(name,)| name).collect());
        }
        Ok(sets)
    }
}

async fn insert_model_version_conn(
    conn: &mut SqliteConnection,
    record: &ModelVersionRecord,
) -> Result<(), sqlx::Error> {
    let metric = |h: Horizon| record.metrics_for(h).copied();
    let m1h = metric(Horizon::OneHour);
    let m4h = metric(Horizon::FourHours);
    let m1d = metric(Horizon::OneDay);

    sqlx::query(
        r#"
        INSERT INTO model_performance (
            version, status, trained_at, training_samples, feature_schema_hash,
            accuracy_1h, mae_1h, samples_1h,
            accuracy_4h, mae_4h, samples_4h,
            accuracy_1d, mae_1d, samples_1d,
            created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.version)
    .bind(record.status.as_str())
    .bind(record.trained_at)
    .bind(record.training_samples)
    .bind(&record.feature_schema_hash)
    .bind(m1h.map(|m| m.direction_accuracy))
    .bind(m1h.map(|m| m.magnitude_mae))
    .bind(m1h.map(|m| m.samples))
    .bind(m4h.map(|m| m.direction_accuracy))
    .bind(m4h.map(|m| m.magnitude_mae))
    .bind(m4h.map(|m| m.samples))
    .bind(m1d.map(|m| m.direction_accuracy))
    .bind(m1d.map(|m| m.magnitude_mae))
    .bind(m1d.map(|m| m.samples))
    .bind(record.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn feature_from_row(row: &SqliteRow) -> Result<FeatureRecord, sqlx::Error> {
    Ok(FeatureRecord {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        timestamp: row.try_get("timestamp")?,
        signal_max_timestamp: row.try_get("signal_max_timestamp")?,
        sentiment_score: row.try_get("sentiment_score")?,
        sentiment_confidence: row.try_get("sentiment_confidence")?,
        article_count: row.try_get("article_count")?,
        social_score: row.try_get("social_score")?,
        social_volume: row.try_get("social_volume")?,
        rsi: row.try_get("rsi")?,
        stoch_k: row.try_get("stoch_k")?,
        stoch_d: row.try_get("stoch_d")?,
        macd_line: row.try_get("macd_line")?,
        macd_signal: row.try_get("macd_signal")?,
        macd_histogram: row.try_get("macd_histogram")?,
        sma_ratio_short: row.try_get("sma_ratio_short")?,
        sma_ratio_long: row.try_get("sma_ratio_long")?,
        sma_cross: row.try_get("sma_cross")?,
        ema_ratio: row.try_get("ema_ratio")?,
        bollinger_width: row.try_get("bollinger_width")?,
        bollinger_position: row.try_get("bollinger_position")?,
        atr_pct: row.try_get("atr_pct")?,
        volatility_5d: row.try_get("volatility_5d")?,
        volatility_20d: row.try_get("volatility_20d")?,
        volume_ratio: row.try_get("volume_ratio")?,
        price_change_1d: row.try_get("price_change_1d")?,
        current_price: row.try_get("current_price")?,
        index_change_pct: row.try_get("index_change_pct")?,
        sector_change_pct: row.try_get("sector_change_pct")?,
        vix: row.try_get("vix")?,
        market_hours: row.try_get("market_hours")?,
        sentiment_momentum: row.try_get("sentiment_momentum")?,
        volume_sentiment: row.try_get("volume_sentiment")?,
        sentiment_rsi: row.try_get("sentiment_rsi")?,
        vix_volatility: row.try_get("vix_volatility")?,
        news_weight: row.try_get("news_weight")?,
        trend_alignment: row.try_get("trend_alignment")?,
        volatility_regime: row.try_get("volatility_regime")?,
        hour_of_day: row.try_get("hour_of_day")?,
        day_of_week: row.try_get("day_of_week")?,
        quarter_end: row.try_get("quarter_end")?,
        quality_score: row.try_get("quality_score")?,
    })
}

fn direction_column(row: &SqliteRow, column: &str) -> Result<Option<Direction>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    Ok(raw.as_deref().and_then(Direction::parse))
}

fn outcome_from_row(row: &SqliteRow) -> Result<Outcome, sqlx::Error> {
    let horizons = vec![
        HorizonOutcome {
            horizon: Horizon::OneHour,
            exit_price: row.try_get("exit_price_1h")?,
            return_pct: row.try_get("return_pct_1h")?,
            direction: direction_column(row, "direction_1h")?,
            recorded_at: row.try_get("recorded_at_1h")?,
        },
        HorizonOutcome {
            horizon: Horizon::FourHours,
            exit_price: row.try_get("exit_price_4h")?,
            return_pct: row.try_get("return_pct_4h")?,
            direction: direction_column(row, "direction_4h")?,
            recorded_at: row.try_get("recorded_at_4h")?,
        },
        HorizonOutcome {
            horizon: Horizon::OneDay,
            exit_price: row.try_get("exit_price_1d")?,
            return_pct: row.try_get("return_pct_1d")?,
            direction: direction_column(row, "direction_1d")?,
            recorded_at: row.try_get("recorded_at_1d")?,
        },
    ];
    Ok(Outcome {
        id: row.try_get("id")?,
        feature_id: row.try_get("feature_id")?,
        symbol: row.try_get("symbol")?,
        entry_price: row.try_get("entry_price")?,
        first_recorded_at: row.try_get("first_recorded_at")?,
        horizons,
    })
}

fn replay_from_row(row: &SqliteRow) -> Result<ReplayRow, sqlx::Error> {
    let forecast = |dir_col: &str, mag_col: &str, conf_col: &str, horizon: Horizon| {
        let direction: String = row.try_get(dir_col)?;
        Ok::<_, sqlx::Error>(HorizonForecast {
            horizon,
            direction: Direction::parse(&direction).unwrap_or(Direction::Flat),
            magnitude_pct: row.try_get(mag_col)?,
            confidence: row.try_get(conf_col)?,
        })
    };
    let forecasts = vec![
        forecast("direction_1h", "magnitude_1h", "confidence_1h", Horizon::OneHour)?,
        forecast("direction_4h", "magnitude_4h", "confidence_4h", Horizon::FourHours)?,
        forecast("direction_1d", "magnitude_1d", "confidence_1d", Horizon::OneDay)?,
    ];

    let outcomes = vec![
        HorizonOutcome {
            horizon: Horizon::OneHour,
            exit_price: row.try_get("exit_price_1h")?,
            return_pct: row.try_get("return_pct_1h")?,
            direction: direction_column(row, "out_direction_1h")?,
            recorded_at: row.try_get("recorded_at_1h")?,
        },
        HorizonOutcome {
            horizon: Horizon::FourHours,
            exit_price: row.try_get("exit_price_4h")?,
            return_pct: row.try_get("return_pct_4h")?,
            direction: direction_column(row, "out_direction_4h")?,
            recorded_at: row.try_get("recorded_at_4h")?,
        },
        HorizonOutcome {
            horizon: Horizon::OneDay,
            exit_price: row.try_get("exit_price_1d")?,
            return_pct: row.try_get("return_pct_1d")?,
            direction: direction_column(row, "out_direction_1d")?,
            recorded_at: row.try_get("recorded_at_1d")?,
        },
    ];

    let action: String = row.try_get("optimal_action")?;
    Ok(ReplayRow {
        feature_id: row.try_get("feature_id")?,
        symbol: row.try_get("symbol")?,
        feature_timestamp: row.try_get("feature_timestamp")?,
        model_version: row.try_get("model_version")?,
        optimal_action: TradingAction::parse(&action).unwrap_or(TradingAction::Hold),
        forecasts,
        entry_price: row.try_get("entry_price")?,
        outcomes,
    })
}

fn model_version_from_row(row: &SqliteRow) -> Result<ModelVersionRecord, sqlx::Error> {
    let mut metrics = Vec::new();
    for (horizon, acc_col, mae_col, samples_col) in [
        (Horizon::OneHour, "accuracy_1h", "mae_1h", "samples_1h"),
        (Horizon::FourHours, "accuracy_4h", "mae_4h", "samples_4h"),
        (Horizon::OneDay, "accuracy_1d", "mae_1d", "samples_1d"),
    ] {
        let accuracy: Option<f64> = row.try_get(acc_col)?;
        let mae: Option<f64> = row.try_get(mae_col)?;
        let samples: Option<i64> = row.try_get(samples_col)?;
        if let (Some(direction_accuracy), Some(magnitude_mae), Some(samples)) =
            (accuracy, mae, samples)
        {
            metrics.push(HorizonMetrics {
                horizon,
                direction_accuracy,
                magnitude_mae,
                samples,
            });
        }
    }

    let status: String = row.try_get("status")?;
    Ok(ModelVersionRecord {
        version: row.try_get("version")?,
        status: ModelStatus::parse(&status).unwrap_or(ModelStatus::Rejected),
        trained_at: row.try_get("trained_at")?,
        training_samples: row.try_get("training_samples")?,
        feature_schema_hash: row.try_get("feature_schema_hash")?,
        metrics,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::feature_schema_hash;
    use chrono::TimeZone;

    fn sample_feature(symbol: &str, timestamp: DateTime<Utc>) -> FeatureRecord {
        FeatureRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timestamp,
            signal_max_timestamp: timestamp,
            sentiment_score: 0.3,
            sentiment_confidence: 0.8,
            article_count: 5.0,
            social_score: 0.1,
            social_volume: 120.0,
            rsi: 61.0,
            stoch_k: 70.0,
            stoch_d: 65.0,
            macd_line: 0.5,
            macd_signal: 0.4,
            macd_histogram: 0.1,
            sma_ratio_short: 1.02,
            sma_ratio_long: 1.05,
            sma_cross: 1.03,
            ema_ratio: 1.01,
            bollinger_width: 0.04,
            bollinger_position: 0.5,
            atr_pct: 1.5,
            volatility_5d: 0.9,
            volatility_20d: 1.2,
            volume_ratio: 1.3,
            price_change_1d: 0.8,
            current_price: 251.1,
            index_change_pct: 0.4,
            sector_change_pct: 0.6,
            vix: 15.0,
            market_hours: 1.0,
            sentiment_momentum: 0.03,
            volume_sentiment: 0.39,
            sentiment_rsi: 0.07,
            vix_volatility: 13.5,
            news_weight: 1.4,
            trend_alignment: 0.003,
            volatility_regime: 0.75,
            hour_of_day: 14.0,
            day_of_week: 1.0,
            quarter_end: 0.0,
            quality_score: 1.0,
        }
    }

    fn sample_prediction(feature: &FeatureRecord, version: &str) -> Prediction {
        let forecasts = Horizon::ALL
            .iter()
            .map(|&horizon| HorizonForecast {
                horizon,
                direction: Direction::Up,
                magnitude_pct: 1.5,
                confidence: 0.7,
            })
            .collect();
        Prediction {
            id: Uuid::new_v4(),
            feature_id: feature.id,
            symbol: feature.symbol.clone(),
            prediction_date: feature.trading_date(),
            created_at: feature.timestamp,
            model_version: version.to_string(),
            forecasts,
            optimal_action: TradingAction::Buy,
            avg_confidence: 0.7,
        }
    }

    fn realized(horizon: Horizon, exit: f64, pct: f64, at: DateTime<Utc>) -> HorizonOutcome {
        HorizonOutcome {
            horizon,
            exit_price: Some(exit),
            return_pct: Some(pct),
            direction: Some(Direction::from_return(pct, 0.2)),
            recorded_at: Some(at),
        }
    }

    async fn test_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn feature_round_trips_through_store() {
        let store = test_store().await;
        let feature = sample_feature("AAPL", ts(14));
        store.insert_feature(&feature).await.unwrap();

        let loaded = store.fetch_feature(feature.id).await.unwrap().unwrap();
        assert_eq!(loaded, feature);
        assert_eq!(store.count_features().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_prediction_for_symbol_day_is_rejected() {
        let store = test_store().await;
        let feature = sample_feature("TSLA", ts(14));
        store.insert_feature(&feature).await.unwrap();
        store.insert_prediction(&sample_prediction(&feature, "v1")).await.unwrap();

        let err = store
            .insert_prediction(&sample_prediction(&feature, "v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicatePrediction { .. }));
        assert!(store.prediction_exists("TSLA", ts(14).date_naive()).await.unwrap());
        assert!(store.duplicate_prediction_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_outcome_for_feature_is_rejected() {
        let store = test_store().await;
        let feature = sample_feature("MSFT", ts(14));
        store.insert_feature(&feature).await.unwrap();

        let outcome = Outcome {
            id: Uuid::new_v4(),
            feature_id: feature.id,
            symbol: feature.symbol.clone(),
            entry_price: 100.0,
            first_recorded_at: ts(20),
            horizons: vec![
                realized(Horizon::OneHour, 101.0, 1.0, ts(20)),
                HorizonOutcome::pending(Horizon::FourHours),
                HorizonOutcome::pending(Horizon::OneDay),
            ],
        };
        store.insert_outcome(&outcome).await.unwrap();

        let mut duplicate = outcome.clone();
        duplicate.id = Uuid::new_v4();
        let err = store.insert_outcome(&duplicate).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateOutcome { .. }));
    }

    #[tokio::test]
    async fn backfill_applies_exactly_once() {
        let store = test_store().await;
        let feature = sample_feature("NVDA", ts(14));
        store.insert_feature(&feature).await.unwrap();
        store
            .insert_outcome(&Outcome {
                id: Uuid::new_v4(),
                feature_id: feature.id,
                symbol: feature.symbol.clone(),
                entry_price: 100.0,
                first_recorded_at: ts(20),
                horizons: vec![
                    realized(Horizon::OneHour, 102.0, 2.0, ts(20)),
                    realized(Horizon::FourHours, 103.0, 3.0, ts(20)),
                    HorizonOutcome::pending(Horizon::OneDay),
                ],
            })
            .await
            .unwrap();

        let applied = store
            .backfill_outcome_horizon(feature.id, Horizon::OneDay, 105.0, 5.0, Direction::Up, ts(21))
            .await
            .unwrap();
        assert!(applied);

        // A second backfill must not overwrite the recorded value.
        let applied_again = store
            .backfill_outcome_horizon(feature.id, Horizon::OneDay, 90.0, -10.0, Direction::Down, ts(22))
            .await
            .unwrap();
        assert!(!applied_again);

        let outcome = store.fetch_outcome(feature.id).await.unwrap().unwrap();
        let one_day = outcome.horizon(Horizon::OneDay).unwrap();
        assert_eq!(one_day.exit_price, Some(105.0));
        assert_eq!(one_day.return_pct, Some(5.0));
        assert!(outcome.is_complete());
        assert!(store.pending_outcomes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn paired_samples_require_all_horizons_realized() {
        let store = test_store().await;

        let complete = sample_feature("AAPL", ts(10));
        store.insert_feature(&complete).await.unwrap();
        store
            .insert_outcome(&Outcome {
                id: Uuid::new_v4(),
                feature_id: complete.id,
                symbol: complete.symbol.clone(),
                entry_price: 100.0,
                first_recorded_at: ts(20),
                horizons: vec![
                    realized(Horizon::OneHour, 101.0, 1.0, ts(20)),
                    realized(Horizon::FourHours, 99.0, -1.0, ts(20)),
                    realized(Horizon::OneDay, 104.0, 4.0, ts(21)),
                ],
            })
            .await
            .unwrap();

        let partial = sample_feature("TSLA", ts(11));
        store.insert_feature(&partial).await.unwrap();
        store
            .insert_outcome(&Outcome {
                id: Uuid::new_v4(),
                feature_id: partial.id,
                symbol: partial.symbol.clone(),
                entry_price: 200.0,
                first_recorded_at: ts(20),
                horizons: vec![
                    realized(Horizon::OneHour, 202.0, 1.0, ts(20)),
                    HorizonOutcome::pending(Horizon::FourHours),
                    HorizonOutcome::pending(Horizon::OneDay),
                ],
            })
            .await
            .unwrap();

        let samples = store.paired_samples().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].feature.symbol, "AAPL");
        assert_eq!(samples[0].return_for(Horizon::OneDay), 4.0);

        let pending = store.pending_outcomes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].symbol, "TSLA");
    }

    #[tokio::test]
    async fn promotion_swaps_the_single_active_version() {
        let store = test_store().await;
        let record = |version: &str, status: ModelStatus| ModelVersionRecord {
            version: version.to_string(),
            status,
            trained_at: ts(20),
            training_samples: 80,
            feature_schema_hash: feature_schema_hash(),
            metrics: vec![HorizonMetrics {
                horizon: Horizon::OneDay,
                direction_accuracy: 0.65,
                magnitude_mae: 1.4,
                samples: 40,
            }],
            created_at: ts(20),
        };

        store.promote_model_version(&record("v1", ModelStatus::Active)).await.unwrap();
        store.promote_model_version(&record("v2", ModelStatus::Active)).await.unwrap();
        store.insert_model_version(&record("v3", ModelStatus::Rejected)).await.unwrap();

        let active = store.active_model_version().await.unwrap().unwrap();
        assert_eq!(active.version, "v2");

        let history = store.model_version_history().await.unwrap();
        assert_eq!(history.len(), 3);
        let active_count = history.iter().filter(|r| r.status == ModelStatus::Active).count();
        assert_eq!(active_count, 1);
    }

    #[tokio::test]
    async fn phase_log_tracks_completions() {
        let store = test_store().await;
        let date = ts(9).date_naive();
        assert!(!store.phase_completed_on(Phase::Morning, date).await.unwrap());

        store.record_phase_completion(Phase::Morning, date).await.unwrap();
        assert!(store.phase_completed_on(Phase::Morning, date).await.unwrap());
        assert!(!store.phase_completed_on(Phase::Evening, date).await.unwrap());

        let last = store.last_phase_completion().await.unwrap().unwrap();
        assert_eq!(last.phase, Phase::Morning);
        assert_eq!(last.trading_date, date);
    }

    #[tokio::test]
    async fn unique_indexes_are_declared_for_contract_tables() {
        let store = test_store().await;
        let prediction_indexes = store.unique_index_columns("predictions").await.unwrap();
        assert!(prediction_indexes
            .iter()
            .any(|cols| cols == &["symbol".to_string(), "prediction_date".to_string()]));

        let outcome_indexes = store.unique_index_columns("enhanced_outcomes").await.unwrap();
        assert!(outcome_indexes.iter().any(|cols| cols == &["feature_id".to_string()]));

        let columns = store.table_columns("enhanced_features").await.unwrap();
        assert!(columns.contains(&"timestamp".to_string()));
        assert!(columns.contains(&"signal_max_timestamp".to_string()));
    }
}
