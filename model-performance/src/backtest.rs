// Backtest engine
// Replays stored predictions against realized outcomes and scores the
// actions the system would have taken. Rows whose outcome was recorded
// before the horizon elapsed are excluded rather than silently scored.

use common::{Horizon, PipelineResult, ReplayRow, Store, TradingAction};
use serde::Serialize;
use tracing::{info, warn};

/// Per-action slice of the replay
#[derive(Debug, Clone, Serialize)]
pub struct ActionBreakdown {
    pub action: TradingAction,
    pub trades: usize,
    pub wins: usize,
    pub win_rate_pct: f64,
    pub avg_return_pct: f64,
}

/// Replay metrics for one model version at one horizon
#[derive(Debug, Clone, Serialize)]
pub struct BacktestSummary {
    pub model_version: String,
    pub horizon: Horizon,
    /// Directional trades scored (HOLD rows excluded)
    pub trades: usize,
    pub holds: usize,
    /// Rows dropped because the outcome predates horizon elapse
    pub excluded_lookahead: usize,
    /// Rows dropped because the horizon is still unrealized
    pub unrealized: usize,
    pub win_rate_pct: f64,
    pub avg_return_pct: f64,
    pub avg_win_pct: f64,
    /// Average losing trade as a positive magnitude
    pub avg_loss_pct: f64,
    /// Annualized; None with fewer than two trades or zero variance
    pub sharpe: Option<f64>,
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    pub by_action: Vec<ActionBreakdown>,
}

pub struct BacktestEngine {
    store: Store,
}

impl BacktestEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn evaluate(
        &self,
        model_version: &str,
        horizon: Horizon,
    ) -> PipelineResult<BacktestSummary> {
        let rows = self.store.replay_rows(model_version).await?;
        let summary = evaluate_rows(model_version, horizon, &rows);
        info!(
            "Backtest {} {}: {} trades, win rate {:.1}%, avg return {:.3}%, max drawdown {:.2}%",
            model_version,
            horizon.label(),
            summary.trades,
            summary.win_rate_pct,
            summary.avg_return_pct,
            summary.max_drawdown_pct
        );
        Ok(summary)
    }
}

/// Score replay rows at one horizon. Trade return is the realized return
/// signed by the action taken, so sells profit from declines.
pub fn evaluate_rows(model_version: &str, horizon: Horizon, rows: &[ReplayRow]) -> BacktestSummary {
    let mut trade_returns: Vec<(TradingAction, f64)> = Vec::new();
    let mut holds = 0;
    let mut excluded_lookahead = 0;
    let mut unrealized = 0;

    for row in rows {
        let outcome = row.outcomes.iter().find(|o| o.horizon == horizon);
        let (return_pct, recorded_at) = match outcome {
            Some(o) if o.return_pct.is_some() && o.recorded_at.is_some() => (
                o.return_pct.unwrap_or_default(),
                o.recorded_at.unwrap_or_default(),
            ),
            _ => {
                unrealized += 1;
                continue;
            }
        };

        let due_at = row.feature_timestamp + horizon.duration();
        if recorded_at < due_at {
            warn!(
                "Excluding {} {}: outcome recorded {} before horizon elapsed at {}",
                row.symbol,
                horizon.label(),
                recorded_at,
                due_at
            );
            excluded_lookahead += 1;
            continue;
        }

        let sign = row.optimal_action.position_sign();
        if sign == 0.0 {
            holds += 1;
            continue;
        }
        trade_returns.push((row.optimal_action, sign * return_pct));
    }

    let returns: Vec<f64> = trade_returns.iter().map(|(_, r)| *r).collect();
    let wins = returns.iter().filter(|r| **r > 0.0).count();
    let losses = returns.iter().filter(|r| **r < 0.0).count();
    let win_sum: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let loss_sum: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| -r).sum();
    let trades = returns.len();
    let win_rate_pct = if trades > 0 {
        wins as f64 / trades as f64 * 100.0
    } else {
        0.0
    };
    let avg_return_pct = if trades > 0 {
        returns.iter().sum::<f64>() / trades as f64
    } else {
        0.0
    };

    BacktestSummary {
        model_version: model_version.to_string(),
        horizon,
        trades,
        holds,
        excluded_lookahead,
        unrealized,
        win_rate_pct,
        avg_return_pct,
        avg_win_pct: if wins > 0 { win_sum / wins as f64 } else { 0.0 },
        avg_loss_pct: if losses > 0 { loss_sum / losses as f64 } else { 0.0 },
        sharpe: sharpe_ratio(&returns),
        max_drawdown_pct: max_drawdown_pct(&returns),
        profit_factor: profit_factor(&returns),
        by_action: action_breakdown(&trade_returns),
    }
}

/// Annualized Sharpe over per-trade returns, one trade per day assumed
fn sharpe_ratio(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (returns.len() - 1) as f64;
    let std_dev = variance.sqrt();
    if std_dev > 0.0 {
        let annualized_std = std_dev * (252.0_f64).sqrt();
        Some(mean * 252.0 / annualized_std)
    } else {
        None
    }
}

/// Peak-relative drawdown over the compounded equity path, in percent
fn max_drawdown_pct(returns: &[f64]) -> f64 {
    let mut equity = 1.0f64;
    let mut peak = 1.0f64;
    let mut max_drawdown = 0.0f64;
    for r in returns {
        equity *= 1.0 + r / 100.0;
        peak = peak.max(equity);
        let drawdown = (peak - equity) / peak;
        max_drawdown = max_drawdown.max(drawdown);
    }
    max_drawdown * 100.0
}

/// Gross gains over gross losses. A replay with no losing trade has no
/// denominator; it reports its gross gain instead of an infinity.
fn profit_factor(returns: &[f64]) -> f64 {
    let win_sum: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let loss_sum: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| -r).sum();
    if loss_sum > 0.0 {
        win_sum / loss_sum
    } else {
        win_sum
    }
}

fn action_breakdown(trade_returns: &[(TradingAction, f64)]) -> Vec<ActionBreakdown> {
    let actions = [
        TradingAction::StrongBuy,
        TradingAction::Buy,
        TradingAction::Sell,
        TradingAction::StrongSell,
    ];
    actions
        .iter()
        .filter_map(|&action| {
            let slice: Vec<f64> = trade_returns
                .iter()
                .filter(|(a, _)| *a == action)
                .map(|(_, r)| *r)
                .collect();
            if slice.is_empty() {
                return None;
            }
            let wins = slice.iter().filter(|r| **r > 0.0).count();
            Some(ActionBreakdown {
                action,
                trades: slice.len(),
                wins,
                win_rate_pct: wins as f64 / slice.len() as f64 * 100.0,
                avg_return_pct: slice.iter().sum::<f64>() / slice.len() as f64,
            })
        })
        .collect()
}
