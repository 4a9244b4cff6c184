// =============================================================================
// Risk controller — per-strategy circuit breakers protecting paper capital
// =============================================================================
//
// Two circuit breakers:
//   1. Max Drawdown        — trips when drawdown from peak portfolio value
//                            exceeds the configured percentage (24 h cooldown).
//   2. Consecutive Losses  — trips after 5 consecutive losing trades
//                            (1 h cooldown).
//
// Tripping a breaker force-closes every open position. Daily PnL counters
// reset automatically when the UTC date rolls over; the rollover runs both at
// check time and at trade-record time so a trade landing just after midnight
// is attributed to the right day.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::portfolio::{StrategyState, Trade};
use crate::types::{OptionAction, PositionSide, TradeKind, TradeSide};

/// Consecutive losing trades before the breaker trips.
pub const MAX_CONSECUTIVE_LOSSES: u32 = 5;

/// Cooldown after a drawdown breach.
const DRAWDOWN_COOLDOWN_HOURS: i64 = 24;

/// Cooldown after a consecutive-loss breach.
const LOSS_COOLDOWN_HOURS: i64 = 1;

/// Detail string attached to force-close trades.
const FORCE_CLOSE_DETAIL: &str = "Circuit breaker force-close";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Risk counters embedded in every strategy's persisted state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RiskState {
    #[serde(default)]
    pub peak_value: f64,
    #[serde(default)]
    pub max_drawdown_pct: f64,
    #[serde(default)]
    pub current_drawdown_pct: f64,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_pnl_date: String,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub circuit_breaker: bool,
    #[serde(default)]
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_trades: u64,
    #[serde(default)]
    pub winning_trades: u64,
    #[serde(default)]
    pub losing_trades: u64,
}

impl RiskState {
    pub fn new(max_drawdown_pct: f64) -> Self {
        Self {
            max_drawdown_pct,
            daily_pnl_date: today_utc(),
            ..Self::default()
        }
    }
}

/// Outcome of a pre-trade risk check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskVerdict {
    Allow,
    Deny(String),
}

fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

// ---------------------------------------------------------------------------
// Daily rollover
// ---------------------------------------------------------------------------

/// Zero the daily PnL when the UTC date has changed since it was last
/// touched. Safe to call from multiple code paths; only the first call on a
/// new day does anything.
pub fn roll_daily(risk: &mut RiskState) {
    let today = today_utc();
    if risk.daily_pnl_date != today {
        if !risk.daily_pnl_date.is_empty() {
            info!(
                old_date = %risk.daily_pnl_date,
                new_date = %today,
                "UTC date rolled — daily pnl reset"
            );
        }
        risk.daily_pnl = 0.0;
        risk.daily_pnl_date = today;
    }
}

// ---------------------------------------------------------------------------
// Trade accounting
// ---------------------------------------------------------------------------

/// Record the realized PnL of a completed trade and update all counters.
pub fn record_trade_result(risk: &mut RiskState, pnl: f64) {
    roll_daily(risk);

    risk.total_trades += 1;
    risk.daily_pnl += pnl;

    if pnl >= 0.0 {
        risk.winning_trades += 1;
        risk.consecutive_losses = 0;
    } else {
        risk.losing_trades += 1;
        risk.consecutive_losses += 1;
    }

    debug!(
        pnl,
        daily_pnl = risk.daily_pnl,
        consecutive_losses = risk.consecutive_losses,
        total_trades = risk.total_trades,
        "trade result recorded"
    );
}

// ---------------------------------------------------------------------------
// Pre-trade gate
// ---------------------------------------------------------------------------

/// Check whether the strategy may run this cycle.
///
/// Runs under the supervisor's exclusive lock: a breach force-closes every
/// open position before the deny is returned.
pub fn check_risk(
    s: &mut StrategyState,
    portfolio_value: f64,
    prices: &HashMap<String, f64>,
) -> RiskVerdict {
    roll_daily(&mut s.risk);

    // An already-tripped breaker either still holds or has expired.
    if s.risk.circuit_breaker {
        let now = Utc::now();
        if let Some(until) = s.risk.circuit_breaker_until {
            if now < until {
                return RiskVerdict::Deny("circuit breaker active".to_string());
            }
        }
        s.risk.circuit_breaker = false;
        s.risk.circuit_breaker_until = None;
        s.risk.consecutive_losses = 0;
        info!(strategy = %s.id, "circuit breaker expired — trading re-enabled");
    }

    if portfolio_value > s.risk.peak_value {
        s.risk.peak_value = portfolio_value;
    }

    s.risk.current_drawdown_pct = if s.risk.peak_value > 0.0 {
        (s.risk.peak_value - portfolio_value) / s.risk.peak_value * 100.0
    } else {
        0.0
    };

    // Drawdown only counts once the strategy has actually traded; a freshly
    // funded book must not trip on mark-to-market noise.
    if s.risk.total_trades > 0
        && s.risk.peak_value > 0.0
        && s.risk.current_drawdown_pct > s.risk.max_drawdown_pct
    {
        let msg = format!(
            "Max drawdown breaker tripped: {:.2}% drawdown (limit {:.2}%)",
            s.risk.current_drawdown_pct, s.risk.max_drawdown_pct
        );
        warn!(strategy = %s.id, "{}", msg);
        trip_breaker(s, Duration::hours(DRAWDOWN_COOLDOWN_HOURS), prices);
        return RiskVerdict::Deny(msg);
    }

    if s.risk.consecutive_losses >= MAX_CONSECUTIVE_LOSSES {
        let msg = format!(
            "Consecutive losses breaker tripped: {} consecutive losses (limit {})",
            s.risk.consecutive_losses, MAX_CONSECUTIVE_LOSSES
        );
        warn!(strategy = %s.id, "{}", msg);
        trip_breaker(s, Duration::hours(LOSS_COOLDOWN_HOURS), prices);
        return RiskVerdict::Deny(msg);
    }

    RiskVerdict::Allow
}

fn trip_breaker(s: &mut StrategyState, cooldown: Duration, prices: &HashMap<String, f64>) {
    s.risk.circuit_breaker = true;
    s.risk.circuit_breaker_until = Some(Utc::now() + cooldown);
    let closed = force_close_all(s, prices);
    warn!(
        strategy = %s.id,
        closed,
        until = ?s.risk.circuit_breaker_until,
        "circuit breaker tripped — all positions force-closed"
    );
}

// ---------------------------------------------------------------------------
// Force-close
// ---------------------------------------------------------------------------

/// Liquidate every spot and option position at the best available price.
/// Returns the number of positions closed.
pub fn force_close_all(s: &mut StrategyState, prices: &HashMap<String, f64>) -> usize {
    let mut closed = 0;

    let spot: Vec<_> = s.positions.drain().map(|(_, p)| p).collect();
    for pos in spot {
        let price = prices.get(&pos.symbol).copied().unwrap_or(pos.avg_cost);
        let (pnl, proceeds) = match pos.side {
            PositionSide::Long => (
                pos.quantity * (price - pos.avg_cost),
                pos.quantity * price,
            ),
            PositionSide::Short => {
                let pnl = pos.quantity * (pos.avg_cost - price);
                (pnl, pos.quantity * pos.avg_cost + pnl)
            }
        };

        s.cash += proceeds;
        let trade = Trade::new(
            &s.id,
            &pos.symbol,
            TradeSide::Close,
            pos.quantity,
            price,
            proceeds,
            TradeKind::Spot,
            FORCE_CLOSE_DETAIL.to_string(),
        );
        s.record_trade(trade);
        record_trade_result(&mut s.risk, pnl);
        closed += 1;
    }

    let options: Vec<_> = s.option_positions.drain().map(|(_, o)| o).collect();
    for opt in options {
        let (pnl, cash_delta) = match opt.action {
            // Owned option: sell it at its marked value.
            OptionAction::Buy => (
                opt.current_value_usd - opt.entry_premium_usd,
                opt.current_value_usd,
            ),
            // Sold obligation: buy it back at its marked cost.
            OptionAction::Sell => {
                let buyback = -opt.current_value_usd;
                (opt.entry_premium_usd - buyback, -buyback)
            }
        };

        s.cash += cash_delta;
        let trade = Trade::new(
            &s.id,
            &opt.underlying,
            TradeSide::Close,
            opt.quantity,
            opt.strike,
            cash_delta,
            TradeKind::Options,
            FORCE_CLOSE_DETAIL.to_string(),
        );
        s.record_trade(trade);
        record_trade_result(&mut s.risk, pnl);
        closed += 1;
    }

    closed
}
