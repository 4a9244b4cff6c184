// =============================================================================
// Portfolio & spot execution — cash accounting and simulated fills
// =============================================================================
//
// Each strategy owns an isolated paper portfolio: cash, spot positions keyed
// by symbol, option positions keyed by contract id, and a bounded trade
// history. All fills are simulated; a trade's `value` is the signed cash
// delta it applied, so the ledger can always be audited against the cash
// balance.
//
// Thread-safety: instances live inside the supervisor's shared state and are
// only mutated under its exclusive lock.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::options::OptionPosition;
use crate::risk::{self, RiskState};
use crate::types::{PositionSide, StrategyType, TradeKind, TradeSide};

/// Fraction of cash a buy signal may deploy; the rest stays as fee headroom.
pub const BUY_BUDGET_FRACTION: f64 = 0.95;

/// Smallest budget worth opening a position for, in USD.
const MIN_TRADE_BUDGET: f64 = 1.0;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// An open spot position. A symbol maps to at most one position at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_cost: f64,
    pub side: PositionSide,
}

/// An immutable record of a simulated fill.
///
/// `value` is the signed cash delta the fill applied (credits positive,
/// debits negative), fees included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub strategy_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    pub value: f64,
    pub kind: TradeKind,
    pub detail: String,
}

impl Trade {
    pub fn new(
        strategy_id: &str,
        symbol: &str,
        side: TradeSide,
        quantity: f64,
        price: f64,
        value: f64,
        kind: TradeKind,
        detail: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            value,
            kind,
            detail,
        }
    }
}

/// The full paper portfolio of a single strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StrategyType,
    pub cash: f64,
    pub initial_capital: f64,
    #[serde(default)]
    pub positions: HashMap<String, Position>,
    #[serde(default)]
    pub option_positions: HashMap<String, OptionPosition>,
    #[serde(default)]
    pub trade_history: Vec<Trade>,
    #[serde(default)]
    pub risk: RiskState,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl StrategyState {
    /// Fresh portfolio funded with `capital`.
    pub fn new(id: &str, kind: StrategyType, capital: f64, max_drawdown_pct: f64) -> Self {
        Self {
            id: id.to_string(),
            kind,
            cash: capital,
            initial_capital: capital,
            positions: HashMap::new(),
            option_positions: HashMap::new(),
            trade_history: Vec::new(),
            risk: RiskState::new(max_drawdown_pct),
            last_run_at: None,
        }
    }

    /// Append a trade to the history. The cash change belonging to the trade
    /// must have been applied by the caller in the same critical section.
    pub fn record_trade(&mut self, trade: Trade) {
        debug!(
            strategy = %self.id,
            side = %trade.side,
            symbol = %trade.symbol,
            value = trade.value,
            "trade recorded"
        );
        self.trade_history.push(trade);
    }

    /// Number of open spot + option positions.
    pub fn open_position_count(&self) -> usize {
        self.positions.len() + self.option_positions.len()
    }
}

// ---------------------------------------------------------------------------
// Valuation
// ---------------------------------------------------------------------------

/// Total portfolio value: cash plus marked spot positions plus the current
/// USD value of every option position.
///
/// A long contributes `qty * price`; a short contributes its entry value plus
/// mark-to-market PnL, i.e. `qty * (2 * avg_cost - price)`. A symbol without
/// a live price is valued at its average cost.
pub fn portfolio_value(s: &StrategyState, prices: &HashMap<String, f64>) -> f64 {
    let spot: f64 = s
        .positions
        .values()
        .map(|p| match prices.get(&p.symbol) {
            Some(&price) => match p.side {
                PositionSide::Long => p.quantity * price,
                PositionSide::Short => p.quantity * (2.0 * p.avg_cost - price),
            },
            None => p.quantity * p.avg_cost,
        })
        .sum();

    let options: f64 = s.option_positions.values().map(|o| o.current_value_usd).sum();

    s.cash + spot + options
}

// ---------------------------------------------------------------------------
// Spot execution
// ---------------------------------------------------------------------------

/// Apply a spot signal (`-1` sell, `0` hold, `+1` buy) at `price`.
///
/// `fee_rate` is the taker fee charged on gross trade value; the supervisor
/// passes the live schedule, tests may pass `0.0`. If fees would drive cash
/// negative the whole execution aborts and no trade is recorded.
///
/// Returns the number of trades executed.
pub fn execute_spot_signal(
    s: &mut StrategyState,
    signal: i8,
    symbol: &str,
    price: f64,
    fee_rate: f64,
) -> usize {
    if signal == 0 {
        return 0;
    }
    if price <= 0.0 {
        warn!(strategy = %s.id, symbol, price, "refusing to execute at non-positive price");
        return 0;
    }

    match signal {
        1 => execute_buy(s, symbol, price, fee_rate),
        -1 => execute_sell(s, symbol, price, fee_rate),
        other => {
            warn!(strategy = %s.id, signal = other, "unrecognised spot signal — ignoring");
            0
        }
    }
}

fn execute_buy(s: &mut StrategyState, symbol: &str, price: f64, fee_rate: f64) -> usize {
    let mut executed = 0;

    if let Some(pos) = s.positions.get(symbol) {
        if pos.side == PositionSide::Long {
            debug!(strategy = %s.id, symbol, "long already open — buy signal skipped");
            return 0;
        }

        // A short is in the way: close it first, then open the long.
        let pos = pos.clone();
        let pnl = pos.quantity * (pos.avg_cost - price);
        let proceeds = pos.quantity * pos.avg_cost + pnl;
        let fee = fee_rate * (pos.quantity * price);
        if s.cash + proceeds - fee < 0.0 {
            info!(
                strategy = %s.id,
                symbol,
                proceeds,
                fee,
                "short close would drive cash negative — execution aborted"
            );
            return 0;
        }

        s.cash += proceeds - fee;
        s.positions.remove(symbol);
        let trade = Trade::new(
            &s.id,
            symbol,
            TradeSide::Buy,
            pos.quantity,
            price,
            proceeds - fee,
            TradeKind::Spot,
            format!(
                "Closed short {:.4} {} @ ${:.2} (pnl ${:+.2})",
                pos.quantity, symbol, price, pnl
            ),
        );
        s.record_trade(trade);
        risk::record_trade_result(&mut s.risk, pnl);
        info!(strategy = %s.id, symbol, pnl, "short closed on buy signal");
        executed += 1;
    }

    let budget = s.cash * BUY_BUDGET_FRACTION;
    if budget < MIN_TRADE_BUDGET {
        warn!(
            strategy = %s.id,
            symbol,
            budget,
            "buy budget below minimum — skipping open"
        );
        return executed;
    }

    let quantity = budget / price;
    let fee = fee_rate * budget;
    if budget + fee > s.cash {
        info!(strategy = %s.id, symbol, budget, fee, "fees exceed cash headroom — execution aborted");
        return executed;
    }

    s.cash -= budget + fee;
    s.positions.insert(
        symbol.to_string(),
        Position {
            symbol: symbol.to_string(),
            quantity,
            avg_cost: price,
            side: PositionSide::Long,
        },
    );
    let trade = Trade::new(
        &s.id,
        symbol,
        TradeSide::Buy,
        quantity,
        price,
        -(budget + fee),
        TradeKind::Spot,
        format!("Opened long {:.4} {} @ ${:.2}", quantity, symbol, price),
    );
    s.record_trade(trade);
    info!(strategy = %s.id, symbol, quantity, price, "long opened");

    executed + 1
}

fn execute_sell(s: &mut StrategyState, symbol: &str, price: f64, fee_rate: f64) -> usize {
    let pos = match s.positions.get(symbol) {
        Some(p) if p.side == PositionSide::Long => p.clone(),
        // No naked short opening on a sell signal.
        _ => {
            debug!(strategy = %s.id, symbol, "no long to close — sell signal skipped");
            return 0;
        }
    };

    let pnl = pos.quantity * (price - pos.avg_cost);
    let proceeds = pos.quantity * price;
    let fee = fee_rate * proceeds;
    if s.cash + proceeds - fee < 0.0 {
        info!(strategy = %s.id, symbol, "sell close would drive cash negative — execution aborted");
        return 0;
    }

    s.cash += proceeds - fee;
    s.positions.remove(symbol);
    let trade = Trade::new(
        &s.id,
        symbol,
        TradeSide::Sell,
        pos.quantity,
        price,
        proceeds - fee,
        TradeKind::Spot,
        format!(
            "Closed long {:.4} {} @ ${:.2} (pnl ${:+.2})",
            pos.quantity, symbol, price, pnl
        ),
    );
    s.record_trade(trade);
    risk::record_trade_result(&mut s.risk, pnl);
    info!(strategy = %s.id, symbol, pnl, "long closed on sell signal");

    1
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn spot_strategy(capital: f64) -> StrategyState {
        StrategyState::new("trend-btc", StrategyType::Spot, capital, 20.0)
    }

    #[test]
    fn hold_signal_is_a_noop() {
        let mut s = spot_strategy(1000.0);
        assert_eq!(execute_spot_signal(&mut s, 0, "BTC/USDT", 50_000.0, 0.0), 0);
        assert_eq!(s.cash, 1000.0);
        assert!(s.trade_history.is_empty());
    }

    #[test]
    fn spot_round_trip() {
        let mut s = spot_strategy(1000.0);

        let n = execute_spot_signal(&mut s, 1, "BTC/USDT", 50_000.0, 0.0);
        assert_eq!(n, 1);
        assert!((s.cash - 50.0).abs() < 1e-9);
        let pos = s.positions.get("BTC/USDT").expect("long open");
        assert!((pos.quantity - 0.019).abs() < 1e-12);
        assert_eq!(pos.avg_cost, 50_000.0);
        assert_eq!(pos.side, PositionSide::Long);

        let n = execute_spot_signal(&mut s, -1, "BTC/USDT", 60_000.0, 0.0);
        assert_eq!(n, 1);
        assert!((s.cash - 1190.0).abs() < 1e-9);
        assert!(s.positions.is_empty());
        // Realized pnl 190 recorded as a win.
        assert_eq!(s.risk.total_trades, 1);
        assert_eq!(s.risk.winning_trades, 1);
        assert!((s.risk.daily_pnl - 190.0).abs() < 1e-9);
    }

    #[test]
    fn buy_with_existing_long_is_skipped() {
        let mut s = spot_strategy(1000.0);
        execute_spot_signal(&mut s, 1, "BTC/USDT", 50_000.0, 0.0);
        let cash_before = s.cash;
        assert_eq!(execute_spot_signal(&mut s, 1, "BTC/USDT", 55_000.0, 0.0), 0);
        assert_eq!(s.cash, cash_before);
        assert_eq!(s.trade_history.len(), 1);
    }

    #[test]
    fn sell_without_long_opens_nothing() {
        let mut s = spot_strategy(1000.0);
        assert_eq!(execute_spot_signal(&mut s, -1, "BTC/USDT", 50_000.0, 0.0), 0);
        assert!(s.positions.is_empty());
        assert!(s.trade_history.is_empty());
    }

    #[test]
    fn buy_closes_short_then_opens_long() {
        let mut s = spot_strategy(0.0);
        s.positions.insert(
            "ETH/USDT".to_string(),
            Position {
                symbol: "ETH/USDT".to_string(),
                quantity: 2.0,
                avg_cost: 3000.0,
                side: PositionSide::Short,
            },
        );

        // Short entered at 3000, covered at 2500: pnl = 2 * 500 = 1000,
        // proceeds = 2 * 3000 + 1000 = 7000.
        let n = execute_spot_signal(&mut s, 1, "ETH/USDT", 2500.0, 0.0);
        assert_eq!(n, 2);

        let pos = s.positions.get("ETH/USDT").expect("long open");
        assert_eq!(pos.side, PositionSide::Long);
        // 95% of 7000 deployed at 2500.
        assert!((pos.quantity - 6650.0 / 2500.0).abs() < 1e-9);
        assert!((s.cash - 350.0).abs() < 1e-9);
        assert_eq!(s.trade_history.len(), 2);
        assert_eq!(s.risk.winning_trades, 1);
    }

    #[test]
    fn dust_budget_skips_open() {
        let mut s = spot_strategy(0.5);
        assert_eq!(execute_spot_signal(&mut s, 1, "BTC/USDT", 50_000.0, 0.0), 0);
        assert_eq!(s.cash, 0.5);
        assert!(s.positions.is_empty());
    }

    #[test]
    fn cash_delta_matches_trade_value() {
        let mut s = spot_strategy(2000.0);

        let before = s.cash;
        execute_spot_signal(&mut s, 1, "BTC/USDT", 40_000.0, fees_rate());
        let trade = s.trade_history.last().unwrap();
        assert!((s.cash - before - trade.value).abs() < 1e-9);

        let before = s.cash;
        execute_spot_signal(&mut s, -1, "BTC/USDT", 41_000.0, fees_rate());
        let trade = s.trade_history.last().unwrap();
        assert!((s.cash - before - trade.value).abs() < 1e-9);
    }

    fn fees_rate() -> f64 {
        crate::fees::SPOT_FEE_RATE
    }

    #[test]
    fn valuation_falls_back_to_avg_cost() {
        let mut s = spot_strategy(100.0);
        s.positions.insert(
            "BTC/USDT".to_string(),
            Position {
                symbol: "BTC/USDT".to_string(),
                quantity: 0.01,
                avg_cost: 50_000.0,
                side: PositionSide::Long,
            },
        );

        let empty = HashMap::new();
        assert!((portfolio_value(&s, &empty) - 600.0).abs() < 1e-9);

        let mut prices = HashMap::new();
        prices.insert("BTC/USDT".to_string(), 60_000.0);
        assert!((portfolio_value(&s, &prices) - 700.0).abs() < 1e-9);
    }

    #[test]
    fn short_valuation_is_entry_plus_mtm_pnl() {
        let mut s = spot_strategy(0.0);
        s.positions.insert(
            "ETH/USDT".to_string(),
            Position {
                symbol: "ETH/USDT".to_string(),
                quantity: 1.0,
                avg_cost: 3000.0,
                side: PositionSide::Short,
            },
        );

        let mut prices = HashMap::new();
        prices.insert("ETH/USDT".to_string(), 2500.0);
        // entry 3000 + pnl 500
        assert!((portfolio_value(&s, &prices) - 3500.0).abs() < 1e-9);
    }

    #[test]
    fn trade_roundtrip_preserves_fields() {
        let trade = Trade::new(
            "trend-btc",
            "BTC/USDT",
            TradeSide::Sell,
            0.5,
            42_000.0,
            21_000.0,
            TradeKind::Spot,
            "Closed long 0.5000 BTC/USDT @ $42000.00 (pnl $+500.00)".to_string(),
        );

        let json = serde_json::to_string(&trade).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, trade.id);
        assert_eq!(back.timestamp, trade.timestamp);
        assert_eq!(back.strategy_id, trade.strategy_id);
        assert_eq!(back.side, trade.side);
        assert_eq!(back.quantity, trade.quantity);
        assert_eq!(back.price, trade.price);
        assert_eq!(back.value, trade.value);
        assert_eq!(back.kind, trade.kind);
        assert_eq!(back.detail, trade.detail);
    }
}
