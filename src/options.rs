// =============================================================================
// Options execution, expiry and assignment
// =============================================================================
//
// Option positions are keyed by a deterministic contract id so a signal can
// only ever address one entry per (underlying, type, action, strike, expiry).
// Bought options carry a positive current USD value; sold options carry a
// negative one (the cost of buying them back).
//
// Expiry settlement runs inside the mark-to-market apply stage: the option
// entry is always deleted before any resulting spot position is created, so
// no contract can be both open and settled at the same time.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ThetaHarvestConfig;
use crate::portfolio::{Position, StrategyState, Trade};
use crate::risk;
use crate::signal_runner::{ActionKind, OptionsReply, SignalAction};
use crate::types::{OptionAction, OptionType, PositionSide, TradeKind, TradeSide};

/// Fraction of cash a single bought option may consume.
const OPTION_BUDGET_FRACTION: f64 = 0.95;

/// Positions smaller than this are considered fully consumed.
const QTY_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// First-order option greeks, as reported by the pricer or signal script.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Greeks {
    #[serde(default)]
    pub delta: f64,
    #[serde(default)]
    pub gamma: f64,
    #[serde(default)]
    pub theta: f64,
    #[serde(default)]
    pub vega: f64,
}

/// An open option position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionPosition {
    /// `{underlying}-{type}-{action}-{strike}-{expiry}`.
    pub id: String,
    pub underlying: String,
    pub option_type: OptionType,
    pub strike: f64,
    /// Calendar date, `YYYY-MM-DD`.
    pub expiry: String,
    /// Days to expiry, refreshed on every mark.
    pub dte: f64,
    pub action: OptionAction,
    pub quantity: f64,
    /// Entry premium in underlying units (exchange convention).
    pub entry_premium: f64,
    pub entry_premium_usd: f64,
    /// Positive for owned options, negative for sold obligations.
    pub current_value_usd: f64,
    #[serde(default)]
    pub greeks: Greeks,
    pub opened_at: chrono::DateTime<Utc>,
}

/// Deterministic contract id for the option book.
pub fn option_key(
    underlying: &str,
    option_type: OptionType,
    action: OptionAction,
    strike: f64,
    expiry: &str,
) -> String {
    format!("{underlying}-{option_type}-{action}-{strike}-{expiry}")
}

// ---------------------------------------------------------------------------
// Signal execution
// ---------------------------------------------------------------------------

/// Apply every action of an options signal to the strategy's book.
/// Returns the number of trades executed.
pub fn execute_options_signal(s: &mut StrategyState, reply: &OptionsReply) -> usize {
    let mut executed = 0;
    for action in &reply.actions {
        executed += match action.kind {
            ActionKind::Buy => open_bought(s, &reply.underlying, reply.spot_price, action),
            ActionKind::Sell => open_sold(s, &reply.underlying, reply.spot_price, action),
            ActionKind::Close => close_matching(s, &reply.underlying, reply.spot_price, action),
        };
    }
    executed
}

fn premium_usd(action: &SignalAction, spot_price: f64) -> f64 {
    if action.premium_usd > 0.0 {
        action.premium_usd
    } else {
        action.premium * spot_price
    }
}

fn open_bought(s: &mut StrategyState, underlying: &str, spot_price: f64, action: &SignalAction) -> usize {
    let cost = premium_usd(action, spot_price);
    if cost <= 0.0 {
        warn!(strategy = %s.id, underlying, "buy action without a usable premium — skipped");
        return 0;
    }
    if cost > s.cash * OPTION_BUDGET_FRACTION {
        info!(
            strategy = %s.id,
            underlying,
            cost,
            cash = s.cash,
            "insufficient cash for option buy — skipped"
        );
        return 0;
    }

    let id = option_key(underlying, action.option_type, OptionAction::Buy, action.strike, &action.expiry);
    if s.option_positions.contains_key(&id) {
        debug!(strategy = %s.id, id = %id, "option already open — buy skipped");
        return 0;
    }

    s.cash -= cost;
    s.option_positions.insert(
        id.clone(),
        OptionPosition {
            id: id.clone(),
            underlying: underlying.to_string(),
            option_type: action.option_type,
            strike: action.strike,
            expiry: action.expiry.clone(),
            dte: action.dte,
            action: OptionAction::Buy,
            quantity: 1.0,
            entry_premium: action.premium,
            entry_premium_usd: cost,
            current_value_usd: cost,
            greeks: action.greeks,
            opened_at: Utc::now(),
        },
    );
    let trade = Trade::new(
        &s.id,
        underlying,
        TradeSide::Buy,
        1.0,
        cost,
        -cost,
        TradeKind::Options,
        format!(
            "Bought {} {} {} exp {} for ${:.2}",
            underlying, action.strike, action.option_type, action.expiry, cost
        ),
    );
    s.record_trade(trade);
    info!(strategy = %s.id, id = %id, cost, "option bought");
    1
}

fn open_sold(s: &mut StrategyState, underlying: &str, spot_price: f64, action: &SignalAction) -> usize {
    let premium = premium_usd(action, spot_price);
    if premium <= 0.0 {
        warn!(strategy = %s.id, underlying, "sell action without a usable premium — skipped");
        return 0;
    }

    let id = option_key(underlying, action.option_type, OptionAction::Sell, action.strike, &action.expiry);
    if s.option_positions.contains_key(&id) {
        debug!(strategy = %s.id, id = %id, "option already open — sell skipped");
        return 0;
    }

    s.cash += premium;
    s.option_positions.insert(
        id.clone(),
        OptionPosition {
            id: id.clone(),
            underlying: underlying.to_string(),
            option_type: action.option_type,
            strike: action.strike,
            expiry: action.expiry.clone(),
            dte: action.dte,
            action: OptionAction::Sell,
            quantity: 1.0,
            entry_premium: action.premium,
            entry_premium_usd: premium,
            current_value_usd: -premium,
            greeks: action.greeks,
            opened_at: Utc::now(),
        },
    );
    let trade = Trade::new(
        &s.id,
        underlying,
        TradeSide::Sell,
        1.0,
        premium,
        premium,
        TradeKind::Options,
        format!(
            "Sold {} {} {} exp {} for ${:.2}",
            underlying, action.strike, action.option_type, action.expiry, premium
        ),
    );
    s.record_trade(trade);
    info!(strategy = %s.id, id = %id, premium, "option sold");
    1
}

fn close_matching(s: &mut StrategyState, underlying: &str, spot_price: f64, action: &SignalAction) -> usize {
    let keys: Vec<String> = s
        .option_positions
        .values()
        .filter(|o| {
            o.underlying == underlying
                && o.option_type == action.option_type
                && (o.strike - action.strike).abs() < f64::EPSILON
        })
        .map(|o| o.id.clone())
        .collect();

    if keys.is_empty() {
        debug!(strategy = %s.id, underlying, strike = action.strike, "close action matched nothing");
        return 0;
    }

    let mut closed = 0;
    for key in keys {
        let opt = match s.option_positions.remove(&key) {
            Some(o) => o,
            None => continue,
        };

        let (pnl, cash_delta, detail) = match opt.action {
            OptionAction::Buy => {
                let pnl = opt.current_value_usd - opt.entry_premium_usd;
                (
                    pnl,
                    opt.current_value_usd,
                    format!("Closed bought {} for ${:.2} (pnl ${:+.2})", opt.id, opt.current_value_usd, pnl),
                )
            }
            OptionAction::Sell => {
                let close_premium = premium_usd(action, spot_price);
                let pnl = opt.entry_premium_usd - close_premium;
                (
                    pnl,
                    -close_premium,
                    format!("Closed sold {} for ${:.2} (pnl ${:+.2})", opt.id, close_premium, pnl),
                )
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
            detail,
        );
        s.record_trade(trade);
        risk::record_trade_result(&mut s.risk, pnl);
        info!(strategy = %s.id, id = %key, pnl, "option closed");
        closed += 1;
    }
    closed
}

// ---------------------------------------------------------------------------
// Theta harvest
// ---------------------------------------------------------------------------

/// Early-close policy for sold options: take profit once enough of the
/// premium has decayed, cut losses at a multiple of the premium, and never
/// carry a short option into its final days.
pub fn run_theta_harvest(s: &mut StrategyState, cfg: &ThetaHarvestConfig) -> usize {
    if !cfg.enabled {
        return 0;
    }

    let keys: Vec<String> = s
        .option_positions
        .values()
        .filter(|o| o.action == OptionAction::Sell)
        .map(|o| o.id.clone())
        .collect();

    let mut closed = 0;
    for key in keys {
        let (entry, buyback, dte) = match s.option_positions.get(&key) {
            Some(opt) => (opt.entry_premium_usd, -opt.current_value_usd, opt.dte),
            None => continue,
        };
        if entry <= 0.0 {
            continue;
        }

        let captured_pct = (entry - buyback) / entry * 100.0;
        let loss_pct = (buyback - entry) / entry * 100.0;

        let reason = if captured_pct >= cfg.profit_target_pct {
            format!("profit target reached ({captured_pct:.1}% of premium captured)")
        } else if cfg.stop_loss_pct > 0.0 && loss_pct >= cfg.stop_loss_pct {
            format!("stop loss hit ({loss_pct:.1}% of premium)")
        } else if dte < cfg.min_dte_close {
            format!("{dte:.1} DTE below minimum")
        } else {
            continue;
        };

        let opt = match s.option_positions.remove(&key) {
            Some(o) => o,
            None => continue,
        };
        let pnl = entry - buyback;
        s.cash -= buyback;
        let trade = Trade::new(
            &s.id,
            &opt.underlying,
            TradeSide::Close,
            opt.quantity,
            opt.strike,
            -buyback,
            TradeKind::Options,
            format!("Theta harvest: {reason}"),
        );
        s.record_trade(trade);
        risk::record_trade_result(&mut s.risk, pnl);
        info!(strategy = %s.id, id = %key, pnl, %reason, "theta harvest close");
        closed += 1;
    }
    closed
}

// ---------------------------------------------------------------------------
// Expiry settlement & assignment
// ---------------------------------------------------------------------------

/// Settle an expired option at `spot`. The entry is removed from the book
/// first; sold options expiring in the money are assigned into a spot
/// position at strike.
pub fn settle_expired(s: &mut StrategyState, key: &str, spot: f64) {
    let opt = match s.option_positions.remove(key) {
        Some(o) => o,
        None => return,
    };

    let intrinsic = match opt.option_type {
        OptionType::Call => (spot - opt.strike).max(0.0),
        OptionType::Put => (opt.strike - spot).max(0.0),
    };

    match opt.action {
        OptionAction::Buy => settle_bought(s, &opt, spot, intrinsic),
        OptionAction::Sell => {
            if intrinsic > 0.0 {
                assign_sold(s, &opt, spot, intrinsic);
            } else {
                // Expired worthless: the premium banked at open is the win.
                let pnl = opt.entry_premium_usd;
                let trade = Trade::new(
                    &s.id,
                    &opt.underlying,
                    TradeSide::Close,
                    opt.quantity,
                    opt.strike,
                    0.0,
                    TradeKind::Options,
                    format!(
                        "Sold {} expired worthless (spot=${:.2}), premium ${:.2} kept",
                        opt.option_type, spot, opt.entry_premium_usd
                    ),
                );
                s.record_trade(trade);
                risk::record_trade_result(&mut s.risk, pnl);
                info!(strategy = %s.id, id = %opt.id, pnl, "sold option expired worthless");
            }
        }
    }
}

fn settle_bought(s: &mut StrategyState, opt: &OptionPosition, spot: f64, intrinsic: f64) {
    let payoff = intrinsic * opt.quantity;
    let pnl = payoff - opt.entry_premium_usd;

    s.cash += payoff;
    let detail = if intrinsic > 0.0 {
        format!(
            "Bought {} expired ITM (spot=${:.2}), settled for ${:.2}",
            opt.option_type, spot, payoff
        )
    } else {
        format!("Bought {} expired worthless (spot=${:.2})", opt.option_type, spot)
    };
    let trade = Trade::new(
        &s.id,
        &opt.underlying,
        TradeSide::Close,
        opt.quantity,
        opt.strike,
        payoff,
        TradeKind::Options,
        detail,
    );
    s.record_trade(trade);
    risk::record_trade_result(&mut s.risk, pnl);
    info!(strategy = %s.id, id = %opt.id, payoff, pnl, "bought option settled at expiry");
}

fn assign_sold(s: &mut StrategyState, opt: &OptionPosition, spot: f64, _intrinsic: f64) {
    match opt.option_type {
        OptionType::Put => {
            // Assigned: take delivery of the underlying at strike.
            let cost = opt.strike * opt.quantity;
            s.cash -= cost;

            match s.positions.get_mut(&opt.underlying) {
                Some(pos) if pos.side == PositionSide::Long => {
                    let total = pos.quantity + opt.quantity;
                    pos.avg_cost = (pos.quantity * pos.avg_cost + opt.quantity * opt.strike) / total;
                    pos.quantity = total;
                }
                _ => {
                    s.positions.insert(
                        opt.underlying.clone(),
                        Position {
                            symbol: opt.underlying.clone(),
                            quantity: opt.quantity,
                            avg_cost: opt.strike,
                            side: PositionSide::Long,
                        },
                    );
                }
            }

            let trade = Trade::new(
                &s.id,
                &opt.underlying,
                TradeSide::Buy,
                opt.quantity,
                opt.strike,
                -cost,
                TradeKind::Options,
                format!(
                    "Wheel assignment: sold put expired ITM (spot=${:.2}), bought {:.4} {} @ ${}",
                    spot, opt.quantity, opt.underlying, opt.strike
                ),
            );
            s.record_trade(trade);
            warn!(
                strategy = %s.id,
                id = %opt.id,
                spot,
                strike = opt.strike,
                "sold put assigned — underlying delivered at strike"
            );
        }
        OptionType::Call => {
            // Called away: deliver the underlying at strike.
            let proceeds = opt.strike * opt.quantity;
            s.cash += proceeds;

            let realized = match s.positions.get_mut(&opt.underlying) {
                Some(pos) if pos.side == PositionSide::Long => {
                    let consumed = opt.quantity.min(pos.quantity);
                    let pnl = (opt.strike - pos.avg_cost) * consumed;
                    pos.quantity -= consumed;
                    if pos.quantity <= QTY_EPSILON {
                        s.positions.remove(&opt.underlying);
                    }
                    Some(pnl)
                }
                _ => None,
            };

            let trade = Trade::new(
                &s.id,
                &opt.underlying,
                TradeSide::Sell,
                opt.quantity,
                opt.strike,
                proceeds,
                TradeKind::Options,
                format!(
                    "Wheel assignment: sold call expired ITM (spot=${:.2}), called away {:.4} {} @ ${}",
                    spot, opt.quantity, opt.underlying, opt.strike
                ),
            );
            s.record_trade(trade);

            match realized {
                Some(pnl) => {
                    risk::record_trade_result(&mut s.risk, pnl);
                    info!(strategy = %s.id, id = %opt.id, pnl, "long called away at strike");
                }
                None => {
                    warn!(
                        strategy = %s.id,
                        id = %opt.id,
                        "call assigned with no matching long — cash credited, no pnl recorded"
                    );
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategyType;

    fn strategy(cash: f64) -> StrategyState {
        StrategyState::new("wheel-btc", StrategyType::Options, cash, 25.0)
    }

    fn action(kind: ActionKind, option_type: OptionType, strike: f64, premium_usd: f64) -> SignalAction {
        SignalAction {
            kind,
            option_type,
            strike,
            expiry: "2026-09-25".to_string(),
            dte: 30.0,
            premium: 0.0,
            premium_usd,
            greeks: Greeks::default(),
        }
    }

    fn reply(actions: Vec<SignalAction>) -> OptionsReply {
        OptionsReply {
            strategy: "wheel-btc".to_string(),
            underlying: "BTC".to_string(),
            signal: 1,
            spot_price: 50_000.0,
            iv_rank: 40.0,
            actions,
            timestamp: String::new(),
            error: None,
        }
    }

    #[test]
    fn buy_debits_cash_and_opens_position() {
        let mut s = strategy(10_000.0);
        let r = reply(vec![action(ActionKind::Buy, OptionType::Call, 55_000.0, 800.0)]);

        assert_eq!(execute_options_signal(&mut s, &r), 1);
        assert!((s.cash - 9_200.0).abs() < 1e-9);

        let opt = s
            .option_positions
            .get("BTC-call-buy-55000-2026-09-25")
            .expect("position keyed by contract id");
        assert_eq!(opt.quantity, 1.0);
        assert!((opt.current_value_usd - 800.0).abs() < 1e-9);
        assert_eq!(s.trade_history.last().unwrap().value, -800.0);
    }

    #[test]
    fn buy_beyond_budget_is_skipped() {
        let mut s = strategy(1000.0);
        let r = reply(vec![action(ActionKind::Buy, OptionType::Call, 55_000.0, 960.0)]);
        assert_eq!(execute_options_signal(&mut s, &r), 0);
        assert_eq!(s.cash, 1000.0);
        assert!(s.option_positions.is_empty());
    }

    #[test]
    fn premium_falls_back_to_underlying_units() {
        let mut s = strategy(10_000.0);
        let mut a = action(ActionKind::Sell, OptionType::Put, 45_000.0, 0.0);
        a.premium = 0.01; // 0.01 BTC at spot 50k = $500
        let r = reply(vec![a]);

        assert_eq!(execute_options_signal(&mut s, &r), 1);
        assert!((s.cash - 10_500.0).abs() < 1e-9);
        let opt = s.option_positions.values().next().unwrap();
        assert!((opt.current_value_usd + 500.0).abs() < 1e-9);
    }

    #[test]
    fn close_bought_realizes_mark_minus_entry() {
        let mut s = strategy(10_000.0);
        let r = reply(vec![action(ActionKind::Buy, OptionType::Call, 55_000.0, 800.0)]);
        execute_options_signal(&mut s, &r);

        // Marked up to $1100 since entry.
        s.option_positions
            .get_mut("BTC-call-buy-55000-2026-09-25")
            .unwrap()
            .current_value_usd = 1100.0;

        let r = reply(vec![action(ActionKind::Close, OptionType::Call, 55_000.0, 0.0)]);
        assert_eq!(execute_options_signal(&mut s, &r), 1);
        assert!(s.option_positions.is_empty());
        assert!((s.cash - 10_300.0).abs() < 1e-9);
        assert_eq!(s.risk.winning_trades, 1);
        assert!((s.risk.daily_pnl - 300.0).abs() < 1e-9);
    }

    #[test]
    fn close_sold_pays_the_quoted_premium() {
        let mut s = strategy(10_000.0);
        let r = reply(vec![action(ActionKind::Sell, OptionType::Put, 45_000.0, 500.0)]);
        execute_options_signal(&mut s, &r);
        assert!((s.cash - 10_500.0).abs() < 1e-9);

        let r = reply(vec![action(ActionKind::Close, OptionType::Put, 45_000.0, 200.0)]);
        assert_eq!(execute_options_signal(&mut s, &r), 1);
        assert!((s.cash - 10_300.0).abs() < 1e-9);
        assert!((s.risk.daily_pnl - 300.0).abs() < 1e-9);
    }

    fn harvest_cfg() -> ThetaHarvestConfig {
        ThetaHarvestConfig {
            enabled: true,
            profit_target_pct: 60.0,
            stop_loss_pct: 200.0,
            min_dte_close: 3.0,
        }
    }

    #[test]
    fn theta_harvest_takes_profit() {
        let mut s = strategy(10_000.0);
        let r = reply(vec![action(ActionKind::Sell, OptionType::Put, 45_000.0, 500.0)]);
        execute_options_signal(&mut s, &r);

        // Decayed: buyback now costs $150, 70% captured.
        s.option_positions.values_mut().next().unwrap().current_value_usd = -150.0;

        assert_eq!(run_theta_harvest(&mut s, &harvest_cfg()), 1);
        assert!(s.option_positions.is_empty());
        assert!((s.cash - 10_350.0).abs() < 1e-9);
        assert_eq!(s.risk.winning_trades, 1);
    }

    #[test]
    fn theta_harvest_cuts_low_dte() {
        let mut s = strategy(10_000.0);
        let r = reply(vec![action(ActionKind::Sell, OptionType::Put, 45_000.0, 500.0)]);
        execute_options_signal(&mut s, &r);
        {
            let opt = s.option_positions.values_mut().next().unwrap();
            opt.dte = 2.0;
            opt.current_value_usd = -450.0; // only 10% captured
        }

        assert_eq!(run_theta_harvest(&mut s, &harvest_cfg()), 1);
        assert!(s.option_positions.is_empty());
    }

    #[test]
    fn theta_harvest_leaves_healthy_positions_alone() {
        let mut s = strategy(10_000.0);
        let r = reply(vec![action(ActionKind::Sell, OptionType::Put, 45_000.0, 500.0)]);
        execute_options_signal(&mut s, &r);
        s.option_positions.values_mut().next().unwrap().current_value_usd = -400.0;

        assert_eq!(run_theta_harvest(&mut s, &harvest_cfg()), 0);
        assert_eq!(s.option_positions.len(), 1);
    }

    fn sold_option(option_type: OptionType, strike: f64, premium_usd: f64) -> OptionPosition {
        let id = option_key("BTC", option_type, OptionAction::Sell, strike, "2026-09-25");
        OptionPosition {
            id,
            underlying: "BTC".to_string(),
            option_type,
            strike,
            expiry: "2026-09-25".to_string(),
            dte: 0.0,
            action: OptionAction::Sell,
            quantity: 1.0,
            entry_premium: premium_usd / 50_000.0,
            entry_premium_usd: premium_usd,
            current_value_usd: -premium_usd,
            greeks: Greeks::default(),
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn put_assignment_delivers_underlying_at_strike() {
        let mut s = strategy(5_000.0);
        let opt = sold_option(OptionType::Put, 50_000.0, 500.0);
        let key = opt.id.clone();
        s.option_positions.insert(key.clone(), opt);

        settle_expired(&mut s, &key, 45_000.0);

        assert!(s.option_positions.is_empty());
        assert!((s.cash + 45_000.0).abs() < 1e-9);
        let pos = s.positions.get("BTC").expect("assigned long");
        assert_eq!(pos.quantity, 1.0);
        assert_eq!(pos.avg_cost, 50_000.0);
        assert_eq!(pos.side, PositionSide::Long);

        let trade = s.trade_history.last().unwrap();
        assert_eq!(
            trade.detail,
            "Wheel assignment: sold put expired ITM (spot=$45000.00), bought 1.0000 BTC @ $50000"
        );
    }

    #[test]
    fn put_assignment_averages_into_existing_long() {
        let mut s = strategy(100_000.0);
        s.positions.insert(
            "BTC".to_string(),
            Position {
                symbol: "BTC".to_string(),
                quantity: 1.0,
                avg_cost: 40_000.0,
                side: PositionSide::Long,
            },
        );
        let opt = sold_option(OptionType::Put, 50_000.0, 500.0);
        let key = opt.id.clone();
        s.option_positions.insert(key.clone(), opt);

        settle_expired(&mut s, &key, 45_000.0);

        let pos = s.positions.get("BTC").unwrap();
        assert_eq!(pos.quantity, 2.0);
        assert!((pos.avg_cost - 45_000.0).abs() < 1e-9);
    }

    #[test]
    fn call_away_consumes_long_and_realizes_pnl() {
        let mut s = strategy(0.0);
        s.positions.insert(
            "BTC".to_string(),
            Position {
                symbol: "BTC".to_string(),
                quantity: 1.0,
                avg_cost: 40_000.0,
                side: PositionSide::Long,
            },
        );
        let opt = sold_option(OptionType::Call, 50_000.0, 600.0);
        let key = opt.id.clone();
        s.option_positions.insert(key.clone(), opt);

        settle_expired(&mut s, &key, 55_000.0);

        assert!(s.option_positions.is_empty());
        assert!(s.positions.is_empty());
        assert!((s.cash - 50_000.0).abs() < 1e-9);
        assert_eq!(s.risk.total_trades, 1);
        assert_eq!(s.risk.winning_trades, 1);
        assert!((s.risk.daily_pnl - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn naked_call_away_credits_cash_without_pnl() {
        let mut s = strategy(0.0);
        let opt = sold_option(OptionType::Call, 50_000.0, 600.0);
        let key = opt.id.clone();
        s.option_positions.insert(key.clone(), opt);

        settle_expired(&mut s, &key, 55_000.0);

        assert!((s.cash - 50_000.0).abs() < 1e-9);
        assert_eq!(s.risk.total_trades, 0);
        assert_eq!(s.trade_history.len(), 1);
    }

    #[test]
    fn sold_option_expiring_otm_keeps_premium() {
        let mut s = strategy(10_000.0);
        let opt = sold_option(OptionType::Put, 45_000.0, 500.0);
        let key = opt.id.clone();
        s.option_positions.insert(key.clone(), opt);

        settle_expired(&mut s, &key, 50_000.0);

        assert!(s.option_positions.is_empty());
        assert_eq!(s.cash, 10_000.0);
        assert_eq!(s.risk.winning_trades, 1);
        assert!((s.risk.daily_pnl - 500.0).abs() < 1e-9);
    }

    #[test]
    fn bought_option_settles_at_intrinsic() {
        let mut s = strategy(10_000.0);
        let id = option_key("BTC", OptionType::Call, OptionAction::Buy, 50_000.0, "2026-09-25");
        s.option_positions.insert(
            id.clone(),
            OptionPosition {
                id: id.clone(),
                underlying: "BTC".to_string(),
                option_type: OptionType::Call,
                strike: 50_000.0,
                expiry: "2026-09-25".to_string(),
                dte: 0.0,
                action: OptionAction::Buy,
                quantity: 1.0,
                entry_premium: 0.016,
                entry_premium_usd: 800.0,
                current_value_usd: 800.0,
                greeks: Greeks::default(),
                opened_at: Utc::now(),
            },
        );

        settle_expired(&mut s, &id, 53_000.0);

        assert!((s.cash - 13_000.0).abs() < 1e-9);
        assert!((s.risk.daily_pnl - 2_200.0).abs() < 1e-9);
        assert_eq!(s.risk.winning_trades, 1);
    }
}
