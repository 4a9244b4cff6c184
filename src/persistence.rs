// =============================================================================
// State persistence — atomic JSON snapshots of the supervisor's memory
// =============================================================================
//
// The whole document is written to a `.tmp` sibling (mode 0600) and renamed
// over the target, so a crash mid-write can never corrupt the last good
// state. Loading is forgiving: a missing file yields fresh state, and
// individually broken entries are clamped or dropped with a warning rather
// than rejecting the file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::app_state::SchedulerState;
use crate::config::Config;
use crate::portfolio::StrategyState;

/// Trades kept per strategy; older entries survive only in the log stream.
pub const TRADE_HISTORY_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load persisted state. A missing file is fresh state; a file that exists
/// but does not parse is fatal.
pub fn load_state(path: &Path) -> Result<SchedulerState> {
    if !path.exists() {
        info!(path = %path.display(), "no state file — starting fresh");
        return Ok(SchedulerState::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state from {}", path.display()))?;

    let state: SchedulerState = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse state from {}", path.display()))?;

    info!(
        path = %path.display(),
        cycle_count = state.cycle_count,
        strategies = state.strategies.len(),
        "state loaded"
    );
    Ok(state)
}

/// Repair individually broken entries in loaded state: clamp impossible
/// balances and drop positions that cannot be valued.
pub fn validate_loaded(state: &mut SchedulerState) {
    for s in state.strategies.values_mut() {
        if s.initial_capital <= 0.0 {
            warn!(strategy = %s.id, initial_capital = s.initial_capital, "non-positive initial capital — clamped to 0");
            s.initial_capital = 0.0;
        }
        if s.cash < 0.0 {
            warn!(strategy = %s.id, cash = s.cash, "negative cash — clamped to 0");
            s.cash = 0.0;
        }

        s.positions.retain(|symbol, pos| {
            let keep = pos.quantity > 0.0;
            if !keep {
                warn!(strategy = %s.id, %symbol, quantity = pos.quantity, "dropping spot position with non-positive quantity");
            }
            keep
        });

        s.option_positions.retain(|id, opt| {
            let keep = opt.quantity > 0.0;
            if !keep {
                warn!(strategy = %s.id, %id, quantity = opt.quantity, "dropping option position with non-positive quantity");
            }
            keep
        });
    }
}

/// Reconcile persisted strategies with the current config: drop the ones no
/// longer configured, fund the newly configured ones, and refresh the risk
/// limits the config owns.
pub fn prune_to_config(state: &mut SchedulerState, config: &Config) {
    state.strategies.retain(|id, _| {
        let keep = config.strategies.iter().any(|s| &s.id == id);
        if !keep {
            warn!(strategy = %id, "strategy no longer configured — dropping persisted state");
        }
        keep
    });

    for cfg in &config.strategies {
        match state.strategies.get_mut(&cfg.id) {
            Some(s) => {
                s.risk.max_drawdown_pct = cfg.max_drawdown_pct;
            }
            None => {
                info!(strategy = %cfg.id, capital = cfg.capital, "initialising new strategy");
                state.strategies.insert(
                    cfg.id.clone(),
                    StrategyState::new(&cfg.id, cfg.kind, cfg.capital, cfg.max_drawdown_pct),
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Saving
// ---------------------------------------------------------------------------

/// Persist state atomically: trim trade histories, write to a 0600 `.tmp`
/// sibling, then rename over the target.
pub fn save_state(state: &mut SchedulerState, path: &Path) -> Result<()> {
    for s in state.strategies.values_mut() {
        if s.trade_history.len() > TRADE_HISTORY_LIMIT {
            let excess = s.trade_history.len() - TRADE_HISTORY_LIMIT;
            s.trade_history.drain(..excess);
        }
    }

    let content = serde_json::to_string_pretty(state).context("failed to serialise state to JSON")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }
    }

    let tmp_path = path.with_extension("json.tmp");
    write_private(&tmp_path, content.as_bytes())
        .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;

    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, content)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::portfolio::{Position, Trade};
    use crate::types::{PositionSide, StrategyType, TradeKind, TradeSide};
    use std::path::PathBuf;

    fn temp_state_path() -> PathBuf {
        std::env::temp_dir().join(format!("aurora-paper-state-{}.json", uuid::Uuid::new_v4()))
    }

    fn state_with_strategy() -> SchedulerState {
        let mut state = SchedulerState::default();
        let mut s = StrategyState::new("trend-btc", StrategyType::Spot, 1000.0, 20.0);
        s.positions.insert(
            "BTC/USDT".to_string(),
            Position {
                symbol: "BTC/USDT".to_string(),
                quantity: 0.019,
                avg_cost: 50_000.0,
                side: PositionSide::Long,
            },
        );
        s.record_trade(Trade::new(
            "trend-btc",
            "BTC/USDT",
            TradeSide::Buy,
            0.019,
            50_000.0,
            -950.0,
            TradeKind::Spot,
            "Opened long 0.0190 BTC/USDT @ $50000.00".to_string(),
        ));
        state.cycle_count = 12;
        state.strategies.insert(s.id.clone(), s);
        state
    }

    #[test]
    fn save_then_load_roundtrips() {
        let path = temp_state_path();
        let mut state = state_with_strategy();

        save_state(&mut state, &path).unwrap();
        let loaded = load_state(&path).unwrap();

        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            serde_json::to_value(&loaded).unwrap()
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_yields_fresh_state() {
        let path = temp_state_path();
        let state = load_state(&path).unwrap();
        assert_eq!(state.cycle_count, 0);
        assert!(state.strategies.is_empty());
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let path = temp_state_path();
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_state(&path).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn save_trims_history_to_limit() {
        let path = temp_state_path();
        let mut state = state_with_strategy();
        {
            let s = state.strategies.get_mut("trend-btc").unwrap();
            for i in 0..(TRADE_HISTORY_LIMIT + 50) {
                s.record_trade(Trade::new(
                    "trend-btc",
                    "BTC/USDT",
                    TradeSide::Buy,
                    1.0,
                    i as f64,
                    -(i as f64),
                    TradeKind::Spot,
                    format!("fill #{i}"),
                ));
            }
        }

        save_state(&mut state, &path).unwrap();
        let loaded = load_state(&path).unwrap();
        let s = &loaded.strategies["trend-btc"];
        assert_eq!(s.trade_history.len(), TRADE_HISTORY_LIMIT);
        // Most recent entries survive.
        assert_eq!(s.trade_history.last().unwrap().detail, "fill #1049");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn validation_clamps_and_drops() {
        let mut state = state_with_strategy();
        {
            let s = state.strategies.get_mut("trend-btc").unwrap();
            s.cash = -10.0;
            s.initial_capital = -100.0;
            s.positions.get_mut("BTC/USDT").unwrap().quantity = 0.0;
        }

        validate_loaded(&mut state);
        let s = &state.strategies["trend-btc"];
        assert_eq!(s.cash, 0.0);
        assert_eq!(s.initial_capital, 0.0);
        assert!(s.positions.is_empty());
    }

    fn cfg_with(ids: &[&str]) -> Config {
        let mut cfg = Config::default();
        for id in ids {
            cfg.strategies.push(StrategyConfig {
                id: id.to_string(),
                kind: StrategyType::Spot,
                script: "strategies/trend.py".to_string(),
                args: vec![],
                capital: 2500.0,
                max_drawdown_pct: 15.0,
                interval_seconds: 0,
                symbol: Some("BTC/USDT".to_string()),
                underlying: None,
                theta_harvest: None,
            });
        }
        cfg
    }

    #[test]
    fn pruning_drops_unknown_and_funds_new() {
        let mut state = state_with_strategy();
        let cfg = cfg_with(&["momentum-eth"]);

        prune_to_config(&mut state, &cfg);

        assert!(!state.strategies.contains_key("trend-btc"));
        let added = &state.strategies["momentum-eth"];
        assert_eq!(added.cash, 2500.0);
        assert_eq!(added.initial_capital, 2500.0);
        assert_eq!(added.risk.max_drawdown_pct, 15.0);
    }

    #[test]
    fn pruning_refreshes_drawdown_limit_on_survivors() {
        let mut state = state_with_strategy();
        let cfg = cfg_with(&["trend-btc"]);

        prune_to_config(&mut state, &cfg);

        let s = &state.strategies["trend-btc"];
        assert_eq!(s.risk.max_drawdown_pct, 15.0);
        // Existing balances are preserved, not re-funded.
        assert_eq!(s.cash, 1000.0);
    }
}
