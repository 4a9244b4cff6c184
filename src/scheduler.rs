// =============================================================================
// Supervisor loop — tick scheduling and the six-phase strategy pipeline
// =============================================================================
//
// One serial loop. Each tick the due strategies run through the same phases:
//
//   P1 read (shared)     snapshot inputs for the script
//   P2 risk (exclusive)  breaker gate, may force-close and deny
//   P3 run  (no lock)    invoke the signal script
//   P4 apply (exclusive) apply the signal, append trades
//   P5 mark (mixed)      collect (shared) → fetch (no lock) → apply (exclusive)
//   P6 report (shared)   status log, mark last-run
//
// The lock is never held across a subprocess or HTTP call. After the loop
// the cycle's total value is logged and state is persisted atomically; three
// consecutive save failures suppress trading until a save succeeds.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app_state::{AppState, SchedulerState, MAX_SAVE_FAILURES};
use crate::config::{Config, StrategyConfig};
use crate::fees;
use crate::marks;
use crate::notifier::DiscordNotifier;
use crate::options::{self, OptionPosition};
use crate::portfolio;
use crate::persistence;
use crate::pricer::OptionPricer;
use crate::prices::SpotPriceSource;
use crate::risk::{self, RiskVerdict};
use crate::signal_runner;
use crate::types::{StrategyType, TradeKind};

/// A strategy is due when it has never run or its interval has elapsed.
fn is_due(cfg: &StrategyConfig, state: &SchedulerState, config: &Config, now: DateTime<Utc>) -> bool {
    match state.strategies.get(&cfg.id).and_then(|s| s.last_run_at) {
        None => true,
        Some(last) => (now - last).num_seconds() >= config.strategy_interval(cfg) as i64,
    }
}

pub struct Scheduler {
    app: Arc<AppState>,
    pricer: Arc<dyn OptionPricer>,
    price_source: SpotPriceSource,
    notifier: Option<DiscordNotifier>,
}

impl Scheduler {
    pub fn new(
        app: Arc<AppState>,
        pricer: Arc<dyn OptionPricer>,
        price_source: SpotPriceSource,
        notifier: Option<DiscordNotifier>,
    ) -> Self {
        Self {
            app,
            pricer,
            price_source,
            notifier,
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run cycles until a shutdown signal arrives, then save and return.
    pub async fn run(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let tick = std::time::Duration::from_secs(self.app.config.tick_seconds());
        info!(tick_secs = tick.as_secs(), "supervisor loop started");

        loop {
            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutdown requested — saving state");
        self.persist();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(&self) {
        let now = Utc::now();

        let cycle = {
            let mut state = self.app.state.write();
            state.cycle_count += 1;
            state.last_cycle_at = Some(now);
            state.cycle_count
        };

        let due: Vec<StrategyConfig> = {
            let state = self.app.state.read();
            self.app
                .config
                .strategies
                .iter()
                .filter(|cfg| is_due(cfg, &state, &self.app.config, now))
                .cloned()
                .collect()
        };

        if due.is_empty() {
            debug!(cycle, "no strategies due");
            return;
        }

        info!(cycle, due = due.len(), "cycle started");

        let suppressed = self.app.trading_suppressed();
        let prices = if suppressed {
            warn!(cycle, "state saves failing — strategy execution suppressed");
            HashMap::new()
        } else {
            self.fetch_cycle_prices().await
        };

        if !suppressed {
            // Serial, in configured order.
            for cfg in &due {
                self.run_strategy(cfg, &prices).await;
            }
        }

        let total_value: f64 = {
            let state = self.app.state.read();
            state
                .strategies
                .values()
                .map(|s| portfolio::portfolio_value(s, &prices))
                .sum()
        };
        info!(cycle, total_value, due = due.len(), "cycle complete");

        self.persist();
    }

    /// Prefetch live prices for every configured spot symbol. Any failure
    /// yields an empty map: valuation falls back to average cost, and spot
    /// executions without a live price abort.
    async fn fetch_cycle_prices(&self) -> HashMap<String, f64> {
        let symbols = self.app.config.spot_symbols();
        if symbols.is_empty() {
            return HashMap::new();
        }

        match self.price_source.fetch_prices(&symbols).await {
            Ok(prices) => prices,
            Err(err) => {
                warn!(error = %err, "spot price fetch failed — continuing without live prices");
                HashMap::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Per-strategy pipeline
    // -------------------------------------------------------------------------

    async fn run_strategy(&self, cfg: &StrategyConfig, prices: &HashMap<String, f64>) {
        if cfg.kind == StrategyType::Perps {
            error!(strategy = %cfg.id, kind = %cfg.kind, "unsupported strategy type — skipping");
            self.mark_last_run(&cfg.id);
            return;
        }

        // P1 — snapshot inputs.
        let (value, option_book) = {
            let state = self.app.state.read();
            let s = match state.strategies.get(&cfg.id) {
                Some(s) => s,
                None => {
                    error!(strategy = %cfg.id, "strategy missing from state — skipping");
                    return;
                }
            };
            let value = portfolio::portfolio_value(s, prices);
            let book = if cfg.kind == StrategyType::Options {
                let open: Vec<&OptionPosition> = s.option_positions.values().collect();
                serde_json::to_string(&open).ok()
            } else {
                None
            };
            (value, book)
        };

        // P2 — risk gate.
        let verdict = {
            let mut state = self.app.state.write();
            match state.strategies.get_mut(&cfg.id) {
                Some(s) => risk::check_risk(s, value, prices),
                None => return,
            }
        };
        if let RiskVerdict::Deny(reason) = verdict {
            info!(strategy = %cfg.id, %reason, "risk check denied — skipping cycle");
            self.mark_last_run(&cfg.id);
            return;
        }

        // P3 — run the signal script.
        let stdout = match signal_runner::run_script(
            &cfg.script,
            &cfg.args,
            option_book.as_deref(),
            &self.app.script_slots,
        )
        .await
        {
            Ok(out) => out,
            Err(err) => {
                warn!(strategy = %cfg.id, error = %err, "signal script failed — skipping cycle");
                self.mark_last_run(&cfg.id);
                return;
            }
        };

        // P4 — apply the signal.
        let trades = match cfg.kind {
            StrategyType::Spot => self.apply_spot_signal(cfg, &stdout, prices),
            StrategyType::Options => self.apply_options_signal(cfg, &stdout),
            StrategyType::Perps => 0,
        };

        if trades > 0 {
            self.announce_trades(&cfg.id, trades).await;
        }

        // P5 — mark-to-market.
        let requests = {
            let state = self.app.state.read();
            state
                .strategies
                .get(&cfg.id)
                .map(|s| marks::collect_mark_requests(s, Utc::now()))
                .unwrap_or_default()
        };
        if !requests.is_empty() {
            let results = marks::fetch_marks(self.pricer.as_ref(), requests).await;
            if !results.is_empty() {
                let mut state = self.app.state.write();
                if let Some(s) = state.strategies.get_mut(&cfg.id) {
                    marks::apply_mark_results(s, results);
                }
            }
        }

        // P6 — status report.
        {
            let state = self.app.state.read();
            if let Some(s) = state.strategies.get(&cfg.id) {
                info!(
                    strategy = %cfg.id,
                    cash = s.cash,
                    open_positions = s.open_position_count(),
                    portfolio_value = portfolio::portfolio_value(s, prices),
                    trades_this_cycle = trades,
                    "strategy cycle complete"
                );
            }
        }
        self.mark_last_run(&cfg.id);
    }

    fn apply_spot_signal(
        &self,
        cfg: &StrategyConfig,
        stdout: &str,
        prices: &HashMap<String, f64>,
    ) -> usize {
        let reply = match signal_runner::parse_spot_reply(stdout) {
            Ok(r) => r,
            Err(err) => {
                warn!(strategy = %cfg.id, error = %err, "unparseable spot reply — skipping");
                return 0;
            }
        };
        if let Some(err) = reply.error.as_deref().filter(|e| !e.is_empty()) {
            info!(strategy = %cfg.id, script_error = err, "script reported an error — skipping execution");
            return 0;
        }
        if reply.signal == 0 {
            debug!(strategy = %cfg.id, "hold signal");
            return 0;
        }

        let symbol = if reply.symbol.is_empty() {
            cfg.symbol.clone().unwrap_or_default()
        } else {
            reply.symbol.clone()
        };
        if symbol.is_empty() {
            warn!(strategy = %cfg.id, "spot reply without a symbol — skipping");
            return 0;
        }

        let price = match prices.get(&symbol) {
            Some(p) => *p,
            None => {
                warn!(strategy = %cfg.id, %symbol, "no live price — spot execution aborted");
                return 0;
            }
        };
        let exec_price = fees::with_slippage(price);

        let mut state = self.app.state.write();
        match state.strategies.get_mut(&cfg.id) {
            Some(s) => portfolio::execute_spot_signal(s, reply.signal, &symbol, exec_price, fees::SPOT_FEE_RATE),
            None => 0,
        }
    }

    fn apply_options_signal(&self, cfg: &StrategyConfig, stdout: &str) -> usize {
        let reply = match signal_runner::parse_options_reply(stdout) {
            Ok(r) => r,
            Err(err) => {
                warn!(strategy = %cfg.id, error = %err, "unparseable options reply — skipping");
                return 0;
            }
        };
        if let Some(err) = reply.error.as_deref().filter(|e| !e.is_empty()) {
            info!(strategy = %cfg.id, script_error = err, "script reported an error — skipping execution");
            return 0;
        }

        let mut state = self.app.state.write();
        let s = match state.strategies.get_mut(&cfg.id) {
            Some(s) => s,
            None => return 0,
        };

        let mut trades = options::execute_options_signal(s, &reply);
        if let Some(harvest) = &cfg.theta_harvest {
            trades += options::run_theta_harvest(s, harvest);
        }
        trades
    }

    /// Send the details of the last `count` trades to the notifier, with no
    /// lock held across the sends.
    async fn announce_trades(&self, strategy_id: &str, count: usize) {
        let notifier = match &self.notifier {
            Some(n) => n,
            None => return,
        };

        let lines: Vec<(TradeKind, String)> = {
            let state = self.app.state.read();
            match state.strategies.get(strategy_id) {
                Some(s) => s
                    .trade_history
                    .iter()
                    .rev()
                    .take(count)
                    .map(|t| (t.kind, format!("[{}] {}", strategy_id, t.detail)))
                    .collect(),
                None => return,
            }
        };

        for (kind, line) in lines.into_iter().rev() {
            notifier.notify_trade(kind, &line).await;
        }
    }

    fn mark_last_run(&self, strategy_id: &str) {
        let mut state = self.app.state.write();
        if let Some(s) = state.strategies.get_mut(strategy_id) {
            s.last_run_at = Some(Utc::now());
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Save state atomically and track consecutive failures.
    pub fn persist(&self) {
        let path = Path::new(&self.app.config.state_file);
        let result = {
            let mut state = self.app.state.write();
            persistence::save_state(&mut state, path)
        };

        match result {
            Ok(()) => {
                let previous = self.app.save_failures.swap(0, Ordering::SeqCst);
                if previous >= MAX_SAVE_FAILURES {
                    info!("state save recovered — trading re-enabled");
                }
            }
            Err(err) => {
                let failures = self.app.save_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %err, consecutive = failures, "state save failed");
                if failures == MAX_SAVE_FAILURES {
                    error!("state saves failing repeatedly — suppressing trading until a save succeeds");
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("app", &self.app)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricer::black_scholes::BlackScholesPricer;
    use chrono::Duration;

    fn spot_cfg(id: &str, interval: u64) -> StrategyConfig {
        StrategyConfig {
            id: id.to_string(),
            kind: StrategyType::Spot,
            script: "strategies/trend.py".to_string(),
            args: vec![],
            capital: 1000.0,
            max_drawdown_pct: 20.0,
            interval_seconds: interval,
            symbol: Some("BTC/USDT".to_string()),
            underlying: None,
            theta_harvest: None,
        }
    }

    #[test]
    fn never_run_strategy_is_due() {
        let config = Config {
            strategies: vec![spot_cfg("a", 0)],
            ..Config::default()
        };
        let state = SchedulerState::default();
        assert!(is_due(&config.strategies[0], &state, &config, Utc::now()));
    }

    #[test]
    fn strategy_becomes_due_after_its_interval() {
        let config = Config {
            interval_seconds: 600,
            strategies: vec![spot_cfg("a", 300)],
            ..Config::default()
        };
        let mut state = SchedulerState::default();
        let now = Utc::now();
        let mut s = crate::portfolio::StrategyState::new("a", StrategyType::Spot, 1000.0, 20.0);
        s.last_run_at = Some(now - Duration::seconds(200));
        state.strategies.insert("a".to_string(), s);

        assert!(!is_due(&config.strategies[0], &state, &config, now));

        state.strategies.get_mut("a").unwrap().last_run_at = Some(now - Duration::seconds(301));
        assert!(is_due(&config.strategies[0], &state, &config, now));
    }

    #[test]
    fn zero_interval_uses_the_global() {
        let config = Config {
            interval_seconds: 600,
            strategies: vec![spot_cfg("a", 0)],
            ..Config::default()
        };
        let mut state = SchedulerState::default();
        let now = Utc::now();
        let mut s = crate::portfolio::StrategyState::new("a", StrategyType::Spot, 1000.0, 20.0);
        s.last_run_at = Some(now - Duration::seconds(450));
        state.strategies.insert("a".to_string(), s);

        assert!(!is_due(&config.strategies[0], &state, &config, now));
    }

    #[tokio::test]
    async fn suppressed_cycle_takes_no_trades_but_still_saves() {
        let state_path = std::env::temp_dir().join(format!(
            "aurora-paper-sched-{}.json",
            uuid::Uuid::new_v4()
        ));
        let config = Config {
            state_file: state_path.to_string_lossy().into_owned(),
            strategies: vec![spot_cfg("a", 0)],
            ..Config::default()
        };

        let mut state = SchedulerState::default();
        crate::persistence::prune_to_config(&mut state, &config);
        let app = Arc::new(AppState::new(config, state));
        app.save_failures.store(MAX_SAVE_FAILURES, Ordering::SeqCst);

        let price_source = SpotPriceSource::new("http://127.0.0.1:1");
        let pricer = Arc::new(BlackScholesPricer::new(price_source.clone()));
        let scheduler = Scheduler::new(app.clone(), pricer, price_source, None);

        scheduler.run_cycle().await;

        // The cycle ran (counter bumped), no strategy executed, and the
        // successful save cleared the suppression.
        let st = app.state.read();
        assert_eq!(st.cycle_count, 1);
        assert!(st.strategies["a"].trade_history.is_empty());
        assert!(st.strategies["a"].last_run_at.is_none());
        drop(st);
        assert!(!app.trading_suppressed());
        assert!(state_path.exists());
        std::fs::remove_file(&state_path).ok();
    }
}
