// =============================================================================
// Central application state — Aurora paper-trading supervisor
// =============================================================================
//
// One readers–writer lock guards the whole persisted document: the scheduler
// mutates it in short exclusive sections, the status API and the
// mark-collection stages read it under shared locks. The lock is never held
// across a subprocess or HTTP call.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::portfolio::{self, StrategyState};
use crate::signal_runner::MAX_CONCURRENT_SCRIPTS;
use crate::types::StrategyType;

/// Consecutive save failures after which trading is suppressed.
pub const MAX_SAVE_FAILURES: u32 = 3;

// =============================================================================
// Persisted document
// =============================================================================

/// Everything the supervisor remembers across restarts, serialized as one
/// JSON document. Missing fields default so older state files keep loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default)]
    pub cycle_count: u64,
    #[serde(default)]
    pub last_cycle_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub strategies: HashMap<String, StrategyState>,
}

// =============================================================================
// Shared state
// =============================================================================

/// Process-wide shared state, held behind `Arc` by every task.
pub struct AppState {
    /// The persisted document, behind the process-wide readers–writer lock.
    pub state: RwLock<SchedulerState>,
    /// Immutable after startup.
    pub config: Config,
    /// Consecutive state-save failures; at [`MAX_SAVE_FAILURES`] trading is
    /// suppressed until a save succeeds.
    pub save_failures: AtomicU32,
    /// Caps concurrent signal-script subprocesses.
    pub script_slots: Semaphore,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Config, state: SchedulerState) -> Self {
        Self {
            state: RwLock::new(state),
            config,
            save_failures: AtomicU32::new(0),
            script_slots: Semaphore::new(MAX_CONCURRENT_SCRIPTS),
            start_time: std::time::Instant::now(),
        }
    }

    /// True while saves keep failing and no trades may be taken.
    pub fn trading_suppressed(&self) -> bool {
        self.save_failures.load(Ordering::SeqCst) >= MAX_SAVE_FAILURES
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build a serialisable snapshot of the whole supervisor for the status
    /// API. Positions without a live price are valued at average cost.
    pub fn build_snapshot(&self) -> StatusSnapshot {
        let state = self.state.read();
        let no_prices = HashMap::new();

        let mut strategies: Vec<StrategySnapshot> = state
            .strategies
            .values()
            .map(|s| {
                let value = portfolio::portfolio_value(s, &no_prices);
                StrategySnapshot {
                    id: s.id.clone(),
                    kind: s.kind,
                    cash: s.cash,
                    initial_capital: s.initial_capital,
                    open_positions: s.positions.len(),
                    open_options: s.option_positions.len(),
                    portfolio_value: value,
                    last_run_at: s.last_run_at,
                    risk: RiskSnapshot {
                        daily_pnl: s.risk.daily_pnl,
                        peak_value: s.risk.peak_value,
                        current_drawdown_pct: s.risk.current_drawdown_pct,
                        max_drawdown_pct: s.risk.max_drawdown_pct,
                        consecutive_losses: s.risk.consecutive_losses,
                        circuit_breaker: s.risk.circuit_breaker,
                        circuit_breaker_until: s.risk.circuit_breaker_until,
                        total_trades: s.risk.total_trades,
                        winning_trades: s.risk.winning_trades,
                        losing_trades: s.risk.losing_trades,
                    },
                }
            })
            .collect();
        strategies.sort_by(|a, b| a.id.cmp(&b.id));

        let total_value = strategies.iter().map(|s| s.portfolio_value).sum();

        StatusSnapshot {
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            cycle_count: state.cycle_count,
            last_cycle_at: state.last_cycle_at,
            trading_suppressed: self.trading_suppressed(),
            total_value,
            strategies,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("AppState")
            .field("cycle_count", &state.cycle_count)
            .field("strategies", &state.strategies.len())
            .field("save_failures", &self.save_failures.load(Ordering::SeqCst))
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full supervisor snapshot served by `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub server_time: i64,
    pub uptime_secs: u64,
    pub cycle_count: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub trading_suppressed: bool,
    pub total_value: f64,
    pub strategies: Vec<StrategySnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategySnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StrategyType,
    pub cash: f64,
    pub initial_capital: f64,
    pub open_positions: usize,
    pub open_options: usize,
    pub portfolio_value: f64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub risk: RiskSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub daily_pnl: f64,
    pub peak_value: f64,
    pub current_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    pub consecutive_losses: u32,
    pub circuit_breaker: bool,
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
}
