// =============================================================================
// Supervisor configuration — JSON file with accumulated validation
// =============================================================================
//
// Every optional field carries a serde default so older config files keep
// loading as fields are added. Validation collects every problem before
// reporting: a broken config should surface all of its errors in one run,
// and any error blocks startup.
// =============================================================================

use std::path::{Component, Path};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::StrategyType;

/// Smallest allowed tick between cycles (seconds).
pub const MIN_TICK_SECONDS: u64 = 60;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_interval_seconds() -> u64 {
    600
}

fn default_log_dir() -> String {
    "scheduler/logs".to_string()
}

fn default_state_file() -> String {
    "scheduler/state.json".to_string()
}

fn default_price_source_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_pricer_url() -> String {
    "https://www.deribit.com".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Discord notification channels, one per trade book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordChannels {
    #[serde(default)]
    pub spot: String,
    #[serde(default)]
    pub options: String,
}

/// Discord notifier settings. The bot token may also come from the
/// `DISCORD_BOT_TOKEN` environment variable, which wins over the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub channels: DiscordChannels,
}

/// Which pricer backs the mark-to-market pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricerMode {
    /// Local Black–Scholes pricing from spot only.
    #[default]
    Local,
    /// Live quotes from the remote options venue.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricerConfig {
    #[serde(default)]
    pub mode: PricerMode,
    #[serde(default = "default_pricer_url")]
    pub base_url: String,
}

impl Default for PricerConfig {
    fn default() -> Self {
        Self {
            mode: PricerMode::default(),
            base_url: default_pricer_url(),
        }
    }
}

/// Early-close policy for sold options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThetaHarvestConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Close once this percentage of the premium has been captured.
    #[serde(default)]
    pub profit_target_pct: f64,
    /// Close once the loss reaches this percentage of the premium.
    #[serde(default)]
    pub stop_loss_pct: f64,
    /// Never carry a sold option below this many days to expiry.
    #[serde(default)]
    pub min_dte_close: f64,
}

/// One configured strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StrategyType,
    /// Relative path to the signal script, ending in `.py`.
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub capital: f64,
    pub max_drawdown_pct: f64,
    /// 0 means "use the global interval".
    #[serde(default)]
    pub interval_seconds: u64,
    /// Spot market the strategy trades (spot strategies).
    #[serde(default)]
    pub symbol: Option<String>,
    /// Underlying asset (options strategies).
    #[serde(default)]
    pub underlying: Option<String>,
    #[serde(default)]
    pub theta_harvest: Option<ThetaHarvestConfig>,
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub pricer: PricerConfig,
    #[serde(default = "default_price_source_url")]
    pub price_source_url: String,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            log_dir: default_log_dir(),
            state_file: default_state_file(),
            discord: DiscordConfig::default(),
            pricer: PricerConfig::default(),
            price_source_url: default_price_source_url(),
            strategies: Vec::new(),
        }
    }
}

// =============================================================================
// Loading & validation
// =============================================================================

impl Config {
    /// Load and validate the configuration. Any validation error is fatal;
    /// all of them are reported together.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.apply_env_overrides();

        let errors = config.validate();
        if !errors.is_empty() {
            bail!(
                "invalid config {} ({} error(s)):\n  - {}",
                path.display(),
                errors.len(),
                errors.join("\n  - ")
            );
        }

        info!(
            path = %path.display(),
            strategies = config.strategies.len(),
            interval_seconds = config.interval_seconds,
            "config loaded"
        );
        Ok(config)
    }

    /// `DISCORD_BOT_TOKEN` overrides a token in the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("DISCORD_BOT_TOKEN") {
            if !token.is_empty() {
                if !self.discord.token.is_empty() {
                    warn!("discord token set in both config and DISCORD_BOT_TOKEN — environment wins");
                }
                self.discord.token = token;
            }
        }
    }

    /// Collect every validation problem. Empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen_ids = std::collections::HashSet::new();

        if self.interval_seconds == 0 {
            errors.push("interval_seconds must be positive".to_string());
        }

        for (idx, s) in self.strategies.iter().enumerate() {
            let label = if s.id.is_empty() {
                format!("strategies[{idx}]")
            } else {
                format!("strategy '{}'", s.id)
            };

            if s.id.is_empty() {
                errors.push(format!("{label}: id must not be empty"));
            } else if !seen_ids.insert(s.id.clone()) {
                errors.push(format!("{label}: duplicate id"));
            }

            if let Some(err) = validate_script_path(&s.script) {
                errors.push(format!("{label}: {err}"));
            }

            if s.capital <= 0.0 {
                errors.push(format!("{label}: capital must be positive"));
            }

            if s.max_drawdown_pct <= 0.0 || s.max_drawdown_pct > 100.0 {
                errors.push(format!("{label}: max_drawdown_pct must be in (0, 100]"));
            }

            match s.kind {
                StrategyType::Spot => {
                    if s.symbol.as_deref().unwrap_or("").is_empty() {
                        errors.push(format!("{label}: spot strategies need a symbol"));
                    }
                }
                StrategyType::Options => {
                    if s.underlying.as_deref().unwrap_or("").is_empty() {
                        errors.push(format!("{label}: options strategies need an underlying"));
                    }
                }
                StrategyType::Perps => {}
            }

            if let Some(th) = &s.theta_harvest {
                if th.profit_target_pct < 0.0 {
                    errors.push(format!("{label}: theta_harvest.profit_target_pct must be >= 0"));
                }
                if th.stop_loss_pct < 0.0 {
                    errors.push(format!("{label}: theta_harvest.stop_loss_pct must be >= 0"));
                }
                if th.min_dte_close < 0.0 {
                    errors.push(format!("{label}: theta_harvest.min_dte_close must be >= 0"));
                }
            }
        }

        errors
    }

    // -------------------------------------------------------------------------
    // Derived values
    // -------------------------------------------------------------------------

    /// Effective interval for one strategy (0 falls back to the global).
    pub fn strategy_interval(&self, s: &StrategyConfig) -> u64 {
        if s.interval_seconds > 0 {
            s.interval_seconds
        } else {
            self.interval_seconds
        }
    }

    /// Tick between cycles: the shortest configured interval, floored at
    /// [`MIN_TICK_SECONDS`].
    pub fn tick_seconds(&self) -> u64 {
        let shortest = self
            .strategies
            .iter()
            .filter(|s| s.interval_seconds > 0)
            .map(|s| s.interval_seconds)
            .min()
            .unwrap_or(self.interval_seconds);

        shortest.min(self.interval_seconds).max(MIN_TICK_SECONDS)
    }

    /// Union of spot symbols referenced by the configured spot strategies.
    pub fn spot_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .strategies
            .iter()
            .filter(|s| s.kind == StrategyType::Spot)
            .filter_map(|s| s.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

/// Script paths must stay inside the working directory and name a Python
/// file: relative, no parent-directory components, ending in `.py`.
pub fn validate_script_path(script: &str) -> Option<String> {
    if script.is_empty() {
        return Some("script path must not be empty".to_string());
    }

    let path = Path::new(script);
    if path.is_absolute() {
        return Some(format!("script path {script} must be relative"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Some(format!("script path {script} must not escape the working directory"));
    }
    if !script.ends_with(".py") {
        return Some(format!("script path {script} must end in .py"));
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn spot_strategy(id: &str) -> StrategyConfig {
        StrategyConfig {
            id: id.to_string(),
            kind: StrategyType::Spot,
            script: "strategies/trend.py".to_string(),
            args: vec![],
            capital: 1000.0,
            max_drawdown_pct: 20.0,
            interval_seconds: 0,
            symbol: Some("BTC/USDT".to_string()),
            underlying: None,
            theta_harvest: None,
        }
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.interval_seconds, 600);
        assert_eq!(cfg.state_file, "scheduler/state.json");
        assert!(!cfg.discord.enabled);
        assert_eq!(cfg.pricer.mode, PricerMode::Local);
        assert!(cfg.strategies.is_empty());
    }

    #[test]
    fn parses_a_full_strategy_block() {
        let raw = r#"{
            "interval_seconds": 300,
            "strategies": [{
                "id": "wheel-btc",
                "type": "options",
                "script": "strategies/wheel.py",
                "args": ["--dte", "45"],
                "capital": 25000,
                "max_drawdown_pct": 25,
                "interval_seconds": 900,
                "underlying": "BTC",
                "theta_harvest": {"enabled": true, "profit_target_pct": 60, "stop_loss_pct": 200, "min_dte_close": 3}
            }]
        }"#;

        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.validate().is_empty());
        let s = &cfg.strategies[0];
        assert_eq!(s.kind, StrategyType::Options);
        assert_eq!(s.args, vec!["--dte", "45"]);
        assert!(s.theta_harvest.as_ref().unwrap().enabled);
    }

    #[test]
    fn validation_accumulates_all_errors() {
        let mut cfg = Config::default();
        let mut bad = spot_strategy("");
        bad.script = "/abs/path.py".to_string();
        bad.capital = -5.0;
        bad.max_drawdown_pct = 150.0;
        bad.symbol = None;
        cfg.strategies.push(bad);

        let errors = cfg.validate();
        assert!(errors.len() >= 5, "expected many errors, got: {errors:?}");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut cfg = Config::default();
        cfg.strategies.push(spot_strategy("a"));
        cfg.strategies.push(spot_strategy("a"));
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("duplicate id")));
    }

    #[test]
    fn script_path_boundaries() {
        assert!(validate_script_path("strategies/trend.py").is_none());
        assert!(validate_script_path("trend.py").is_none());
        assert!(validate_script_path("/etc/trend.py").is_some());
        assert!(validate_script_path("../trend.py").is_some());
        assert!(validate_script_path("a/../../trend.py").is_some());
        assert!(validate_script_path("trend.sh").is_some());
        assert!(validate_script_path("").is_some());
    }

    #[test]
    fn tick_is_shortest_interval_floored_at_sixty() {
        let mut cfg = Config::default();
        assert_eq!(cfg.tick_seconds(), 600);

        let mut fast = spot_strategy("fast");
        fast.interval_seconds = 300;
        cfg.strategies.push(fast);
        assert_eq!(cfg.tick_seconds(), 300);

        let mut faster = spot_strategy("faster");
        faster.interval_seconds = 30;
        cfg.strategies.push(faster);
        assert_eq!(cfg.tick_seconds(), 60);
    }

    #[test]
    fn per_strategy_interval_falls_back_to_global() {
        let cfg = Config {
            interval_seconds: 600,
            ..Config::default()
        };
        let mut s = spot_strategy("a");
        assert_eq!(cfg.strategy_interval(&s), 600);
        s.interval_seconds = 120;
        assert_eq!(cfg.strategy_interval(&s), 120);
    }

    #[test]
    fn spot_symbols_are_deduplicated() {
        let mut cfg = Config::default();
        cfg.strategies.push(spot_strategy("a"));
        cfg.strategies.push(spot_strategy("b"));
        let mut eth = spot_strategy("c");
        eth.symbol = Some("ETH/USDT".to_string());
        cfg.strategies.push(eth);

        assert_eq!(cfg.spot_symbols(), vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]);
    }

    #[test]
    fn env_token_override_wins() {
        std::env::set_var("DISCORD_BOT_TOKEN", "env-token");
        let mut cfg = Config::default();
        cfg.discord.token = "file-token".to_string();
        cfg.apply_env_overrides();
        assert_eq!(cfg.discord.token, "env-token");
        std::env::remove_var("DISCORD_BOT_TOKEN");
    }
}
