// =============================================================================
// Signal script runner — black-box subprocess invocation with a hard timeout
// =============================================================================
//
// Strategy scripts are opaque: a buggy strategy can only crash itself, never
// the supervisor. Each invocation runs in its own process group so a timeout
// can kill the script and anything it spawned. A process-wide semaphore caps
// concurrent executions; the supervisor itself runs strategies serially, the
// cap bounds memory if it is ever parallelised.
//
// Options strategies receive their current option book as a JSON array on
// standard input. Replies arrive as a single JSON document on standard
// output; a non-empty `error` field is a graceful failure.
// =============================================================================

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::options::Greeks;
use crate::types::OptionType;

/// Hard wall-clock limit for a single script invocation.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum scripts allowed to run at the same time.
pub const MAX_CONCURRENT_SCRIPTS: usize = 4;

// ---------------------------------------------------------------------------
// Reply protocol
// ---------------------------------------------------------------------------

/// What an options action asks the supervisor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Buy,
    Sell,
    Close,
}

/// One requested option action from an options strategy reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalAction {
    #[serde(rename = "action")]
    pub kind: ActionKind,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiry: String,
    #[serde(default)]
    pub dte: f64,
    /// Premium in underlying units.
    #[serde(default)]
    pub premium: f64,
    #[serde(default)]
    pub premium_usd: f64,
    #[serde(default)]
    pub greeks: Greeks,
}

/// Reply from a spot strategy script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotReply {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub timeframe: String,
    #[serde(default)]
    pub signal: i8,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub indicators: serde_json::Value,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply from an options strategy script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsReply {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub underlying: String,
    #[serde(default)]
    pub signal: i8,
    #[serde(default)]
    pub spot_price: f64,
    #[serde(default)]
    pub iv_rank: f64,
    #[serde(default)]
    pub actions: Vec<SignalAction>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn parse_spot_reply(stdout: &str) -> Result<SpotReply> {
    serde_json::from_str(stdout.trim()).context("failed to parse spot signal reply")
}

pub fn parse_options_reply(stdout: &str) -> Result<OptionsReply> {
    serde_json::from_str(stdout.trim()).context("failed to parse options signal reply")
}

// ---------------------------------------------------------------------------
// Subprocess execution
// ---------------------------------------------------------------------------

/// Run a signal script and return its standard output.
///
/// Holds a semaphore permit for the duration of the run. Never called while
/// the state lock is held.
pub async fn run_script(
    script: &str,
    args: &[String],
    stdin_payload: Option<&str>,
    slots: &Semaphore,
) -> Result<String> {
    let _permit = slots.acquire().await.context("script semaphore closed")?;

    let mut cmd = Command::new("python3");
    cmd.arg(script)
        .args(args)
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn signal script {script}"))?;
    let pid = child.id();

    if let Some(payload) = stdin_payload {
        let mut stdin = child.stdin.take().context("script stdin unavailable")?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .context("failed to write option book to script stdin")?;
        // Dropping the handle closes the pipe so the script sees EOF.
    }

    let output = match tokio::time::timeout(SCRIPT_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("failed to collect output of {script}"))?,
        Err(_) => {
            kill_process_group(pid);
            bail!(
                "signal script {script} timed out after {}s — process group killed",
                SCRIPT_TIMEOUT.as_secs()
            );
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "signal script {script} exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }

    debug!(script, bytes = output.stdout.len(), "signal script completed");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Kill the script's whole process group. The script was started with
/// `process_group(0)`, so its pid doubles as the group id.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        warn!(pid, "killing timed-out script process group");
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_spot_reply() {
        let raw = r#"{
            "strategy": "trend-btc",
            "symbol": "BTC/USDT",
            "timeframe": "1h",
            "signal": -1,
            "price": 50123.5,
            "indicators": {"rsi": 71.2, "ema_fast": 50100.0},
            "timestamp": "2026-08-01T12:00:00Z"
        }"#;

        let reply = parse_spot_reply(raw).unwrap();
        assert_eq!(reply.symbol, "BTC/USDT");
        assert_eq!(reply.signal, -1);
        assert_eq!(reply.price, 50123.5);
        assert!(reply.error.is_none());
        assert_eq!(reply.indicators["rsi"], 71.2);
    }

    #[test]
    fn missing_fields_default() {
        let reply = parse_spot_reply(r#"{"signal": 1}"#).unwrap();
        assert_eq!(reply.signal, 1);
        assert_eq!(reply.symbol, "");
        assert_eq!(reply.price, 0.0);
    }

    #[test]
    fn graceful_error_survives_parsing() {
        let reply = parse_spot_reply(r#"{"signal": 0, "error": "no candles yet"}"#).unwrap();
        assert_eq!(reply.error.as_deref(), Some("no candles yet"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let reply = parse_spot_reply(r#"{"signal": 1, "confidence": 0.8, "notes": []}"#).unwrap();
        assert_eq!(reply.signal, 1);
    }

    #[test]
    fn parses_options_reply_with_actions() {
        let raw = r#"{
            "strategy": "wheel-btc",
            "underlying": "BTC",
            "signal": 1,
            "spot_price": 50000.0,
            "iv_rank": 62.5,
            "actions": [
                {
                    "action": "sell",
                    "option_type": "put",
                    "strike": 45000.0,
                    "expiry": "2026-09-25",
                    "dte": 55.0,
                    "premium": 0.012,
                    "premium_usd": 600.0,
                    "greeks": {"delta": -0.22, "gamma": 0.00001, "theta": -12.5, "vega": 38.0}
                }
            ],
            "timestamp": "2026-08-01T12:00:00Z"
        }"#;

        let reply = parse_options_reply(raw).unwrap();
        assert_eq!(reply.underlying, "BTC");
        assert_eq!(reply.actions.len(), 1);
        let a = &reply.actions[0];
        assert_eq!(a.kind, ActionKind::Sell);
        assert_eq!(a.option_type, OptionType::Put);
        assert_eq!(a.strike, 45_000.0);
        assert!((a.greeks.delta + 0.22).abs() < 1e-12);
    }

    #[test]
    fn garbage_stdout_is_an_error() {
        assert!(parse_spot_reply("Traceback (most recent call last):").is_err());
        assert!(parse_options_reply("").is_err());
    }
}
