// =============================================================================
// Remote option pricer — Deribit-style public REST API
// =============================================================================
//
// Quotes come from the venue's public ticker; no authentication is needed.
// When the exact instrument is not listed (venues only list a handful of
// expiries), the pricer falls back to the nearest listed expiry at the same
// strike and type, within a 7-day tolerance.
// =============================================================================

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::options::Greeks;
use crate::types::OptionType;

use super::{OptionPricer, OptionQuote};

/// Maximum distance between requested and listed expiry for the fallback.
const EXPIRY_TOLERANCE_DAYS: i64 = 7;

/// Venue options expire at 08:00 UTC.
const EXPIRY_HOUR_UTC: u32 = 8;

/// Per-request timeout (seconds).
const REQUEST_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Default, Deserialize)]
struct TickerGreeks {
    #[serde(default)]
    delta: f64,
    #[serde(default)]
    gamma: f64,
    #[serde(default)]
    theta: f64,
    #[serde(default)]
    vega: f64,
}

#[derive(Debug, Deserialize)]
struct TickerResult {
    mark_price: f64,
    #[serde(default)]
    underlying_price: f64,
    #[serde(default)]
    index_price: f64,
    #[serde(default)]
    greeks: TickerGreeks,
}

#[derive(Debug, Deserialize)]
struct IndexResult {
    index_price: f64,
}

/// A listed option contract from the venue catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct Instrument {
    pub instrument_name: String,
    pub strike: f64,
    pub option_type: String,
    /// Milliseconds since the epoch.
    pub expiration_timestamp: i64,
}

// ---------------------------------------------------------------------------
// Instrument naming
// ---------------------------------------------------------------------------

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

fn format_strike(strike: f64) -> String {
    if strike.fract() == 0.0 {
        format!("{}", strike as i64)
    } else {
        format!("{strike}")
    }
}

/// `("BTC", "2026-03-13", 50000, Call)` → `BTC-13MAR26-50000-C`.
pub fn instrument_name(
    underlying: &str,
    expiry: &str,
    strike: f64,
    option_type: OptionType,
) -> Result<String> {
    let date = NaiveDate::parse_from_str(expiry, "%Y-%m-%d")
        .with_context(|| format!("invalid expiry date {expiry}"))?;
    let suffix = match option_type {
        OptionType::Call => "C",
        OptionType::Put => "P",
    };
    Ok(format!(
        "{}-{}{}{:02}-{}-{}",
        underlying.to_uppercase(),
        date.day(),
        MONTHS[date.month0() as usize],
        date.year() % 100,
        format_strike(strike),
        suffix
    ))
}

/// Requested expiry as the venue's expiration timestamp (ms).
fn expiry_timestamp_ms(expiry: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(expiry, "%Y-%m-%d")
        .with_context(|| format!("invalid expiry date {expiry}"))?;
    Ok(date
        .and_hms_opt(EXPIRY_HOUR_UTC, 0, 0)
        .expect("constant time of day is valid")
        .and_utc()
        .timestamp_millis())
}

/// Pick the listed instrument closest in time to the target expiry, at the
/// same strike and type, within the tolerance. Ties resolve to the earlier
/// candidate scanned.
pub fn pick_nearest(
    target_ms: i64,
    strike: f64,
    option_type: OptionType,
    candidates: &[Instrument],
) -> Option<&Instrument> {
    let wanted_type = option_type.to_string();
    let tolerance_ms = EXPIRY_TOLERANCE_DAYS * 86_400_000;

    candidates
        .iter()
        .filter(|i| (i.strike - strike).abs() < 1e-9 && i.option_type == wanted_type)
        .filter(|i| (i.expiration_timestamp - target_ms).abs() <= tolerance_ms)
        .min_by_key(|i| (i.expiration_timestamp - target_ms).abs())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Public REST client for the remote options venue.
pub struct RemotePricer {
    client: reqwest::Client,
    base_url: String,
}

impl RemotePricer {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("pricer returned {status} for {path}");
        }

        let envelope: Envelope<T> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response for {path}"))?;
        Ok(envelope.result)
    }

    async fn ticker(&self, instrument: &str) -> Result<TickerResult> {
        self.get_json(&format!("/api/v2/public/ticker?instrument_name={instrument}"))
            .await
    }

    async fn instruments(&self, currency: &str) -> Result<Vec<Instrument>> {
        self.get_json(&format!(
            "/api/v2/public/get_instruments?currency={}&kind=option&expired=false",
            currency.to_uppercase()
        ))
        .await
    }

    fn quote_from(ticker: TickerResult) -> OptionQuote {
        let spot = if ticker.underlying_price > 0.0 {
            ticker.underlying_price
        } else {
            ticker.index_price
        };
        OptionQuote {
            mark_price: ticker.mark_price,
            spot_price: spot,
            greeks: Greeks {
                delta: ticker.greeks.delta,
                gamma: ticker.greeks.gamma,
                theta: ticker.greeks.theta,
                vega: ticker.greeks.vega,
            },
        }
    }
}

#[async_trait]
impl OptionPricer for RemotePricer {
    #[instrument(skip(self), name = "pricer::option_quote")]
    async fn get_option_price_full(
        &self,
        underlying: &str,
        option_type: OptionType,
        strike: f64,
        expiry: &str,
    ) -> Result<OptionQuote> {
        let name = instrument_name(underlying, expiry, strike, option_type)?;

        match self.ticker(&name).await {
            Ok(ticker) => Ok(Self::quote_from(ticker)),
            Err(err) => {
                debug!(instrument = %name, error = %err, "exact instrument not quotable — trying nearest expiry");

                let catalog = self
                    .instruments(underlying)
                    .await
                    .context("instrument catalog fetch failed")?;
                let target = expiry_timestamp_ms(expiry)?;
                let nearest = pick_nearest(target, strike, option_type, &catalog).ok_or_else(|| {
                    anyhow!(
                        "no {underlying} {option_type} at strike {strike} within {EXPIRY_TOLERANCE_DAYS} days of {expiry}"
                    )
                })?;

                warn!(
                    requested = %name,
                    fallback = %nearest.instrument_name,
                    "using nearest listed expiry"
                );
                let ticker = self.ticker(&nearest.instrument_name).await?;
                Ok(Self::quote_from(ticker))
            }
        }
    }

    #[instrument(skip(self), name = "pricer::spot_price")]
    async fn fetch_spot_price(&self, underlying: &str) -> Result<f64> {
        let index: IndexResult = self
            .get_json(&format!(
                "/api/v2/public/index_price?index_name={}_usd",
                underlying.to_lowercase()
            ))
            .await?;
        Ok(index.index_price)
    }
}

impl std::fmt::Debug for RemotePricer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePricer")
            .field("base_url", &self.base_url)
            .finish()
    }
}
