// =============================================================================
// Local Black–Scholes pricer
// =============================================================================
//
// Fallback pricer for environments without access to a live options venue.
// Prices European options from the underlying's spot price with a fixed
// reference volatility and risk-free rate. Greeks follow venue conventions:
// theta per calendar day, vega per volatility point.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::options::Greeks;
use crate::prices::SpotPriceSource;
use crate::types::OptionType;

use super::{OptionPricer, OptionQuote};

/// Reference volatility used when no market surface is available.
pub const REFERENCE_VOLATILITY: f64 = 0.65;

/// Annualized risk-free rate.
pub const RISK_FREE_RATE: f64 = 0.05;

const DAYS_PER_YEAR: f64 = 365.0;

// ---------------------------------------------------------------------------
// Standard normal distribution
// ---------------------------------------------------------------------------

/// Standard normal PDF.
#[inline]
fn phi(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF via Abramowitz & Stegun 26.2.17 (max error < 7.5e-8).
#[inline]
fn norm_cdf(x: f64) -> f64 {
    if x >= 0.0 {
        const P: f64 = 0.231_641_9;
        const B1: f64 = 0.319_381_530;
        const B2: f64 = -0.356_563_782;
        const B3: f64 = 1.781_477_937;
        const B4: f64 = -1.821_255_978;
        const B5: f64 = 1.330_274_429;

        let t = 1.0 / (1.0 + P * x);
        let t2 = t * t;
        let t3 = t2 * t;
        let t4 = t3 * t;
        let t5 = t4 * t;
        1.0 - phi(x) * (B1 * t + B2 * t2 + B3 * t3 + B4 * t4 + B5 * t5)
    } else {
        1.0 - norm_cdf(-x)
    }
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Black–Scholes USD price and greeks for a European option.
///
/// `t_years` at or below zero collapses to intrinsic value with zero greeks.
pub fn price_and_greeks(
    spot: f64,
    strike: f64,
    t_years: f64,
    sigma: f64,
    rate: f64,
    option_type: OptionType,
) -> (f64, Greeks) {
    if t_years <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        let intrinsic = match option_type {
            OptionType::Call => (spot - strike).max(0.0),
            OptionType::Put => (strike - spot).max(0.0),
        };
        return (intrinsic, Greeks::default());
    }

    let sqrt_t = t_years.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t_years) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    let discount = (-rate * t_years).exp();

    let (price, delta, theta_annual) = match option_type {
        OptionType::Call => {
            let price = spot * norm_cdf(d1) - strike * discount * norm_cdf(d2);
            let theta = -spot * phi(d1) * sigma / (2.0 * sqrt_t)
                - rate * strike * discount * norm_cdf(d2);
            (price, norm_cdf(d1), theta)
        }
        OptionType::Put => {
            let price = strike * discount * norm_cdf(-d2) - spot * norm_cdf(-d1);
            let theta = -spot * phi(d1) * sigma / (2.0 * sqrt_t)
                + rate * strike * discount * norm_cdf(-d2);
            (price, norm_cdf(d1) - 1.0, theta)
        }
    };

    let greeks = Greeks {
        delta,
        gamma: phi(d1) / (spot * sigma * sqrt_t),
        theta: theta_annual / DAYS_PER_YEAR,
        vega: spot * phi(d1) * sqrt_t / 100.0,
    };

    (price, greeks)
}

fn years_to_expiry(expiry: &str) -> Result<f64> {
    let date = NaiveDate::parse_from_str(expiry, "%Y-%m-%d")
        .with_context(|| format!("invalid expiry date {expiry}"))?;
    let expiry_utc = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    let seconds = (expiry_utc - Utc::now()).num_seconds() as f64;
    Ok(seconds / (DAYS_PER_YEAR * 86_400.0))
}

// ---------------------------------------------------------------------------
// Pricer implementation
// ---------------------------------------------------------------------------

/// Local pricer backed by the spot price source only.
#[derive(Debug, Clone)]
pub struct BlackScholesPricer {
    spot_source: SpotPriceSource,
    volatility: f64,
    risk_free_rate: f64,
}

impl BlackScholesPricer {
    pub fn new(spot_source: SpotPriceSource) -> Self {
        Self {
            spot_source,
            volatility: REFERENCE_VOLATILITY,
            risk_free_rate: RISK_FREE_RATE,
        }
    }
}

#[async_trait]
impl OptionPricer for BlackScholesPricer {
    async fn get_option_price_full(
        &self,
        underlying: &str,
        option_type: OptionType,
        strike: f64,
        expiry: &str,
    ) -> Result<OptionQuote> {
        let spot = self.spot_source.fetch_underlying_price(underlying).await?;
        let t_years = years_to_expiry(expiry)?;
        let (usd_price, greeks) =
            price_and_greeks(spot, strike, t_years, self.volatility, self.risk_free_rate, option_type);

        Ok(OptionQuote {
            mark_price: if spot > 0.0 { usd_price / spot } else { 0.0 },
            spot_price: spot,
            greeks,
        })
    }

    async fn fetch_spot_price(&self, underlying: &str) -> Result<f64> {
        self.spot_source.fetch_underlying_price(underlying).await
    }
}
