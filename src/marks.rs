// =============================================================================
// Mark-to-market pipeline — collect under read-lock, fetch unlocked, apply
// under write-lock
// =============================================================================
//
// The three stages keep the state lock away from the network: collection
// reads the option book into plain requests, fetching talks to the pricer
// with no lock held, and application writes results back in one critical
// section. A fetch failure drops that option's result; the position is left
// untouched for the cycle.
//
// Options whose DTE has reached zero are classified expired at collection
// time; applying an expired result settles the contract (including
// assignment of sold in-the-money options).
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::options::{self, Greeks};
use crate::portfolio::StrategyState;
use crate::pricer::OptionPricer;
use crate::types::{OptionAction, OptionType};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Days until the expiry date (00:00 UTC), as a fraction.
pub fn days_to_expiry(expiry: &str, now: DateTime<Utc>) -> Result<f64> {
    let date = NaiveDate::parse_from_str(expiry, "%Y-%m-%d")
        .with_context(|| format!("invalid expiry date {expiry}"))?;
    let expiry_utc = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    Ok((expiry_utc - now).num_seconds() as f64 / SECONDS_PER_DAY)
}

// ---------------------------------------------------------------------------
// Pipeline types
// ---------------------------------------------------------------------------

/// A pricing request for one open option, snapshotted under the read lock.
#[derive(Debug, Clone)]
pub struct MarkRequest {
    pub id: String,
    pub underlying: String,
    pub option_type: OptionType,
    pub expiry: String,
    pub strike: f64,
    pub action: OptionAction,
    pub quantity: f64,
    pub dte: f64,
    pub expired: bool,
}

/// A fetched pricing result, applied under the write lock.
#[derive(Debug, Clone)]
pub struct MarkResult {
    pub id: String,
    pub action: OptionAction,
    pub quantity: f64,
    pub dte: f64,
    pub expired: bool,
    pub spot_price: f64,
    /// Mark in underlying units; absent for expired contracts.
    pub mark_price: Option<f64>,
    pub greeks: Option<Greeks>,
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Stage 1 (shared lock): snapshot every open option into a request.
pub fn collect_mark_requests(s: &StrategyState, now: DateTime<Utc>) -> Vec<MarkRequest> {
    s.option_positions
        .values()
        .filter_map(|opt| match days_to_expiry(&opt.expiry, now) {
            Ok(dte) => Some(MarkRequest {
                id: opt.id.clone(),
                underlying: opt.underlying.clone(),
                option_type: opt.option_type,
                expiry: opt.expiry.clone(),
                strike: opt.strike,
                action: opt.action,
                quantity: opt.quantity,
                dte,
                expired: dte <= 0.0,
            }),
            Err(err) => {
                warn!(strategy = %s.id, id = %opt.id, error = %err, "unparseable expiry — option skipped");
                None
            }
        })
        .collect()
}

/// Stage 2 (no lock): fetch prices for every request. Expired contracts only
/// need the underlying's spot for intrinsic settlement.
pub async fn fetch_marks(pricer: &dyn OptionPricer, requests: Vec<MarkRequest>) -> Vec<MarkResult> {
    let mut results = Vec::with_capacity(requests.len());

    for req in requests {
        if req.expired {
            match pricer.fetch_spot_price(&req.underlying).await {
                Ok(spot) => results.push(MarkResult {
                    id: req.id,
                    action: req.action,
                    quantity: req.quantity,
                    dte: req.dte,
                    expired: true,
                    spot_price: spot,
                    mark_price: None,
                    greeks: None,
                }),
                Err(err) => {
                    warn!(id = %req.id, error = %err, "spot fetch for expired option failed — left untouched");
                }
            }
            continue;
        }

        match pricer
            .get_option_price_full(&req.underlying, req.option_type, req.strike, &req.expiry)
            .await
        {
            Ok(quote) => results.push(MarkResult {
                id: req.id,
                action: req.action,
                quantity: req.quantity,
                dte: req.dte,
                expired: false,
                spot_price: quote.spot_price,
                mark_price: Some(quote.mark_price),
                greeks: Some(quote.greeks),
            }),
            Err(err) => {
                warn!(id = %req.id, error = %err, "option mark fetch failed — left untouched");
            }
        }
    }

    results
}

/// Stage 3 (exclusive lock): write marks back and settle expired contracts.
pub fn apply_mark_results(s: &mut StrategyState, results: Vec<MarkResult>) {
    for result in results {
        if result.expired {
            options::settle_expired(s, &result.id, result.spot_price);
            continue;
        }

        let opt = match s.option_positions.get_mut(&result.id) {
            Some(o) => o,
            None => continue,
        };

        opt.dte = result.dte;
        if let Some(mark) = result.mark_price {
            let gross = mark * result.spot_price * opt.quantity;
            opt.current_value_usd = match opt.action {
                OptionAction::Buy => gross,
                OptionAction::Sell => -gross,
            };
        }
        if let Some(greeks) = result.greeks {
            opt.greeks = greeks;
        }
        debug!(strategy = %s.id, id = %result.id, value = opt.current_value_usd, "option marked");
    }
}
