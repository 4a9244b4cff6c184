// =============================================================================
// Option pricer capability
// =============================================================================
//
// The mark-to-market pipeline consumes exactly two operations; which concrete
// pricer provides them is a configuration choice. `remote` quotes from a live
// options exchange, `black_scholes` prices locally when no market data
// source is available.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;

use crate::options::Greeks;
use crate::types::OptionType;

pub mod black_scholes;
pub mod remote;

/// A full option quote: mark price in underlying units (exchange
/// convention), the underlying's USD spot, and first-order greeks.
#[derive(Debug, Clone, Copy)]
pub struct OptionQuote {
    pub mark_price: f64,
    pub spot_price: f64,
    pub greeks: Greeks,
}

/// Live pricing capability consumed by the mark-to-market pipeline.
#[async_trait]
pub trait OptionPricer: Send + Sync {
    /// Quote a single option contract.
    async fn get_option_price_full(
        &self,
        underlying: &str,
        option_type: OptionType,
        strike: f64,
        expiry: &str,
    ) -> Result<OptionQuote>;

    /// Current USD spot price of the underlying.
    async fn fetch_spot_price(&self, underlying: &str) -> Result<f64>;
}
