// =============================================================================
// Spot price source — Binance public ticker REST client
// =============================================================================
//
// Only unauthenticated endpoints are used; the supervisor never trades on an
// exchange. Symbols are configured in `BASE/QUOTE` form and mapped to the
// exchange's concatenated tickers.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

/// Per-request timeout for price lookups (seconds).
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Quote currency assumed when an underlying is given bare (e.g. `BTC`).
const DEFAULT_QUOTE: &str = "USDT";

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

/// REST client for current spot prices.
#[derive(Clone)]
pub struct SpotPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl SpotPriceSource {
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

    /// `BTC/USDT` → `BTCUSDT`.
    pub fn ticker_for(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    /// Fetch the current USD price for one configured symbol.
    #[instrument(skip(self), name = "prices::fetch_price")]
    pub async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let ticker = Self::ticker_for(symbol);
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, ticker);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("price request for {ticker} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("price source returned {status} for {ticker}");
        }

        let body: TickerPrice = resp
            .json()
            .await
            .with_context(|| format!("failed to parse price response for {ticker}"))?;

        let price: f64 = body
            .price
            .parse()
            .with_context(|| format!("non-numeric price for {ticker}: {}", body.price))?;

        debug!(symbol, price, "spot price fetched");
        Ok(price)
    }

    /// Fetch prices for every symbol. Any single failure fails the whole
    /// batch — the caller treats that as "no live prices this cycle".
    pub async fn fetch_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>> {
        let mut prices = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            let price = self.fetch_price(symbol).await?;
            prices.insert(symbol.clone(), price);
        }
        Ok(prices)
    }

    /// Price for a bare underlying (`BTC`) against the default quote.
    pub async fn fetch_underlying_price(&self, underlying: &str) -> Result<f64> {
        self.fetch_price(&format!("{underlying}/{DEFAULT_QUOTE}")).await
    }
}

impl std::fmt::Debug for SpotPriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotPriceSource")
            .field("base_url", &self.base_url)
            .finish()
    }
}
