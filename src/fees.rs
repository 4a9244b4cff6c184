// =============================================================================
// Fee & slippage helpers for simulated fills
// =============================================================================
//
// All fills are simulated; these helpers keep the simulation honest. The
// taker fee is a flat fraction of trade value and slippage is a uniform
// random jitter applied to the quoted price before execution.
// =============================================================================

use rand::Rng;

/// Taker fee charged on spot trade value (0.1 %).
pub const SPOT_FEE_RATE: f64 = 0.001;

/// Half-width of the uniform slippage band (0.05 %).
pub const SLIPPAGE_BAND: f64 = 0.0005;

/// Fee owed on a trade of the given gross value.
#[inline]
pub fn spot_fee(value: f64) -> f64 {
    value.abs() * SPOT_FEE_RATE
}

/// Apply a uniform random jitter in `[-SLIPPAGE_BAND, +SLIPPAGE_BAND]` to a
/// quoted price. Returns the effective execution price.
pub fn with_slippage(price: f64) -> f64 {
    let mut rng = rand::rng();
    let jitter = rng.random_range(-SLIPPAGE_BAND..=SLIPPAGE_BAND);
    price * (1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_is_flat_fraction_of_value() {
        assert!((spot_fee(1000.0) - 1.0).abs() < 1e-12);
        assert!((spot_fee(-1000.0) - 1.0).abs() < 1e-12);
        assert_eq!(spot_fee(0.0), 0.0);
    }

    #[test]
    fn slippage_stays_inside_band() {
        for _ in 0..1000 {
            let p = with_slippage(50_000.0);
            assert!(p >= 50_000.0 * (1.0 - SLIPPAGE_BAND));
            assert!(p <= 50_000.0 * (1.0 + SLIPPAGE_BAND));
        }
    }
}
