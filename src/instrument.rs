// =============================================================================
// Instrument metadata + rounding to exchange lot/tick grids.
// Populated once at startup from get_symbol_info, immutable thereafter.
// =============================================================================

use anyhow::{bail, Result};
use rust_decimal::{Decimal, RoundingStrategy};

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentInfo {
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Option<Decimal>,
    pub qty_precision: u32,
    pub price_tick: Decimal,
    pub price_precision: u32,
}

impl InstrumentInfo {
    /// Round `raw` to the nearest multiple of `qty_step`, truncate to
    /// `qty_precision` decimal places, floor at `min_qty`, and reject values
    /// above `max_qty` when advertised.
    pub fn round_quantity(&self, raw: Decimal) -> Result<Decimal> {
        let mut q = round_to_step(raw, self.qty_step, self.qty_precision);
        if q < self.min_qty {
            q = self.min_qty;
        }
        if let Some(max) = self.max_qty {
            if q > max {
                bail!("rounded quantity {q} exceeds max_qty {max}");
            }
        }
        Ok(q)
    }

    /// Snap `raw` to the nearest multiple of `price_tick`.
    pub fn round_price(&self, raw: Decimal) -> Decimal {
        round_to_step(raw, self.price_tick, self.price_precision)
    }
}

fn round_to_step(raw: Decimal, step: Decimal, precision: u32) -> Decimal {
    if step.is_zero() {
        return raw.round_dp(precision);
    }
    let steps = (raw / step).round();
    (steps * step).round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

/// Strips the optional perpetual `.P` suffix TradingView appends to symbols.
pub fn strip_perpetual_suffix(symbol: &str) -> &str {
    symbol.strip_suffix(".P").unwrap_or(symbol)
}

/// Extracts the quote currency from a symbol by checking the known
/// stablecoin suffix alphabet, e.g. `ETHUSDT` -> `USDT`.
pub fn quote_currency(symbol: &str) -> Option<&'static str> {
    let symbol = strip_perpetual_suffix(symbol);
    for quote in ["USDT", "USDC"] {
        if symbol.ends_with(quote) {
            return Some(quote);
        }
    }
    None
}

/// Normalizes a raw webhook/config symbol into the venue's canonical form.
/// Idempotent: `normalize_symbol(normalize_symbol(x)) == normalize_symbol(x)`.
pub fn normalize_symbol(symbol: &str) -> String {
    strip_perpetual_suffix(symbol.trim()).to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn info() -> InstrumentInfo {
        InstrumentInfo {
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: None,
            qty_precision: 3,
            price_tick: dec!(0.01),
            price_precision: 2,
        }
    }

    #[test]
    fn rounds_quantity_to_step() {
        let i = info();
        assert_eq!(i.round_quantity(dec!(1.0004)).unwrap(), dec!(1.000));
        assert_eq!(i.round_quantity(dec!(1.0006)).unwrap(), dec!(1.001));
    }

    #[test]
    fn floors_quantity_below_min() {
        let i = info();
        assert_eq!(i.round_quantity(dec!(0.0001)).unwrap(), dec!(0.001));
    }

    #[test]
    fn rejects_quantity_above_max() {
        let mut i = info();
        i.max_qty = Some(dec!(10));
        assert!(i.round_quantity(dec!(10.5)).is_err());
    }

    #[test]
    fn rounds_price_to_tick() {
        let i = info();
        assert_eq!(i.round_price(dec!(4000.004)), dec!(4000.00));
        assert_eq!(i.round_price(dec!(3978.615)), dec!(3978.62));
    }

    #[test]
    fn symbol_normalization_is_idempotent() {
        let once = normalize_symbol("ethusdt.P");
        let twice = normalize_symbol(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "ETHUSDT");
    }

    #[test]
    fn extracts_quote_currency() {
        assert_eq!(quote_currency("ETHUSDT.P"), Some("USDT"));
        assert_eq!(quote_currency("BTCUSDC"), Some("USDC"));
        assert_eq!(quote_currency("ETHBTC"), None);
    }
}
