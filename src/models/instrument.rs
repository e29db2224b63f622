//! Instrument metadata: pip size and broker price precision.

use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Crosses the broker quotes with three decimals.
const THREE_DECIMAL_PAIRS: [&str; 8] = [
    "USD_JPY", "EUR_JPY", "GBP_JPY", "AUD_JPY", "NZD_JPY", "CAD_JPY", "CHF_JPY", "SGD_JPY",
];

const DEFAULT_PRECISION: u32 = 5;

/// A currency pair in broker notation, e.g. `USD_JPY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    /// Create an instrument, normalizing `usd/jpy` style input to `USD_JPY`.
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self(name.trim().to_uppercase().replace('/', "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the quote currency is JPY.
    pub fn is_jpy_quoted(&self) -> bool {
        self.0.contains("JPY")
    }

    /// Smallest conventional price increment.
    pub fn pip_size(&self) -> Decimal {
        if self.is_jpy_quoted() {
            dec!(0.01)
        } else {
            dec!(0.0001)
        }
    }

    pub fn pip_size_f64(&self) -> f64 {
        self.pip_size().to_f64().unwrap_or(0.0001)
    }

    /// Number of decimals the broker accepts for prices and distances.
    pub fn price_precision(&self) -> u32 {
        if THREE_DECIMAL_PAIRS.contains(&self.0.as_str()) {
            3
        } else {
            DEFAULT_PRECISION
        }
    }

    /// Round a price half away from zero to the instrument precision.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.price_precision(), RoundingStrategy::MidpointAwayFromZero)
    }

    /// Format a price for transmission.
    pub fn format_price(&self, price: Decimal) -> WirePrice {
        let precision = self.price_precision() as usize;
        WirePrice(format!("{:.*}", precision, self.round_price(price)))
    }

    /// Format a pip distance (e.g. a trailing-stop distance) as a price delta.
    pub fn format_distance(&self, pips: f64) -> WirePrice {
        self.format_price(self.pips_to_price(pips).abs())
    }

    /// Convert a pip count into a price delta.
    pub fn pips_to_price(&self, pips: f64) -> Decimal {
        Decimal::try_from(pips).unwrap_or(Decimal::ZERO) * self.pip_size()
    }

    /// Convert a price delta into pips.
    pub fn price_to_pips(&self, delta: Decimal) -> f64 {
        (delta / self.pip_size()).to_f64().unwrap_or(0.0)
    }

    /// Convert a price-unit indicator value (ATR) into pips.
    pub fn value_to_pips(&self, value: f64) -> f64 {
        match Decimal::try_from(value) {
            Ok(v) => self.price_to_pips(v),
            Err(_) => 0.0,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A price or distance already rounded to the instrument's precision.
///
/// Only [`Instrument::format_price`] and [`Instrument::format_distance`]
/// construct it, so every value sent to the broker has passed through the
/// precision formatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WirePrice(String);

impl WirePrice {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into a decimal.
    pub fn to_decimal(&self) -> Decimal {
        self.0.parse().unwrap_or(Decimal::ZERO)
    }
}

impl fmt::Display for WirePrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pip_size_by_quote_currency() {
        assert_eq!(Instrument::new("USD_JPY").pip_size(), dec!(0.01));
        assert_eq!(Instrument::new("eur/jpy").pip_size(), dec!(0.01));
        assert_eq!(Instrument::new("EUR_USD").pip_size(), dec!(0.0001));
    }

    #[test]
    fn test_format_price_rounds_half_up() {
        let usd_jpy = Instrument::new("USD_JPY");
        assert_eq!(usd_jpy.format_price(dec!(150.1235)).as_str(), "150.124");
        assert_eq!(usd_jpy.format_price(dec!(150)).as_str(), "150.000");

        let eur_usd = Instrument::new("EUR_USD");
        assert_eq!(eur_usd.format_price(dec!(1.0850049)).as_str(), "1.08500");
        assert_eq!(eur_usd.format_price(dec!(1.085005)).as_str(), "1.08501");
    }

    #[test]
    fn test_format_distance() {
        let usd_jpy = Instrument::new("USD_JPY");
        assert_eq!(usd_jpy.format_distance(6.0).as_str(), "0.060");
        assert_eq!(usd_jpy.format_distance(-6.0).as_str(), "0.060");

        let gbp_usd = Instrument::new("GBP_USD");
        assert_eq!(gbp_usd.format_distance(12.5).as_str(), "0.00125");
    }

    #[test]
    fn test_pip_conversions() {
        let usd_jpy = Instrument::new("USD_JPY");
        assert_eq!(usd_jpy.price_to_pips(dec!(0.24)), 24.0);
        assert_eq!(usd_jpy.pips_to_price(10.0), dec!(0.10));
        assert!((usd_jpy.value_to_pips(0.20) - 20.0).abs() < 1e-9);
    }
}
