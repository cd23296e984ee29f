use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading symbol, e.g. `"BTCUSDT"`.
///
/// Kept as a thin newtype over `String` rather than a struct with
/// exchange/asset-class metadata: this engine is exchange-agnostic, the
/// exchange is selected by `exchangeName` at the strategy/schema level, not
/// encoded into the symbol itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single OHLC candle used by the backtest fast-forward walk and the
/// exchange client's VWAP computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Volume-weighted average of the candle's typical price, used as a
    /// single-candle approximation of VWAP when the exchange client has no
    /// richer tick data available.
    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_display_roundtrip() {
        let symbol = Symbol::new("BTCUSDT");
        assert_eq!(symbol.to_string(), "BTCUSDT");
        assert_eq!(symbol.as_str(), "BTCUSDT");
    }

    #[test]
    fn symbol_ordering_is_lexicographic() {
        let a = Symbol::new("AAA");
        let b = Symbol::new("BBB");
        assert!(a < b);
    }

    #[test]
    fn candle_typical_price() {
        let candle = Candle::new(Utc::now(), dec!(100), dec!(112), dec!(99), dec!(105), dec!(1000));
        let expected = (dec!(112) + dec!(99) + dec!(105)) / dec!(3);
        assert_eq!(candle.typical_price(), expected);
    }
}
