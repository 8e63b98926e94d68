//! Core market data types for the backtester.
//!
//! A run consumes one `DailyBar` per symbol per trading day. The engine wraps
//! each bar into a `MarketSnapshot` carrying the day's VIX level and the
//! symbol's previous close so strategy rules can read everything they need
//! from a single value.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Option type (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "C",
            Self::Put => "P",
        }
    }

    /// Intrinsic value per share at the given spot.
    pub fn intrinsic(&self, spot: f64, strike: f64) -> f64 {
        match self {
            Self::Call => (spot - strike).max(0.0),
            Self::Put => (strike - spot).max(0.0),
        }
    }
}

/// Daily OHLC bar for an underlying, with its implied volatility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    /// Annualized implied volatility as a fraction (0.18 = 18%).
    pub implied_volatility: f64,
}

impl DailyBar {
    /// Bar with identical open/high/low/close, mostly useful for tests and
    /// synthetic series.
    pub fn flat(price: f64, implied_volatility: f64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            implied_volatility,
        }
    }

    /// Whether every price field is finite and positive.
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.implied_volatility.is_finite()
            && self.implied_volatility >= 0.0
    }
}

/// Which price of the bar a session checkpoint reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    Open,
    Close,
}

/// Everything known about one symbol on one trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Underlying symbol (e.g., "SPY", "MES")
    pub symbol: String,

    /// Trading date
    pub date: NaiveDate,

    /// The day's bar
    pub bar: DailyBar,

    /// VIX level for the day
    pub vix: f64,

    /// Close of the last trading day this symbol had data for
    pub previous_close: Option<f64>,
}

impl MarketSnapshot {
    pub fn new(symbol: &str, date: NaiveDate, bar: DailyBar, vix: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            date,
            bar,
            vix,
            previous_close: None,
        }
    }

    /// Price for a checkpoint.
    pub fn price(&self, field: PriceField) -> f64 {
        match field {
            PriceField::Open => self.bar.open,
            PriceField::Close => self.bar.close,
        }
    }

    /// Implied volatility with a floor so pricing never sees zero vol.
    pub fn volatility(&self) -> f64 {
        self.bar.implied_volatility.max(0.01)
    }

    /// Overnight gap direction: positive when the session opened above the
    /// previous close.
    pub fn opening_gap(&self) -> Option<f64> {
        self.previous_close
            .filter(|p| *p > 0.0)
            .map(|p| (self.bar.open - p) / p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsic() {
        assert_eq!(OptionType::Call.intrinsic(105.0, 100.0), 5.0);
        assert_eq!(OptionType::Call.intrinsic(95.0, 100.0), 0.0);
        assert_eq!(OptionType::Put.intrinsic(95.0, 100.0), 5.0);
    }

    #[test]
    fn test_opening_gap() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut bar = DailyBar::flat(100.0, 0.2);
        bar.open = 101.0;
        let mut snap = MarketSnapshot::new("SPY", date, bar, 15.0);
        assert_eq!(snap.opening_gap(), None);

        snap.previous_close = Some(100.0);
        assert!((snap.opening_gap().unwrap() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_bar_validity() {
        assert!(DailyBar::flat(100.0, 0.2).is_valid());
        assert!(!DailyBar::flat(f64::NAN, 0.2).is_valid());
        assert!(!DailyBar::flat(0.0, 0.2).is_valid());
    }
}
