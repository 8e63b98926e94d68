//! Market data source interface.
//!
//! The engine only needs one bar per symbol per day. Sources must be `Sync`
//! because the symbols of a single day are fetched concurrently.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use thiserror::Error;

use super::types::DailyBar;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("No data available for {symbol} on {date}")]
    Unavailable { symbol: String, date: NaiveDate },

    #[error("Invalid bar for {symbol} on {date}: {reason}")]
    InvalidBar {
        symbol: String,
        date: NaiveDate,
        reason: String,
    },
}

/// Read-only provider of daily bars.
pub trait MarketDataSource: Sync {
    fn daily_bar(&self, symbol: &str, date: NaiveDate) -> Result<DailyBar, DataError>;
}

/// Bars held in memory, keyed by symbol then date.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketData {
    bars: HashMap<String, BTreeMap<NaiveDate, DailyBar>>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, date: NaiveDate, bar: DailyBar) {
        self.bars
            .entry(symbol.to_string())
            .or_default()
            .insert(date, bar);
    }

    /// Insert a whole series for one symbol.
    pub fn insert_series<I>(&mut self, symbol: &str, series: I)
    where
        I: IntoIterator<Item = (NaiveDate, DailyBar)>,
    {
        let entry = self.bars.entry(symbol.to_string()).or_default();
        entry.extend(series);
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.bars.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Number of bars stored for a symbol.
    pub fn len(&self, symbol: &str) -> usize {
        self.bars.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.bars.values().all(|s| s.is_empty())
    }
}

impl MarketDataSource for InMemoryMarketData {
    fn daily_bar(&self, symbol: &str, date: NaiveDate) -> Result<DailyBar, DataError> {
        let bar = self
            .bars
            .get(symbol)
            .and_then(|series| series.get(&date))
            .ok_or_else(|| DataError::Unavailable {
                symbol: symbol.to_string(),
                date,
            })?;

        if !bar.is_valid() {
            return Err(DataError::InvalidBar {
                symbol: symbol.to_string(),
                date,
                reason: "non-finite or non-positive field".to_string(),
            });
        }

        Ok(bar.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bar_is_unavailable() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut data = InMemoryMarketData::new();
        data.insert("SPY", date, DailyBar::flat(470.0, 0.14));

        assert!(data.daily_bar("SPY", date).is_ok());
        assert_eq!(
            data.daily_bar("QQQ", date),
            Err(DataError::Unavailable {
                symbol: "QQQ".to_string(),
                date
            })
        );
    }

    #[test]
    fn test_invalid_bar_is_rejected() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut data = InMemoryMarketData::new();
        data.insert("SPY", date, DailyBar::flat(f64::NAN, 0.14));

        assert!(matches!(
            data.daily_bar("SPY", date),
            Err(DataError::InvalidBar { .. })
        ));
    }
}
