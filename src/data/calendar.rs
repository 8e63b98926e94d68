//! Trading calendar.
//!
//! Weekdays between two inclusive bounds. Exchange holidays are not modelled
//! here; a holiday simply shows up as a day without market data and is
//! skipped by the engine.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

use crate::config::ConfigError;

/// Immutable list of trading days for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradingCalendar {
    days: Vec<NaiveDate>,
}

impl TradingCalendar {
    /// Build the calendar for `start..=end`, excluding weekends.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::InvalidDateRange { start, end });
        }

        let days = start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| is_trading_weekday(d.weekday()))
            .collect();

        Ok(Self { days })
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

pub fn is_trading_weekday(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Sat | Weekday::Sun)
}

/// Roll a weekend date forward to the following Monday.
pub fn roll_to_weekday(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date + chrono::Duration::days(2),
        Weekday::Sun => date + chrono::Duration::days(1),
        _ => date,
    }
}

/// Fractional calendar days from `as_of` until the session close of
/// `expiration`. Zero or negative once the expiration close has passed.
pub fn fractional_dte(as_of: NaiveDateTime, expiration: NaiveDate, session_close: NaiveTime) -> f64 {
    let settle = expiration.and_time(session_close);
    (settle - as_of).num_seconds() as f64 / 86_400.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_excludes_weekends() {
        // Fri 2024-03-01 through Tue 2024-03-05
        let cal = TradingCalendar::new(d(2024, 3, 1), d(2024, 3, 5)).unwrap();
        assert_eq!(cal.days(), &[d(2024, 3, 1), d(2024, 3, 4), d(2024, 3, 5)]);
    }

    #[test]
    fn test_single_weekend_day_is_empty() {
        let cal = TradingCalendar::new(d(2024, 3, 2), d(2024, 3, 2)).unwrap();
        assert!(cal.is_empty());
    }

    #[test]
    fn test_inverted_range_is_config_error() {
        let err = TradingCalendar::new(d(2024, 3, 5), d(2024, 3, 1)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDateRange { .. }));
    }

    #[test]
    fn test_roll_to_weekday() {
        assert_eq!(roll_to_weekday(d(2024, 3, 8)), d(2024, 3, 8));
        assert_eq!(roll_to_weekday(d(2024, 3, 9)), d(2024, 3, 11));
        assert_eq!(roll_to_weekday(d(2024, 3, 10)), d(2024, 3, 11));
    }

    #[test]
    fn test_fractional_dte() {
        let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        let entry = d(2024, 3, 8).and_hms_opt(10, 30, 0).unwrap();
        let dte = fractional_dte(entry, d(2024, 3, 8), close);
        assert!((dte - 5.5 / 24.0).abs() < 1e-9);

        let at_close = d(2024, 3, 8).and_time(close);
        assert_eq!(fractional_dte(at_close, d(2024, 3, 8), close), 0.0);
        assert_eq!(fractional_dte(at_close, d(2024, 3, 9), close), 1.0);
    }
}
