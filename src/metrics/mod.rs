//! Performance metrics module.
//!
//! Provides performance calculations over a finished run:
//! - Trade statistics and per-strategy breakdown
//! - Sharpe, Sortino and Calmar ratios
//! - Historical VaR and CVaR
//! - Drawdown series and periods
//! - Monthly, quarterly and yearly returns
//! - A weighted letter grade

pub mod calculator;
pub mod config;
pub mod grading;

pub use calculator::{
    safe_ratio, DrawdownPeriod, DrawdownPoint, MetricsCalculator, PerformanceMetrics,
    PeriodReturn, StrategyBreakdown, RATIO_CAP, TRADING_DAYS_PER_YEAR,
};
pub use config::{GradingConfig, HeuristicsConfig, MetricsConfig};
pub use grading::{summary, Grade, PerformanceReport};
