pub mod backtest;
pub mod config;
pub mod data;
pub mod metrics;
pub mod pricing;
pub mod regime;
pub mod report;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use backtest::{BacktestEngine, BacktestResult, DailyEquityRecord, Position, Trade};
pub use config::{BacktestConfig, ConfigError};
pub use data::{BarLoader, DailyBar, InMemoryMarketData, MarketDataSource, OptionType};
pub use metrics::{MetricsCalculator, PerformanceMetrics, PerformanceReport};
pub use pricing::PricingEstimator;
pub use regime::{RegimeClassifier, VolatilityRegime};
pub use risk::{AccountState, CorrelationTracker};
pub use strategy::{RuleAnalyzer, StrategyAnalyzer, StrategyKind, StrategyRules};
