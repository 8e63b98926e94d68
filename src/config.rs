//! Backtest configuration.
//!
//! One TOML file describes a complete run: starting capital, the capital
//! phase schedule, VIX bands, session checkpoints, correlation groups, the
//! strategy rule tables and the metrics settings. Every section has a
//! default, so an empty file is a valid configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricsConfig;
use crate::pricing::PricingEstimator;
use crate::regime::RegimeConfig;
use crate::risk::{default_groups, CorrelationGroupConfig, CorrelationTracker, PhaseConfig};
use crate::strategy::{StrategyKind, StrategyRules};

/// Fatal configuration problems, reported before any simulation starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Strategy configured twice: {0}")]
    DuplicateStrategy(StrategyKind),

    #[error("Invalid date range: {start} is after {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Symbol {0} is not mapped to any correlation group")]
    UnmappedSymbol(String),

    #[error("Symbol {symbol} is in both {first} and {second}")]
    DuplicateSymbol {
        symbol: String,
        first: String,
        second: String,
    },

    #[error("Invalid phase schedule: {0}")]
    InvalidPhases(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Intraday instants at which the engine acts.
///
/// Bars are daily, so `open` and `entry` read the bar's open price and
/// `defense` and `close` read its close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Management of existing positions.
    pub open: NaiveTime,
    /// New entries.
    pub entry: NaiveTime,
    /// Time-based defense for same-day structures.
    pub defense: NaiveTime,
    /// Session close; expirations settle here.
    pub close: NaiveTime,
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: hm(9, 30),
            entry: hm(10, 30),
            defense: hm(15, 0),
            close: hm(16, 0),
        }
    }
}

impl SessionConfig {
    pub fn is_ordered(&self) -> bool {
        self.open <= self.entry && self.entry <= self.defense && self.defense <= self.close
    }
}

/// Complete configuration for one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Display name for reports.
    pub name: String,

    /// Starting capital.
    pub initial_capital: Decimal,

    /// Maximum number of simultaneously open positions.
    pub max_positions: usize,

    /// Maximum open positions per correlation group.
    pub correlation_limit: usize,

    /// Symbol whose close is read as the day's VIX level.
    pub vix_symbol: String,

    pub phases: PhaseConfig,

    pub regime: RegimeConfig,

    pub session: SessionConfig,

    pub pricing: PricingEstimator,

    pub correlation_groups: Vec<CorrelationGroupConfig>,

    /// Strategy rule tables, evaluated in this order each day.
    pub strategies: Vec<StrategyRules>,

    pub metrics: MetricsConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            initial_capital: Decimal::from(35_000),
            max_positions: 10,
            correlation_limit: 3,
            vix_symbol: "VIX".to_string(),
            phases: PhaseConfig::default(),
            regime: RegimeConfig::default(),
            session: SessionConfig::default(),
            pricing: PricingEstimator::default(),
            correlation_groups: default_groups(),
            strategies: StrategyKind::ALL
                .iter()
                .map(|k| StrategyRules::defaults(*k))
                .collect(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl BacktestConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file. The result is not yet validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Check everything that does not depend on the run's symbols.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "initial_capital must be positive".into(),
            ));
        }
        if self.max_positions == 0 {
            return Err(ConfigError::Invalid("max_positions must be > 0".into()));
        }
        if self.correlation_limit == 0 {
            return Err(ConfigError::Invalid("correlation_limit must be > 0".into()));
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::Invalid("no strategies configured".into()));
        }
        if !self.regime.is_valid() {
            return Err(ConfigError::Invalid(
                "VIX thresholds must be ascending and usages in (0, 1]".into(),
            ));
        }
        if !self.session.is_ordered() {
            return Err(ConfigError::Invalid(
                "session checkpoints must be in chronological order".into(),
            ));
        }
        if !(self.pricing.rate.is_finite() && self.pricing.min_credit >= 0.0) {
            return Err(ConfigError::Invalid("invalid pricing parameters".into()));
        }

        self.phases.validate()?;

        let mut seen = HashSet::new();
        for rules in &self.strategies {
            if !seen.insert(rules.kind()) {
                return Err(ConfigError::DuplicateStrategy(rules.kind()));
            }
            rules.validate()?;
        }

        // Builds the symbol map, which rejects symbols listed twice.
        self.correlation_tracker()?;
        self.metrics.validate()?;

        Ok(())
    }

    /// Check that every traded symbol has a correlation group.
    pub fn validate_symbols(&self, symbols: &[String]) -> Result<(), ConfigError> {
        if symbols.is_empty() {
            return Err(ConfigError::Invalid("no symbols to trade".into()));
        }
        let tracker = self.correlation_tracker()?;
        tracker.ensure_mapped(symbols)?;
        for rules in &self.strategies {
            tracker.ensure_mapped(&rules.entry().symbols)?;
        }
        Ok(())
    }

    pub fn correlation_tracker(&self) -> Result<CorrelationTracker, ConfigError> {
        CorrelationTracker::new(&self.correlation_groups, self.correlation_limit)
    }

    pub fn strategy(&self, kind: StrategyKind) -> Option<&StrategyRules> {
        self.strategies.iter().find(|r| r.kind() == kind)
    }

    /// Symbols the configured strategies can trade: every explicitly listed
    /// symbol, or every correlation-group symbol when a strategy lists none.
    pub fn traded_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = if self.strategies.iter().any(|r| r.entry().symbols.is_empty()) {
            self.correlation_groups
                .iter()
                .flat_map(|g| g.symbols.iter().cloned())
                .collect()
        } else {
            self.strategies
                .iter()
                .flat_map(|r| r.entry().symbols.iter().cloned())
                .collect()
        };
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Keep only the named strategies, in configuration order. Names accept
    /// the aliases `StrategyKind` parses ("0dte", "lt-112", ...).
    pub fn retain_strategies<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), ConfigError> {
        let kinds = names
            .iter()
            .map(|n| n.as_ref().parse::<StrategyKind>())
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(missing) = kinds.iter().find(|k| self.strategy(**k).is_none()) {
            return Err(ConfigError::Invalid(format!(
                "strategy {} is not configured",
                missing
            )));
        }
        self.strategies.retain(|r| kinds.contains(&r.kind()));
        Ok(())
    }
}
