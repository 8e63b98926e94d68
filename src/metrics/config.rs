//! Metrics settings: risk-free rate, heuristic thresholds and report grading.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Annual risk-free rate used by Sharpe and Sortino.
    pub risk_free_rate: f64,
    pub heuristics: HeuristicsConfig,
    pub grading: GradingConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            heuristics: HeuristicsConfig::default(),
            grading: GradingConfig::default(),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.risk_free_rate.is_finite() || self.risk_free_rate.abs() > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "risk_free_rate must be a fraction, got {}",
                self.risk_free_rate
            )));
        }
        self.heuristics.validate()?;
        self.grading.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Drawdown periods shallower than this are not listed.
    pub min_drawdown_depth: f64,
    /// Daily returns within this band of zero do not extend a losing streak.
    pub flat_day_tolerance: f64,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            min_drawdown_depth: 0.0,
            flat_day_tolerance: 0.0,
        }
    }
}

impl HeuristicsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let ok = |v: f64| v.is_finite() && (0.0..1.0).contains(&v);
        if !ok(self.min_drawdown_depth) || !ok(self.flat_day_tolerance) {
            return Err(ConfigError::Invalid(
                "heuristic thresholds must be fractions in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

/// Weights and targets for the letter grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    pub return_weight: f64,
    pub risk_weight: f64,
    pub consistency_weight: f64,
    /// Annualized return that earns a full return score.
    pub annual_return_target: f64,
    /// Drawdown depth at which the risk score reaches zero.
    pub max_drawdown_tolerance: f64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            return_weight: 0.40,
            risk_weight: 0.35,
            consistency_weight: 0.25,
            annual_return_target: 0.20,
            max_drawdown_tolerance: 0.15,
        }
    }
}

impl GradingConfig {
    pub fn total_weight(&self) -> f64 {
        self.return_weight + self.risk_weight + self.consistency_weight
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let weights = [self.return_weight, self.risk_weight, self.consistency_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || self.total_weight() <= 0.0 {
            return Err(ConfigError::Invalid(
                "grading weights must be non-negative with a positive sum".into(),
            ));
        }
        if !(self.annual_return_target > 0.0) || !(self.max_drawdown_tolerance > 0.0) {
            return Err(ConfigError::Invalid(
                "grading targets must be positive".into(),
            ));
        }
        Ok(())
    }
}
