//! Volatility regime classifier.
//!
//! Maps the day's VIX level to one of a small number of bands. Each band
//! carries the fraction of capital that may be committed as buying power.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Volatility regime, ordered from calmest to most stressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityRegime {
    /// VIX below 12.
    VeryLow,
    /// VIX 12-15.
    Low,
    /// VIX 15-20.
    Normal,
    /// VIX 20-25.
    Elevated,
    /// VIX 25-30.
    High,
    /// VIX 30 and above.
    Extreme,
}

impl VolatilityRegime {
    pub const ALL: [VolatilityRegime; 6] = [
        Self::VeryLow,
        Self::Low,
        Self::Normal,
        Self::Elevated,
        Self::High,
        Self::Extreme,
    ];
}

/// VIX thresholds and buying-power usage per regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Upper VIX bound (exclusive) of each band below Extreme, ascending.
    pub vix_very_low: f64,
    pub vix_low: f64,
    pub vix_normal: f64,
    pub vix_elevated: f64,
    pub vix_high: f64,
    /// Fraction of capital usable as buying power, per regime, calmest first.
    pub bp_usage: [f64; 6],
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            vix_very_low: 12.0,
            vix_low: 15.0,
            vix_normal: 20.0,
            vix_elevated: 25.0,
            vix_high: 30.0,
            bp_usage: [0.45, 0.50, 0.55, 0.65, 0.75, 0.80],
        }
    }
}

impl RegimeConfig {
    /// Thresholds in ascending order.
    pub fn thresholds(&self) -> [f64; 5] {
        [
            self.vix_very_low,
            self.vix_low,
            self.vix_normal,
            self.vix_elevated,
            self.vix_high,
        ]
    }

    /// Whether thresholds ascend and usages are fractions in (0, 1].
    pub fn is_valid(&self) -> bool {
        let t = self.thresholds();
        t.windows(2).all(|w| w[0] < w[1])
            && self.bp_usage.iter().all(|u| u.is_finite() && *u > 0.0 && *u <= 1.0)
    }

    /// Buying-power usage fraction for a regime.
    pub fn bp_usage(&self, regime: VolatilityRegime) -> f64 {
        self.bp_usage[regime as usize]
    }
}

/// Regime classifier with per-run history.
pub struct RegimeClassifier {
    config: RegimeConfig,
    regime_history: Vec<(NaiveDate, VolatilityRegime)>,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            regime_history: Vec::new(),
        }
    }

    /// Band for a VIX level. Non-finite readings are treated as Extreme.
    pub fn regime_for(&self, vix: f64) -> VolatilityRegime {
        if !vix.is_finite() {
            return VolatilityRegime::Extreme;
        }
        let band = self
            .config
            .thresholds()
            .iter()
            .take_while(|t| vix >= **t)
            .count();
        VolatilityRegime::ALL[band]
    }

    /// Classify and record the day's regime.
    pub fn classify(&mut self, date: NaiveDate, vix: f64) -> VolatilityRegime {
        let regime = self.regime_for(vix);
        self.regime_history.push((date, regime));
        regime
    }

    /// Fraction of capital usable as buying power in this regime.
    pub fn bp_usage(&self, regime: VolatilityRegime) -> f64 {
        self.config.bp_usage(regime)
    }

    /// Days spent in each regime.
    pub fn days_by_regime(&self) -> BTreeMap<VolatilityRegime, usize> {
        let mut days = BTreeMap::new();
        for (_, regime) in &self.regime_history {
            *days.entry(*regime).or_insert(0) += 1;
        }
        days
    }
}
