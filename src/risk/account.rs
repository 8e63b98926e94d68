//! Account state and capital phases.
//!
//! The account moves through capital tiers ("phases"). The phase decides
//! which strategies are permitted, how many contracts they trade and a
//! multiplier on the buying-power ceiling. The ceiling itself is
//! `capital x regime usage x phase multiplier`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::regime::VolatilityRegime;

/// Capital tier boundaries and per-phase buying-power multipliers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Lower capital bound of each phase, ascending. Phase `n` starts at
    /// `boundaries[n - 1]`; capital below the first bound stays in phase 1.
    pub boundaries: Vec<Decimal>,
    /// Buying-power multiplier per phase, one entry per boundary.
    pub bp_multipliers: Vec<f64>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            boundaries: vec![
                Decimal::from(30_000),
                Decimal::from(40_000),
                Decimal::from(60_000),
                Decimal::from(75_000),
            ],
            bp_multipliers: vec![0.8, 0.9, 1.0, 1.0],
        }
    }
}

impl PhaseConfig {
    /// Phase for a capital level, in `1..=max_phase()`.
    pub fn phase_for(&self, capital: Decimal) -> u8 {
        let reached = self.boundaries.iter().filter(|b| capital >= **b).count();
        reached.clamp(1, self.max_phase() as usize) as u8
    }

    pub fn max_phase(&self) -> u8 {
        self.boundaries.len().clamp(1, u8::MAX as usize) as u8
    }

    /// Buying-power multiplier for a phase; phases past the table reuse the
    /// last entry.
    pub fn multiplier(&self, phase: u8) -> f64 {
        let idx = (phase.max(1) - 1) as usize;
        self.bp_multipliers
            .get(idx)
            .or_else(|| self.bp_multipliers.last())
            .copied()
            .unwrap_or(1.0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.boundaries.is_empty() {
            return Err(ConfigError::InvalidPhases("no phase boundaries".into()));
        }
        if self.boundaries.iter().any(|b| *b <= Decimal::ZERO) {
            return Err(ConfigError::InvalidPhases(
                "boundaries must be positive".into(),
            ));
        }
        if !self.boundaries.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConfigError::InvalidPhases(
                "boundaries must be strictly ascending".into(),
            ));
        }
        if self.bp_multipliers.len() != self.boundaries.len() {
            return Err(ConfigError::InvalidPhases(format!(
                "{} multipliers for {} phases",
                self.bp_multipliers.len(),
                self.boundaries.len()
            )));
        }
        if self
            .bp_multipliers
            .iter()
            .any(|m| !m.is_finite() || *m <= 0.0 || *m > 1.0)
        {
            return Err(ConfigError::InvalidPhases(
                "multipliers must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Live account state for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    /// Realized capital (initial capital plus closed-trade P&L).
    pub capital: Decimal,
    /// Current capital phase.
    pub phase: u8,
    /// Current volatility regime.
    pub regime: VolatilityRegime,
    /// Fraction of capital usable in the current regime.
    pub regime_bp_usage: f64,
    /// Multiplier for the current phase.
    pub phase_multiplier: f64,
    /// Sum of `capital_required` over open positions.
    pub used_bp: Decimal,
}

impl AccountState {
    pub fn new(capital: Decimal, phases: &PhaseConfig) -> Self {
        let phase = phases.phase_for(capital);
        Self {
            capital,
            phase,
            regime: VolatilityRegime::Normal,
            regime_bp_usage: 0.0,
            phase_multiplier: phases.multiplier(phase),
            used_bp: Decimal::ZERO,
        }
    }

    /// Recompute the phase from current capital.
    pub fn update_phase(&mut self, phases: &PhaseConfig) -> bool {
        let phase = phases.phase_for(self.capital);
        let changed = phase != self.phase;
        self.phase = phase;
        self.phase_multiplier = phases.multiplier(phase);
        changed
    }

    pub fn set_regime(&mut self, regime: VolatilityRegime, bp_usage: f64) {
        self.regime = regime;
        self.regime_bp_usage = bp_usage;
    }

    /// Buying-power ceiling for the current phase and regime.
    pub fn ceiling(&self) -> Decimal {
        let fraction = Decimal::try_from(self.regime_bp_usage * self.phase_multiplier)
            .unwrap_or(Decimal::ZERO);
        (self.capital.max(Decimal::ZERO) * fraction).round_dp(2)
    }

    /// Buying power still available; never negative.
    pub fn available_bp(&self) -> Decimal {
        (self.ceiling() - self.used_bp).max(Decimal::ZERO)
    }
}
