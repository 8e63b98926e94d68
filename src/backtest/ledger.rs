//! Position ledger.
//!
//! Owns everything a run mutates about its book: realized capital, buying
//! power, correlation-group counters, open positions and the trade history.
//! Admission is all-or-nothing: a rejected candidate leaves the ledger
//! exactly as it was.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::regime::VolatilityRegime;
use crate::risk::{AccountState, CorrelationTracker, PhaseConfig};
use crate::strategy::EntrySignal;

use super::trade::{ExitReason, Position, PositionError, Trade};

/// Why a candidate was not admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    InsufficientBuyingPower {
        required: Decimal,
        available: Decimal,
    },
    MaxPositions {
        limit: usize,
    },
    CorrelationLimit {
        group: String,
        limit: usize,
    },
    UnmappedSymbol(String),
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(u64),
    Rejected(RejectionReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Rejection counters for the run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub buying_power: usize,
    pub max_positions: usize,
    pub correlation: usize,
}

impl RejectionCounts {
    fn record(&mut self, reason: &RejectionReason) {
        match reason {
            RejectionReason::InsufficientBuyingPower { .. } => self.buying_power += 1,
            RejectionReason::MaxPositions { .. } => self.max_positions += 1,
            RejectionReason::CorrelationLimit { .. } | RejectionReason::UnmappedSymbol(_) => {
                self.correlation += 1
            }
        }
    }

    pub fn total(&self) -> usize {
        self.buying_power + self.max_positions + self.correlation
    }
}

/// Book of one run.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    account: AccountState,
    correlation: CorrelationTracker,
    max_positions: usize,
    open: Vec<Position>,
    trades: Vec<Trade>,
    next_id: u64,
    rejections: RejectionCounts,
}

impl PositionLedger {
    pub fn new(
        initial_capital: Decimal,
        phases: &PhaseConfig,
        correlation: CorrelationTracker,
        max_positions: usize,
    ) -> Self {
        Self {
            account: AccountState::new(initial_capital, phases),
            correlation,
            max_positions,
            open: Vec::new(),
            trades: Vec::new(),
            next_id: 1,
            rejections: RejectionCounts::default(),
        }
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    /// Refresh phase and regime at the start of a day. Returns true when the
    /// phase changed.
    pub fn begin_day(
        &mut self,
        phases: &PhaseConfig,
        regime: VolatilityRegime,
        bp_usage: f64,
    ) -> bool {
        self.account.set_regime(regime, bp_usage);
        self.account.update_phase(phases)
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.open
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn rejections(&self) -> &RejectionCounts {
        &self.rejections
    }

    pub fn correlation(&self) -> &CorrelationTracker {
        &self.correlation
    }

    /// Whether another entry is worth evaluating at all.
    pub fn can_add_position(&self) -> bool {
        self.open.len() < self.max_positions && self.account.available_bp() > Decimal::ZERO
    }

    /// Mark-to-market equity: realized capital plus open P&L.
    pub fn equity(&self) -> Decimal {
        self.account.capital + self.open.iter().map(|p| p.unrealized_pnl()).sum::<Decimal>()
    }

    /// Check a candidate against buying power, the position cap and its
    /// correlation group, in that order, and book it if all pass.
    pub fn try_open(
        &mut self,
        signal: &EntrySignal,
        date: NaiveDate,
    ) -> Result<Admission, PositionError> {
        let position = Position::from_signal(self.next_id, signal, date)?;

        if let Err(reason) = self.check_admission(&position) {
            debug!(
                symbol = position.symbol.as_str(),
                strategy = %position.strategy,
                ?reason,
                "entry rejected"
            );
            self.rejections.record(&reason);
            return Ok(Admission::Rejected(reason));
        }

        let id = position.id;
        self.next_id += 1;
        self.account.used_bp += position.capital_required;
        if let Some(group) = self.correlation.group_of(&position.symbol).map(str::to_string) {
            self.correlation.increment(&group);
        }
        debug!(
            id,
            symbol = position.symbol.as_str(),
            strategy = %position.strategy,
            capital = %position.capital_required,
            "position opened"
        );
        self.open.push(position);
        Ok(Admission::Admitted(id))
    }

    fn check_admission(&self, position: &Position) -> Result<(), RejectionReason> {
        let available = self.account.available_bp();
        if position.capital_required > available {
            return Err(RejectionReason::InsufficientBuyingPower {
                required: position.capital_required,
                available,
            });
        }
        if self.open.len() >= self.max_positions {
            return Err(RejectionReason::MaxPositions {
                limit: self.max_positions,
            });
        }
        let group = self
            .correlation
            .group_of(&position.symbol)
            .ok_or_else(|| RejectionReason::UnmappedSymbol(position.symbol.clone()))?;
        if !self.correlation.has_capacity(group) {
            return Err(RejectionReason::CorrelationLimit {
                group: group.to_string(),
                limit: self.correlation.limit(),
            });
        }
        Ok(())
    }

    /// Update the mark of an open position.
    pub fn mark(&mut self, id: u64, closing_value: Decimal) -> Result<(), PositionError> {
        let position = self
            .open
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(PositionError::NotFound(id))?;
        position.mark(closing_value);
        Ok(())
    }

    /// Close an open position, realize its P&L and release its buying power
    /// and group slot.
    pub fn close(
        &mut self,
        id: u64,
        date: NaiveDate,
        exit_value: Decimal,
        reason: ExitReason,
    ) -> Result<Trade, PositionError> {
        let idx = self
            .open
            .iter()
            .position(|p| p.id == id)
            .ok_or(PositionError::NotFound(id))?;

        let trade = self.open[idx].close(date, exit_value, reason)?;
        let position = self.open.remove(idx);

        self.account.capital += trade.pnl;
        self.account.used_bp = (self.account.used_bp - position.capital_required).max(Decimal::ZERO);
        if let Some(group) = self.correlation.group_of(&position.symbol).map(str::to_string) {
            self.correlation.decrement(&group);
        }

        debug!(
            id,
            symbol = trade.symbol.as_str(),
            reason = ?trade.exit_reason,
            pnl = %trade.pnl,
            "position closed"
        );
        self.trades.push(trade.clone());
        Ok(trade)
    }

    /// Consume the ledger, returning the trade history and final account.
    pub fn into_parts(self) -> (Vec<Trade>, AccountState) {
        (self.trades, self.account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::trade::{PositionLeg, Structure};
    use crate::data::OptionType;
    use crate::risk::default_groups;
    use crate::strategy::StrategyKind;
    use rust_decimal_macros::dec;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn signal(symbol: &str, capital: Decimal) -> EntrySignal {
        let expiration = d(29);
        EntrySignal {
            strategy: StrategyKind::Lt112,
            symbol: symbol.to_string(),
            structure: Structure::Vertical,
            legs: vec![
                PositionLeg::new(OptionType::Put, 95.0, expiration, -1),
                PositionLeg::new(OptionType::Put, 90.0, expiration, 1),
            ],
            expiration,
            contracts: 1,
            entry_value_per_contract: dec!(100),
            capital_per_contract: capital,
            max_loss_per_contract: capital,
            underlying_price: 100.0,
            roll_count: 0,
        }
    }

    fn ledger(correlation_limit: usize, max_positions: usize) -> PositionLedger {
        let phases = PhaseConfig::default();
        let tracker = CorrelationTracker::new(&default_groups(), correlation_limit).unwrap();
        let mut ledger = PositionLedger::new(dec!(50_000), &phases, tracker, max_positions);
        // Ceiling: 50k * 0.5 * 0.9 = 22.5k
        ledger.begin_day(&phases, VolatilityRegime::Low, 0.5);
        ledger
    }

    #[test]
    fn test_same_group_limit() {
        let mut ledger = ledger(1, 10);
        let first = ledger.try_open(&signal("SPY", dec!(400)), d(4)).unwrap();
        let second = ledger.try_open(&signal("QQQ", dec!(400)), d(4)).unwrap();

        assert_eq!(first, Admission::Admitted(1));
        assert_eq!(
            second,
            Admission::Rejected(RejectionReason::CorrelationLimit {
                group: "equities".to_string(),
                limit: 1
            })
        );
        assert_eq!(ledger.correlation().open_count("equities"), 1);
        assert_eq!(ledger.open_count(), 1);
        assert_eq!(ledger.rejections().correlation, 1);

        // A different group still has room.
        assert!(ledger.try_open(&signal("MCL", dec!(400)), d(4)).unwrap().is_admitted());
    }

    #[test]
    fn test_buying_power_checked_first() {
        let mut ledger = ledger(1, 1);
        ledger.try_open(&signal("SPY", dec!(20_000)), d(4)).unwrap();
        let account_before = ledger.account().clone();

        // Violates all three limits; buying power is reported.
        let outcome = ledger.try_open(&signal("QQQ", dec!(3_000)), d(4)).unwrap();
        assert_eq!(
            outcome,
            Admission::Rejected(RejectionReason::InsufficientBuyingPower {
                required: dec!(3_000),
                available: dec!(2_500),
            })
        );
        assert_eq!(ledger.account(), &account_before);
        assert!(ledger.account().used_bp <= ledger.account().ceiling());
    }

    #[test]
    fn test_used_bp_never_exceeds_ceiling() {
        let mut ledger = ledger(10, 100);
        for day in 4..9 {
            for symbol in ["SPY", "MCL", "MGC", "TLT"] {
                ledger.try_open(&signal(symbol, dec!(1_700)), d(day)).unwrap();
                assert!(ledger.account().used_bp <= ledger.account().ceiling());
            }
        }
        assert_eq!(ledger.open_count(), 13);
        assert!(!ledger.try_open(&signal("SPY", dec!(1_700)), d(11)).unwrap().is_admitted());
    }

    #[test]
    fn test_close_releases_capacity() {
        let mut ledger = ledger(1, 10);
        let Admission::Admitted(id) = ledger.try_open(&signal("SPY", dec!(400)), d(4)).unwrap() else {
            panic!("expected admission");
        };
        assert_eq!(ledger.account().used_bp, dec!(400));

        let trade = ledger.close(id, d(8), dec!(-30), ExitReason::ProfitTarget).unwrap();
        assert_eq!(trade.pnl, dec!(70));
        assert_eq!(ledger.account().capital, dec!(50_070));
        assert_eq!(ledger.account().used_bp, Decimal::ZERO);
        assert_eq!(ledger.correlation().open_count("equities"), 0);
        assert_eq!(ledger.trades().len(), 1);

        assert_eq!(
            ledger.close(id, d(9), Decimal::ZERO, ExitReason::EndOfPeriod),
            Err(PositionError::NotFound(id))
        );
    }

    #[test]
    fn test_ids_are_per_ledger() {
        let mut a = ledger(5, 10);
        let mut b = ledger(5, 10);
        assert_eq!(a.try_open(&signal("SPY", dec!(100)), d(4)).unwrap(), Admission::Admitted(1));
        assert_eq!(b.try_open(&signal("SPY", dec!(100)), d(4)).unwrap(), Admission::Admitted(1));
        // Rejections do not consume ids.
        a.try_open(&signal("SPY", dec!(1_000_000)), d(4)).unwrap();
        assert_eq!(a.try_open(&signal("QQQ", dec!(100)), d(4)).unwrap(), Admission::Admitted(2));
    }

    #[test]
    fn test_equity_includes_open_pnl() {
        let mut ledger = ledger(5, 10);
        let Admission::Admitted(id) = ledger.try_open(&signal("SPY", dec!(400)), d(4)).unwrap() else {
            panic!("expected admission");
        };
        assert_eq!(ledger.equity(), dec!(50_000));
        ledger.mark(id, dec!(-160)).unwrap();
        assert_eq!(ledger.equity(), dec!(49_940));
    }
}
