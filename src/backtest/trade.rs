//! Positions and closed trades.
//!
//! Handles the position lifecycle:
//! - Creation from an entry signal (risk invariants checked)
//! - Mark-to-market from per-leg estimated prices
//! - One-way close into a `Trade`
//!
//! Cash-flow convention: `entry_value` and `exit_value` are signed amounts
//! seen from the account, positive when received. A credit vertical sold
//! for 500 has `entry_value = 500`; buying it back for 120 is an
//! `exit_value` of -120, and realized P&L is `entry_value + exit_value`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::calendar::fractional_dte;
use crate::data::OptionType;
use crate::pricing::PricingEstimator;
use crate::strategy::{EntrySignal, StrategyKind};

/// Units of the underlying per option contract.
pub const CONTRACT_MULTIPLIER: f64 = 100.0;

/// Convert an f64 dollar amount to cents-rounded money.
pub(crate) fn money(value: f64) -> Decimal {
    if !value.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::try_from(value).unwrap_or(Decimal::ZERO).round_dp(2)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("Invalid risk for new position: capital {capital_required}, max loss {max_loss}")]
    InvalidRisk {
        capital_required: Decimal,
        max_loss: Decimal,
    },

    #[error("Position has no legs")]
    NoLegs,

    #[error("Position has zero contracts")]
    ZeroContracts,

    #[error("Position {0} is already closed")]
    AlreadyClosed(u64),

    #[error("No open position with id {0}")]
    NotFound(u64),
}

impl PositionError {
    /// Errors caused by the entry signal itself rather than ledger state.
    pub fn is_invalid_signal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRisk { .. } | Self::NoLegs | Self::ZeroContracts
        )
    }
}

/// Shape of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Structure {
    /// One short or long option.
    SingleLeg,
    /// Short and long option of the same type and expiration.
    Vertical,
    /// Short put and short call.
    Strangle,
    /// Long-dated long option against a shorter-dated short option.
    Calendar,
}

/// Reason for closing a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Settled at intrinsic value on the expiration date.
    Expiration,
    /// Loss reached the stop-loss multiple.
    StopLoss,
    /// Gain reached the profit target.
    ProfitTarget,
    /// Same-day structure in the money at the defense checkpoint.
    TimeDefense,
    /// Reached the management DTE untested.
    ManagementDte,
    /// Closed to be re-opened further out.
    Rolled,
    /// Closed to be replaced by a defined-risk structure.
    Converted,
    /// Still open when the backtest ended.
    EndOfPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One option leg. `quantity` is per structure unit; negative is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLeg {
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub quantity: i32,
}

impl PositionLeg {
    pub fn new(option_type: OptionType, strike: f64, expiration: NaiveDate, quantity: i32) -> Self {
        Self {
            option_type,
            strike,
            expiration,
            quantity,
        }
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0
    }

    /// Estimated price per share. Expired legs are worth their intrinsic value.
    pub fn price(
        &self,
        estimator: &PricingEstimator,
        spot: f64,
        vol: f64,
        as_of: NaiveDateTime,
        session_close: NaiveTime,
    ) -> f64 {
        let dte = fractional_dte(as_of, self.expiration, session_close);
        estimator.estimate_credit(spot, self.strike, dte, vol, self.option_type)
    }

    /// Whether the leg is in the money at `spot`.
    pub fn is_itm(&self, spot: f64) -> bool {
        match self.option_type {
            OptionType::Call => spot > self.strike,
            OptionType::Put => spot < self.strike,
        }
    }
}

/// An option position owned by a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Ledger-issued id, unique within one run.
    pub id: u64,
    /// Strategy that opened the position.
    pub strategy: StrategyKind,
    /// Underlying symbol.
    pub symbol: String,
    pub structure: Structure,
    pub legs: Vec<PositionLeg>,
    /// Expiration of the front (earliest) leg.
    pub expiration: NaiveDate,
    /// Number of structure units.
    pub contracts: u32,
    pub entry_date: NaiveDate,
    /// Signed entry cash flow (credit positive, debit negative).
    pub entry_value: Decimal,
    /// Buying power reserved while open.
    pub capital_required: Decimal,
    /// Worst-case loss.
    pub max_loss: Decimal,
    pub status: PositionStatus,
    /// Latest estimated closing cash flow.
    pub last_mark: Decimal,
    /// Times this position's lineage has been rolled.
    pub roll_count: u32,
}

impl Position {
    /// Create an open position from an entry signal.
    pub fn from_signal(
        id: u64,
        signal: &EntrySignal,
        entry_date: NaiveDate,
    ) -> Result<Self, PositionError> {
        if signal.legs.is_empty() {
            return Err(PositionError::NoLegs);
        }
        if signal.contracts == 0 {
            return Err(PositionError::ZeroContracts);
        }

        let contracts = Decimal::from(signal.contracts);
        let capital_required = signal.capital_per_contract * contracts;
        let max_loss = signal.max_loss_per_contract * contracts;
        if capital_required <= Decimal::ZERO || max_loss < Decimal::ZERO {
            return Err(PositionError::InvalidRisk {
                capital_required,
                max_loss,
            });
        }

        let entry_value = signal.entry_value_per_contract * contracts;
        Ok(Self {
            id,
            strategy: signal.strategy,
            symbol: signal.symbol.clone(),
            structure: signal.structure,
            legs: signal.legs.clone(),
            expiration: signal.expiration,
            contracts: signal.contracts,
            entry_date,
            entry_value,
            capital_required,
            max_loss,
            status: PositionStatus::Open,
            // Flat until the first mark.
            last_mark: -entry_value,
            roll_count: signal.roll_count,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Cash flow from closing every leg at estimated prices.
    pub fn closing_value(
        &self,
        estimator: &PricingEstimator,
        spot: f64,
        vol: f64,
        as_of: NaiveDateTime,
        session_close: NaiveTime,
    ) -> Decimal {
        let per_unit: f64 = self
            .legs
            .iter()
            .map(|leg| leg.quantity as f64 * leg.price(estimator, spot, vol, as_of, session_close))
            .sum();
        money(per_unit * self.contracts as f64 * CONTRACT_MULTIPLIER)
    }

    /// Record a new mark.
    pub fn mark(&mut self, closing_value: Decimal) {
        self.last_mark = closing_value;
    }

    /// P&L if the position were closed at the last mark.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.entry_value + self.last_mark
    }

    /// Premium the exit thresholds are measured against: the credit received
    /// or the debit paid.
    pub fn premium_basis(&self) -> Decimal {
        self.entry_value.abs()
    }

    /// Strike of the short leg of the given type, if any.
    pub fn short_strike(&self, option_type: OptionType) -> Option<f64> {
        self.legs
            .iter()
            .find(|l| l.is_short() && l.option_type == option_type)
            .map(|l| l.strike)
    }

    pub fn short_legs(&self) -> impl Iterator<Item = &PositionLeg> {
        self.legs.iter().filter(|l| l.is_short())
    }

    /// Close the position and produce its trade record.
    pub fn close(
        &mut self,
        exit_date: NaiveDate,
        exit_value: Decimal,
        reason: ExitReason,
    ) -> Result<Trade, PositionError> {
        if !self.is_open() {
            return Err(PositionError::AlreadyClosed(self.id));
        }
        self.status = PositionStatus::Closed;
        self.last_mark = exit_value;

        Ok(Trade {
            position_id: self.id,
            strategy: self.strategy,
            symbol: self.symbol.clone(),
            structure: self.structure,
            contracts: self.contracts,
            entry_date: self.entry_date,
            exit_date,
            entry_value: self.entry_value,
            exit_value,
            pnl: self.entry_value + exit_value,
            exit_reason: reason,
            holding_days: (exit_date - self.entry_date).num_days(),
            capital_required: self.capital_required,
            max_loss: self.max_loss,
            roll_count: self.roll_count,
        })
    }
}

/// A closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub position_id: u64,
    pub strategy: StrategyKind,
    pub symbol: String,
    pub structure: Structure,
    pub contracts: u32,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub entry_value: Decimal,
    pub exit_value: Decimal,
    /// `entry_value + exit_value`
    pub pnl: Decimal,
    pub exit_reason: ExitReason,
    pub holding_days: i64,
    pub capital_required: Decimal,
    pub max_loss: Decimal,
    pub roll_count: u32,
}

impl Trade {
    /// What the position cost to put on; negative for credits.
    pub fn cost_basis(&self) -> Decimal {
        -self.entry_value
    }

    pub fn is_winner(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn close_time() -> NaiveTime {
        NaiveTime::from_hms_opt(16, 0, 0).unwrap()
    }

    fn put_vertical_signal() -> EntrySignal {
        let expiration = d(2024, 3, 15);
        EntrySignal {
            strategy: StrategyKind::Lt112,
            symbol: "SPY".to_string(),
            structure: Structure::Vertical,
            legs: vec![
                PositionLeg::new(OptionType::Put, 95.0, expiration, -1),
                PositionLeg::new(OptionType::Put, 90.0, expiration, 1),
            ],
            expiration,
            contracts: 1,
            entry_value_per_contract: dec!(500),
            capital_per_contract: dec!(0.01),
            max_loss_per_contract: Decimal::ZERO,
            underlying_price: 100.0,
            roll_count: 0,
        }
    }

    #[test]
    fn test_credit_vertical_expires_worthless() {
        let mut position = Position::from_signal(1, &put_vertical_signal(), d(2024, 3, 1)).unwrap();
        assert_eq!(position.unrealized_pnl(), Decimal::ZERO);

        let at_expiry = d(2024, 3, 15).and_time(close_time());
        let exit_value = position.closing_value(
            &PricingEstimator::default(),
            100.0,
            0.2,
            at_expiry,
            close_time(),
        );
        assert_eq!(exit_value, Decimal::ZERO);

        let trade = position
            .close(d(2024, 3, 15), exit_value, ExitReason::Expiration)
            .unwrap();
        assert_eq!(trade.exit_value, Decimal::ZERO);
        assert_eq!(trade.pnl, dec!(500));
        assert_eq!(trade.pnl, trade.exit_value - trade.cost_basis());
        assert_eq!(trade.holding_days, 14);
    }

    #[test]
    fn test_itm_vertical_pays_intrinsic() {
        let mut signal = put_vertical_signal();
        signal.contracts = 2;
        let position = Position::from_signal(1, &signal, d(2024, 3, 1)).unwrap();
        let at_expiry = d(2024, 3, 15).and_time(close_time());
        // Spot 92: short 95 put worth 3, long 90 put worth 0.
        let exit_value = position.closing_value(
            &PricingEstimator::default(),
            92.0,
            0.2,
            at_expiry,
            close_time(),
        );
        assert_eq!(exit_value, dec!(-600));
    }

    #[test]
    fn test_double_close_is_error() {
        let mut position = Position::from_signal(7, &put_vertical_signal(), d(2024, 3, 1)).unwrap();
        position
            .close(d(2024, 3, 5), dec!(-100), ExitReason::ProfitTarget)
            .unwrap();
        assert!(!position.is_open());
        assert_eq!(
            position.close(d(2024, 3, 6), Decimal::ZERO, ExitReason::EndOfPeriod),
            Err(PositionError::AlreadyClosed(7))
        );
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[test]
    fn test_invalid_risk_refused() {
        let mut signal = put_vertical_signal();
        signal.capital_per_contract = Decimal::ZERO;
        assert!(matches!(
            Position::from_signal(1, &signal, d(2024, 3, 1)),
            Err(PositionError::InvalidRisk { .. })
        ));

        let mut signal = put_vertical_signal();
        signal.contracts = 0;
        assert_eq!(
            Position::from_signal(1, &signal, d(2024, 3, 1)),
            Err(PositionError::ZeroContracts)
        );

        assert!(PositionError::ZeroContracts.is_invalid_signal());
        assert!(PositionError::NoLegs.is_invalid_signal());
        assert!(!PositionError::NotFound(3).is_invalid_signal());
        assert!(!PositionError::AlreadyClosed(3).is_invalid_signal());
    }

    #[test]
    fn test_short_strike_lookup() {
        let position = Position::from_signal(1, &put_vertical_signal(), d(2024, 3, 1)).unwrap();
        assert_eq!(position.short_strike(OptionType::Put), Some(95.0));
        assert_eq!(position.short_strike(OptionType::Call), None);
        assert_eq!(position.short_legs().count(), 1);
    }

    #[test]
    fn test_money_rounding() {
        assert_eq!(money(123.456), dec!(123.46));
        assert_eq!(money(f64::NAN), Decimal::ZERO);
    }
}
