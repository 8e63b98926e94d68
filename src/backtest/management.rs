//! Position management rules.
//!
//! Evaluated for every open position at each session checkpoint. Order of
//! precedence:
//! 1. Expiration (always wins)
//! 2. Stop-loss
//! 3. Profit target
//! 4. Strategy rules: 0DTE time defense, LT112/strangle management DTE
//!    (roll when tested, convert a strangle tested on both sides, close
//!    otherwise)

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::{OptionType, PriceField};
use crate::strategy::StrategyRules;

use super::trade::{ExitReason, Position};

/// Intraday instants at which positions are managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checkpoint {
    Open,
    Defense,
    Close,
}

impl Checkpoint {
    /// Bar price observed at this checkpoint.
    pub fn price_field(&self) -> PriceField {
        match self {
            Self::Open => PriceField::Open,
            Self::Defense | Self::Close => PriceField::Close,
        }
    }
}

/// What management decided for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementAction {
    Hold,
    Close(ExitReason),
    /// Close as `Rolled` and re-open at the strategy's target DTE.
    Roll,
    /// Close as `Converted` and open a defined-risk vertical on `side`.
    Convert { side: OptionType },
}

/// Market view of one position at one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub as_of: NaiveDateTime,
    pub spot: f64,
    /// Fractional days to the front expiration's session close.
    pub dte: f64,
    /// Estimated closing cash flow.
    pub mark: Decimal,
}

/// Spot within `distance` (a fraction of the strike) of a short strike,
/// or through it.
pub fn is_tested(strike: f64, option_type: OptionType, spot: f64, distance: f64) -> bool {
    match option_type {
        OptionType::Put => spot <= strike * (1.0 + distance),
        OptionType::Call => spot >= strike * (1.0 - distance),
    }
}

/// Short sides of a position that are tested, most threatened first.
fn tested_sides(position: &Position, spot: f64, distance: f64) -> Vec<OptionType> {
    let mut sides: Vec<(OptionType, f64)> = position
        .short_legs()
        .filter(|leg| is_tested(leg.strike, leg.option_type, spot, distance))
        .map(|leg| {
            // Signed cushion left before the strike, relative to the strike.
            let cushion = match leg.option_type {
                OptionType::Put => (spot - leg.strike) / leg.strike,
                OptionType::Call => (leg.strike - spot) / leg.strike,
            };
            (leg.option_type, cushion)
        })
        .collect();
    sides.sort_by(|a, b| a.1.total_cmp(&b.1));
    sides.dedup_by_key(|(side, _)| *side);
    sides.into_iter().map(|(side, _)| side).collect()
}

/// Decide what to do with one open position.
pub fn evaluate(position: &Position, rules: &StrategyRules, obs: &Observation) -> ManagementAction {
    if obs.dte <= 0.0 {
        return ManagementAction::Close(ExitReason::Expiration);
    }

    let basis = position.premium_basis();
    if basis > Decimal::ZERO {
        let gain = position.entry_value + obs.mark;
        let exit = rules.exit();

        if let Ok(stop) = Decimal::try_from(exit.stop_loss) {
            if -gain >= basis * stop {
                return ManagementAction::Close(ExitReason::StopLoss);
            }
        }
        if let Ok(target) = Decimal::try_from(exit.profit_target) {
            if gain >= basis * target {
                return ManagementAction::Close(ExitReason::ProfitTarget);
            }
        }
    }

    match rules {
        StrategyRules::ZeroDte(r) => {
            if obs.as_of.time() >= r.defense_time
                && position.short_legs().any(|leg| leg.is_itm(obs.spot))
            {
                return ManagementAction::Close(ExitReason::TimeDefense);
            }
        }
        StrategyRules::Lt112(r) => {
            if obs.dte <= r.management_dte as f64 {
                return if tested_sides(position, obs.spot, r.tested_distance).is_empty() {
                    ManagementAction::Close(ExitReason::ManagementDte)
                } else {
                    ManagementAction::Roll
                };
            }
        }
        StrategyRules::Strangle(r) => {
            if obs.dte <= r.management_dte as f64 {
                let sides = tested_sides(position, obs.spot, r.tested_distance);
                return match sides.as_slice() {
                    [] => ManagementAction::Close(ExitReason::ManagementDte),
                    [_] => ManagementAction::Roll,
                    [side, ..] => ManagementAction::Convert { side: *side },
                };
            }
        }
        StrategyRules::Ipmcc(_) | StrategyRules::LeapPuts(_) => {}
    }

    ManagementAction::Hold
}
