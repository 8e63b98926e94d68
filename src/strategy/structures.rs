//! Structure builders.
//!
//! Each builder places strikes from target deltas, prices the legs with the
//! estimator and works out the per-contract entry cash flow, buying-power
//! requirement and maximum loss. All amounts returned here are per contract
//! (one structure unit, 100 shares per option).

use chrono::NaiveDate;
use thiserror::Error;

use crate::backtest::trade::{PositionLeg, Structure, CONTRACT_MULTIPLIER};
use crate::data::OptionType;
use crate::pricing::{round_to_increment, PricingEstimator};

/// Reg-T style naked option requirement: 20% of the underlying less the
/// out-of-the-money amount, but at least 10% of the reference price.
const NAKED_BASE_RATE: f64 = 0.20;
const NAKED_MIN_RATE: f64 = 0.10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("No usable strike for {symbol}: {reason}")]
    NoValidStrike { symbol: String, reason: String },

    #[error("Degenerate {structure:?} on {symbol}: {reason}")]
    DegenerateStructure {
        symbol: String,
        structure: Structure,
        reason: String,
    },

    #[error("Unusable market data for {symbol}: {reason}")]
    InvalidMarket { symbol: String, reason: String },
}

/// Priced structure, per contract.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureQuote {
    pub structure: Structure,
    pub legs: Vec<PositionLeg>,
    /// Front expiration.
    pub expiration: NaiveDate,
    /// Signed entry cash flow in dollars (credit positive).
    pub entry_value: f64,
    /// Buying power required in dollars.
    pub capital: f64,
    /// Maximum loss in dollars.
    pub max_loss: f64,
}

/// Inputs shared by all builders.
#[derive(Debug, Clone, Copy)]
pub struct PricingContext<'a> {
    pub symbol: &'a str,
    pub estimator: &'a PricingEstimator,
    pub spot: f64,
    pub vol: f64,
    pub strike_increment: f64,
}

impl PricingContext<'_> {
    fn strike(&self, dte: f64, delta: f64, option_type: OptionType) -> Result<f64, EvaluationError> {
        let raw = self
            .estimator
            .strike_for_delta(self.spot, dte, self.vol, delta, option_type);
        let strike = round_to_increment(raw, self.strike_increment);
        if !(strike.is_finite() && strike > 0.0) {
            return Err(EvaluationError::NoValidStrike {
                symbol: self.symbol.to_string(),
                reason: format!("delta {:.2} gives strike {:.2}", delta, strike),
            });
        }
        Ok(strike)
    }

    fn premium(&self, strike: f64, dte: f64, option_type: OptionType) -> f64 {
        self.estimator
            .estimate_credit(self.spot, strike, dte, self.vol, option_type)
    }

    fn degenerate(&self, structure: Structure, reason: String) -> EvaluationError {
        EvaluationError::DegenerateStructure {
            symbol: self.symbol.to_string(),
            structure,
            reason,
        }
    }
}

/// Naked short option requirement per share, premium included.
pub fn naked_requirement(spot: f64, strike: f64, premium: f64, option_type: OptionType) -> f64 {
    let otm = match option_type {
        OptionType::Put => (spot - strike).max(0.0),
        OptionType::Call => (strike - spot).max(0.0),
    };
    let floor_base = match option_type {
        OptionType::Put => strike,
        OptionType::Call => spot,
    };
    premium + (NAKED_BASE_RATE * spot - otm).max(NAKED_MIN_RATE * floor_base)
}

/// Short credit vertical: short strike at `short_delta`, long strike
/// `width` points further out of the money.
pub fn credit_vertical(
    ctx: &PricingContext<'_>,
    option_type: OptionType,
    short_delta: f64,
    width: f64,
    dte: f64,
    expiration: NaiveDate,
) -> Result<StructureQuote, EvaluationError> {
    if !(width > 0.0) {
        return Err(ctx.degenerate(Structure::Vertical, format!("wing width {}", width)));
    }
    let short = ctx.strike(dte, short_delta, option_type)?;
    vertical_at_strike(ctx, option_type, short, width, dte, expiration)
}

/// Short credit vertical with an explicit short strike.
pub fn vertical_at_strike(
    ctx: &PricingContext<'_>,
    option_type: OptionType,
    short: f64,
    width: f64,
    dte: f64,
    expiration: NaiveDate,
) -> Result<StructureQuote, EvaluationError> {
    let long = match option_type {
        OptionType::Put => short - width,
        OptionType::Call => short + width,
    };
    if long <= 0.0 {
        return Err(ctx.degenerate(
            Structure::Vertical,
            format!("long strike {:.2} not positive", long),
        ));
    }

    let credit = ctx
        .estimator
        .vertical_credit(ctx.spot, short, long, dte, ctx.vol, option_type);
    if credit >= width {
        return Err(ctx.degenerate(
            Structure::Vertical,
            format!("credit {:.2} not below width {:.2}", credit, width),
        ));
    }

    let max_loss = (width - credit) * CONTRACT_MULTIPLIER;
    Ok(StructureQuote {
        structure: Structure::Vertical,
        legs: vec![
            PositionLeg::new(option_type, short, expiration, -1),
            PositionLeg::new(option_type, long, expiration, 1),
        ],
        expiration,
        entry_value: credit * CONTRACT_MULTIPLIER,
        capital: max_loss,
        max_loss,
    })
}

/// Short strangle. Requirement is the larger naked side plus the other
/// side's premium; the reserved buying power doubles as the loss bound.
pub fn short_strangle(
    ctx: &PricingContext<'_>,
    put_delta: f64,
    call_delta: f64,
    dte: f64,
    expiration: NaiveDate,
) -> Result<StructureQuote, EvaluationError> {
    let put_strike = ctx.strike(dte, put_delta, OptionType::Put)?;
    let call_strike = ctx.strike(dte, call_delta, OptionType::Call)?;
    if put_strike >= call_strike {
        return Err(ctx.degenerate(
            Structure::Strangle,
            format!("put {:.2} not below call {:.2}", put_strike, call_strike),
        ));
    }

    let put_premium = ctx.premium(put_strike, dte, OptionType::Put);
    let call_premium = ctx.premium(call_strike, dte, OptionType::Call);
    let credit = (put_premium + call_premium).max(ctx.estimator.min_credit);

    let put_req = naked_requirement(ctx.spot, put_strike, put_premium, OptionType::Put);
    let call_req = naked_requirement(ctx.spot, call_strike, call_premium, OptionType::Call);
    let requirement = if put_req >= call_req {
        put_req + call_premium
    } else {
        call_req + put_premium
    };
    let capital = requirement * CONTRACT_MULTIPLIER;

    Ok(StructureQuote {
        structure: Structure::Strangle,
        legs: vec![
            PositionLeg::new(OptionType::Put, put_strike, expiration, -1),
            PositionLeg::new(OptionType::Call, call_strike, expiration, -1),
        ],
        expiration,
        entry_value: credit * CONTRACT_MULTIPLIER,
        capital,
        max_loss: capital,
    })
}

/// Single short put. Loss is bounded by assignment at the strike.
pub fn short_put(
    ctx: &PricingContext<'_>,
    short_delta: f64,
    dte: f64,
    expiration: NaiveDate,
) -> Result<StructureQuote, EvaluationError> {
    let strike = ctx.strike(dte, short_delta, OptionType::Put)?;
    let credit = ctx
        .premium(strike, dte, OptionType::Put)
        .max(ctx.estimator.min_credit);
    let requirement = naked_requirement(ctx.spot, strike, credit, OptionType::Put);

    Ok(StructureQuote {
        structure: Structure::SingleLeg,
        legs: vec![PositionLeg::new(OptionType::Put, strike, expiration, -1)],
        expiration,
        entry_value: credit * CONTRACT_MULTIPLIER,
        capital: requirement * CONTRACT_MULTIPLIER,
        max_loss: ((strike - credit) * CONTRACT_MULTIPLIER).max(0.0),
    })
}

/// Long deep call with a short near-term call above it. Paid as a debit,
/// which is both the requirement and the maximum loss.
#[allow(clippy::too_many_arguments)]
pub fn call_calendar(
    ctx: &PricingContext<'_>,
    long_delta: f64,
    long_dte: f64,
    long_expiration: NaiveDate,
    short_delta: f64,
    short_dte: f64,
    short_expiration: NaiveDate,
) -> Result<StructureQuote, EvaluationError> {
    if long_expiration <= short_expiration {
        return Err(ctx.degenerate(
            Structure::Calendar,
            "long leg must expire after the short leg".to_string(),
        ));
    }
    let long_strike = ctx.strike(long_dte, long_delta, OptionType::Call)?;
    let short_strike = ctx
        .strike(short_dte, short_delta, OptionType::Call)?
        .max(long_strike);

    let debit = ctx.premium(long_strike, long_dte, OptionType::Call)
        - ctx.premium(short_strike, short_dte, OptionType::Call);
    if !(debit > 0.0) {
        return Err(ctx.degenerate(
            Structure::Calendar,
            format!("net debit {:.2} not positive", debit),
        ));
    }
    let cost = debit * CONTRACT_MULTIPLIER;

    Ok(StructureQuote {
        structure: Structure::Calendar,
        legs: vec![
            PositionLeg::new(OptionType::Call, long_strike, long_expiration, 1),
            PositionLeg::new(OptionType::Call, short_strike, short_expiration, -1),
        ],
        expiration: short_expiration,
        entry_value: -cost,
        capital: cost,
        max_loss: cost,
    })
}
