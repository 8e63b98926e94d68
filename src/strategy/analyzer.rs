//! Entry analyzer.
//!
//! Turns a strategy's rule table and the day's snapshot into a concrete,
//! priced entry signal. The engine decides *whether* a strategy may trade
//! (weekday, phase, capacity); the analyzer decides *what* it would open.

use chrono::{Duration, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::rules::{StrategyKind, StrategyRules};
use super::structures::{
    call_calendar, credit_vertical, short_put, short_strangle, vertical_at_strike,
    EvaluationError, PricingContext, StructureQuote,
};
use crate::backtest::trade::{money, Position, PositionLeg, Structure};
use crate::config::SessionConfig;
use crate::data::calendar::{fractional_dte, roll_to_weekday};
use crate::data::{MarketSnapshot, OptionType, PriceField};
use crate::pricing::PricingEstimator;
use crate::risk::AccountState;

/// A priced candidate position, per-contract amounts plus a contract count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub strategy: StrategyKind,
    pub symbol: String,
    pub structure: Structure,
    pub legs: Vec<PositionLeg>,
    pub expiration: chrono::NaiveDate,
    pub contracts: u32,
    /// Signed entry cash flow per contract (credit positive).
    pub entry_value_per_contract: Decimal,
    pub capital_per_contract: Decimal,
    pub max_loss_per_contract: Decimal,
    /// Underlying price the structure was priced at.
    pub underlying_price: f64,
    /// Roll generation; zero for fresh entries.
    pub roll_count: u32,
}

impl EntrySignal {
    fn from_quote(
        strategy: StrategyKind,
        snapshot: &MarketSnapshot,
        quote: StructureQuote,
        contracts: u32,
        spot: f64,
    ) -> Self {
        Self {
            strategy,
            symbol: snapshot.symbol.clone(),
            structure: quote.structure,
            legs: quote.legs,
            expiration: quote.expiration,
            contracts,
            entry_value_per_contract: money(quote.entry_value),
            capital_per_contract: money(quote.capital),
            max_loss_per_contract: money(quote.max_loss),
            underlying_price: spot,
            roll_count: 0,
        }
    }
}

/// Replacement requested by position management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Adjustment {
    /// Re-open the same structure at the strategy's target DTE.
    Roll,
    /// Replace with a defined-risk vertical on the given side.
    Convert { side: OptionType },
}

/// Produces entry signals. Must be `Sync` so independent runs can share one.
pub trait StrategyAnalyzer: Sync {
    fn evaluate_entry(
        &self,
        rules: &StrategyRules,
        snapshot: &MarketSnapshot,
        account: &AccountState,
        as_of: NaiveDateTime,
    ) -> Result<Option<EntrySignal>, EvaluationError>;

    /// Replacement for a position that management closed with a roll or a
    /// conversion. Rolls re-run the entry rules; conversions are skipped
    /// unless the analyzer supports them.
    fn evaluate_adjustment(
        &self,
        rules: &StrategyRules,
        closed: &Position,
        adjustment: Adjustment,
        snapshot: &MarketSnapshot,
        account: &AccountState,
        as_of: NaiveDateTime,
    ) -> Result<Option<EntrySignal>, EvaluationError> {
        match adjustment {
            Adjustment::Roll => Ok(self
                .evaluate_entry(rules, snapshot, account, as_of)?
                .map(|mut signal| {
                    signal.roll_count = closed.roll_count + 1;
                    signal
                })),
            Adjustment::Convert { .. } => Ok(None),
        }
    }
}

/// Rule-driven analyzer pricing every structure with Black-Scholes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleAnalyzer {
    estimator: PricingEstimator,
    session: SessionConfig,
}

impl RuleAnalyzer {
    pub fn new(estimator: PricingEstimator, session: SessionConfig) -> Self {
        Self { estimator, session }
    }

    /// Spot for `as_of`: the open before the defense checkpoint, the close
    /// from then on.
    fn spot(&self, snapshot: &MarketSnapshot, as_of: NaiveDateTime) -> f64 {
        if as_of.time() >= self.session.defense {
            snapshot.price(PriceField::Close)
        } else {
            snapshot.price(PriceField::Open)
        }
    }

    fn context<'a>(
        &'a self,
        rules: &StrategyRules,
        snapshot: &'a MarketSnapshot,
        spot: f64,
    ) -> Result<PricingContext<'a>, EvaluationError> {
        if !(spot.is_finite() && spot > 0.0) {
            return Err(EvaluationError::InvalidMarket {
                symbol: snapshot.symbol.clone(),
                reason: format!("spot {}", spot),
            });
        }
        Ok(PricingContext {
            symbol: &snapshot.symbol,
            estimator: &self.estimator,
            spot,
            vol: snapshot.volatility(),
            strike_increment: rules.entry().strike_increment,
        })
    }

    fn expiration_after(as_of: NaiveDateTime, days: i64) -> chrono::NaiveDate {
        roll_to_weekday(as_of.date() + Duration::days(days))
    }
}

impl StrategyAnalyzer for RuleAnalyzer {
    fn evaluate_entry(
        &self,
        rules: &StrategyRules,
        snapshot: &MarketSnapshot,
        account: &AccountState,
        as_of: NaiveDateTime,
    ) -> Result<Option<EntrySignal>, EvaluationError> {
        let contracts = rules.contracts_for_phase(account.phase);
        if contracts == 0 {
            return Ok(None);
        }

        let spot = self.spot(snapshot, as_of);
        let ctx = self.context(rules, snapshot, spot)?;
        let close = self.session.close;
        let target_dte = rules.entry().target_dte;

        let quote = match rules {
            StrategyRules::ZeroDte(r) => {
                // Sell against the overnight move: puts after a flat or up
                // open, calls after a gap down.
                let side = match snapshot.opening_gap() {
                    Some(gap) if gap < 0.0 => OptionType::Call,
                    _ => OptionType::Put,
                };
                let expiration = as_of.date();
                let dte = fractional_dte(as_of, expiration, close);
                if dte <= 0.0 {
                    return Ok(None);
                }
                credit_vertical(&ctx, side, r.short_delta, r.wing_width, dte, expiration)?
            }
            StrategyRules::Lt112(r) => {
                let expiration = Self::expiration_after(as_of, target_dte);
                let dte = fractional_dte(as_of, expiration, close);
                credit_vertical(&ctx, OptionType::Put, r.short_delta, r.wing_width, dte, expiration)?
            }
            StrategyRules::Strangle(r) => {
                let expiration = Self::expiration_after(as_of, target_dte);
                let dte = fractional_dte(as_of, expiration, close);
                short_strangle(&ctx, r.put_delta, r.call_delta, dte, expiration)?
            }
            StrategyRules::Ipmcc(r) => {
                let short_exp = Self::expiration_after(as_of, target_dte);
                let long_exp = Self::expiration_after(as_of, r.long_dte);
                call_calendar(
                    &ctx,
                    r.long_delta,
                    fractional_dte(as_of, long_exp, close),
                    long_exp,
                    r.short_delta,
                    fractional_dte(as_of, short_exp, close),
                    short_exp,
                )?
            }
            StrategyRules::LeapPuts(r) => {
                let expiration = Self::expiration_after(as_of, target_dte);
                let dte = fractional_dte(as_of, expiration, close);
                short_put(&ctx, r.short_delta, dte, expiration)?
            }
        };

        Ok(Some(EntrySignal::from_quote(
            rules.kind(),
            snapshot,
            quote,
            contracts,
            spot,
        )))
    }

    fn evaluate_adjustment(
        &self,
        rules: &StrategyRules,
        closed: &Position,
        adjustment: Adjustment,
        snapshot: &MarketSnapshot,
        account: &AccountState,
        as_of: NaiveDateTime,
    ) -> Result<Option<EntrySignal>, EvaluationError> {
        let side = match adjustment {
            Adjustment::Roll => {
                return Ok(self
                    .evaluate_entry(rules, snapshot, account, as_of)?
                    .map(|mut signal| {
                        signal.roll_count = closed.roll_count + 1;
                        signal
                    }));
            }
            Adjustment::Convert { side } => side,
        };

        let StrategyRules::Strangle(r) = rules else {
            return Ok(None);
        };
        let Some(short) = closed.short_strike(side) else {
            return Ok(None);
        };

        // Same short strike and expiration, now with a protective wing.
        let spot = self.spot(snapshot, as_of);
        let ctx = self.context(rules, snapshot, spot)?;
        let dte = fractional_dte(as_of, closed.expiration, self.session.close);
        if dte <= 0.0 {
            return Ok(None);
        }
        let quote = vertical_at_strike(&ctx, side, short, r.conversion_width, dte, closed.expiration)?;

        let mut signal = EntrySignal::from_quote(rules.kind(), snapshot, quote, closed.contracts, spot);
        signal.roll_count = closed.roll_count;
        Ok(Some(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DailyBar;
    use crate::risk::PhaseConfig;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    fn snapshot(date: NaiveDate, open: f64, previous_close: Option<f64>) -> MarketSnapshot {
        let mut bar = DailyBar::flat(open, 0.18);
        bar.close = open;
        let mut snap = MarketSnapshot::new("SPY", date, bar, 16.0);
        snap.previous_close = previous_close;
        snap
    }

    fn entry_time(date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::from_hms_opt(10, 30, 0).unwrap())
    }

    fn account(capital: Decimal) -> AccountState {
        AccountState::new(capital, &PhaseConfig::default())
    }

    #[test]
    fn test_zero_dte_side_follows_gap() {
        let analyzer = RuleAnalyzer::default();
        let rules = StrategyRules::defaults(StrategyKind::ZeroDte);
        let friday = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        let acct = account(dec!(45_000));

        let up = snapshot(friday, 500.0, Some(498.0));
        let signal = analyzer
            .evaluate_entry(&rules, &up, &acct, entry_time(friday))
            .unwrap()
            .unwrap();
        assert_eq!(signal.legs[0].option_type, OptionType::Put);
        assert_eq!(signal.expiration, friday);
        assert_eq!(signal.contracts, 1);

        let down = snapshot(friday, 500.0, Some(505.0));
        let signal = analyzer
            .evaluate_entry(&rules, &down, &acct, entry_time(friday))
            .unwrap()
            .unwrap();
        assert_eq!(signal.legs[0].option_type, OptionType::Call);
    }

    #[test]
    fn test_phase_without_contracts_yields_nothing() {
        let analyzer = RuleAnalyzer::default();
        let rules = StrategyRules::defaults(StrategyKind::ZeroDte);
        let friday = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        let acct = account(dec!(35_000));
        let signal = analyzer
            .evaluate_entry(&rules, &snapshot(friday, 500.0, None), &acct, entry_time(friday))
            .unwrap();
        assert!(signal.is_none());
    }

    #[test]
    fn test_lt112_expiration_on_weekday() {
        let analyzer = RuleAnalyzer::default();
        let rules = StrategyRules::defaults(StrategyKind::Lt112);
        let wednesday = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let signal = analyzer
            .evaluate_entry(&rules, &snapshot(wednesday, 500.0, None), &account(dec!(35_000)), entry_time(wednesday))
            .unwrap()
            .unwrap();
        assert_eq!(signal.expiration, wednesday + Duration::days(112));
        assert_eq!(signal.structure, Structure::Vertical);
        assert!(signal.entry_value_per_contract > Decimal::ZERO);
        assert_eq!(
            signal.entry_value_per_contract + signal.max_loss_per_contract,
            dec!(1000)
        );
    }

    #[test]
    fn test_invalid_spot() {
        let analyzer = RuleAnalyzer::default();
        let rules = StrategyRules::defaults(StrategyKind::Lt112);
        let date = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let mut snap = snapshot(date, 500.0, None);
        snap.bar.open = f64::NAN;
        assert!(matches!(
            analyzer.evaluate_entry(&rules, &snap, &account(dec!(35_000)), entry_time(date)),
            Err(EvaluationError::InvalidMarket { .. })
        ));
    }

    #[test]
    fn test_strangle_conversion_keeps_short_strike() {
        let analyzer = RuleAnalyzer::default();
        let rules = StrategyRules::defaults(StrategyKind::Strangle);
        let entry = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let acct = account(dec!(35_000));
        let signal = analyzer
            .evaluate_entry(&rules, &snapshot(entry, 100.0, None), &acct, entry_time(entry))
            .unwrap()
            .unwrap();
        let position = Position::from_signal(3, &signal, entry).unwrap();
        let put_strike = position.short_strike(OptionType::Put).unwrap();

        let later = position.expiration - Duration::days(20);
        let converted = analyzer
            .evaluate_adjustment(
                &rules,
                &position,
                Adjustment::Convert { side: OptionType::Put },
                &snapshot(later, put_strike, None),
                &acct,
                entry_time(later),
            )
            .unwrap()
            .unwrap();
        assert_eq!(converted.structure, Structure::Vertical);
        assert_eq!(converted.legs[0].strike, put_strike);
        assert_eq!(converted.legs[1].strike, put_strike - 10.0);
        assert_eq!(converted.expiration, position.expiration);
    }
}
