//! Core backtesting engine.
//!
//! Runs the day-stepping simulation loop:
//! 1. Fetch the day's bars for every symbol (concurrently) plus VIX
//! 2. Update capital phase, volatility regime and buying-power ceiling
//! 3. Settle expired positions and manage the rest at the open checkpoint
//! 4. Evaluate new entries at the entry checkpoint
//! 5. Manage positions opened today at the defense and close checkpoints
//! 6. Record daily equity
//!
//! Positions still open at the end of the range are closed at their last
//! mark with reason `EndOfPeriod`.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate, NaiveTime};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BacktestConfig, ConfigError};
use crate::data::calendar::fractional_dte;
use crate::data::{
    DailyBar, DataError, MarketDataSource, MarketSnapshot, PriceField, TradingCalendar,
};
use crate::regime::{RegimeClassifier, VolatilityRegime};
use crate::strategy::{Adjustment, EntrySignal, RuleAnalyzer, StrategyAnalyzer, StrategyRules};

use super::ledger::{Admission, PositionLedger, RejectionCounts};
use super::management::{self, Checkpoint, ManagementAction, Observation};
use super::trade::{ExitReason, Position, PositionError, Trade};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Position invariant violated: {0}")]
    Position(#[from] PositionError),
}

/// Daily equity snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEquityRecord {
    pub date: NaiveDate,
    /// Mark-to-market equity: realized capital plus open P&L.
    pub capital: Decimal,
    /// Change against the previous record (or the initial capital).
    pub daily_pnl: Decimal,
    pub open_positions: usize,
    pub phase: u8,
    pub realized_capital: Decimal,
    pub used_bp: Decimal,
    pub bp_ceiling: Decimal,
    pub vix: f64,
    pub regime: VolatilityRegime,
}

/// Result of a completed backtest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestResult {
    /// Configuration name.
    pub name: String,

    /// Symbols traded.
    pub symbols: Vec<String>,

    pub start_date: NaiveDate,

    pub end_date: NaiveDate,

    pub initial_capital: Decimal,

    /// Realized capital after end-of-period closes.
    pub final_capital: Decimal,

    /// All closed trades, in close order.
    pub trades: Vec<Trade>,

    /// One record per simulated day.
    pub equity_curve: Vec<DailyEquityRecord>,

    /// Calendar days skipped because no symbol had data.
    pub data_gaps: usize,

    /// Symbol-days skipped because of missing or invalid bars.
    pub skipped_symbol_days: usize,

    /// Entry signals produced by the analyzer.
    pub entry_signals: usize,

    pub rejections: RejectionCounts,

    pub rolls: usize,

    pub conversions: usize,

    pub evaluation_errors: usize,

    pub phase_changes: usize,

    pub days_by_regime: BTreeMap<VolatilityRegime, usize>,
}

impl BacktestResult {
    pub fn trading_days(&self) -> usize {
        self.equity_curve.len()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.trades.iter().map(|t| t.pnl).sum()
    }
}

/// The backtesting engine. Holds only immutable configuration, so one
/// engine can run any number of independent simulations.
pub struct BacktestEngine<A: StrategyAnalyzer = RuleAnalyzer> {
    config: BacktestConfig,
    analyzer: A,
}

impl BacktestEngine<RuleAnalyzer> {
    /// Validate the configuration and build an engine with the rule analyzer.
    pub fn new(config: BacktestConfig) -> Result<Self, ConfigError> {
        let analyzer = RuleAnalyzer::new(config.pricing, config.session);
        Self::with_analyzer(config, analyzer)
    }
}

impl<A: StrategyAnalyzer> BacktestEngine<A> {
    pub fn with_analyzer(config: BacktestConfig, analyzer: A) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, analyzer })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run one simulation over `start..=end`.
    pub fn run<S: MarketDataSource + ?Sized>(
        &self,
        source: &S,
        start: NaiveDate,
        end: NaiveDate,
        symbols: &[String],
    ) -> Result<BacktestResult, EngineError> {
        let calendar = TradingCalendar::new(start, end)?;
        self.config.validate_symbols(symbols)?;

        info!(
            name = self.config.name.as_str(),
            %start,
            %end,
            days = calendar.len(),
            symbols = symbols.len(),
            "starting backtest"
        );

        let mut sim = Simulation::new(&self.config, &self.analyzer, source, symbols)?;
        for date in calendar.days() {
            sim.process_day(*date)?;
        }
        sim.close_remaining(end)?;

        let result = sim.into_result(start, end);
        info!(
            name = result.name.as_str(),
            trades = result.trades.len(),
            days = result.trading_days(),
            final_capital = %result.final_capital,
            "backtest complete"
        );
        Ok(result)
    }

    /// Run several independent simulations in parallel. Results come back
    /// in input order.
    pub fn run_batch<S: MarketDataSource + ?Sized>(
        engines: &[Self],
        source: &S,
        start: NaiveDate,
        end: NaiveDate,
        symbols: &[String],
    ) -> Vec<Result<BacktestResult, EngineError>> {
        engines
            .par_iter()
            .map(|engine| engine.run(source, start, end, symbols))
            .collect()
    }
}

#[derive(Debug, Default)]
struct RunStats {
    data_gaps: usize,
    skipped_symbol_days: usize,
    entry_signals: usize,
    rolls: usize,
    conversions: usize,
    evaluation_errors: usize,
    phase_changes: usize,
}

/// Mutable state of one run.
struct Simulation<'a, A: ?Sized, S: ?Sized> {
    config: &'a BacktestConfig,
    analyzer: &'a A,
    source: &'a S,
    symbols: &'a [String],
    ledger: PositionLedger,
    classifier: RegimeClassifier,
    previous_close: HashMap<String, f64>,
    equity_curve: Vec<DailyEquityRecord>,
    stats: RunStats,
}

impl<'a, A, S> Simulation<'a, A, S>
where
    A: StrategyAnalyzer + ?Sized,
    S: MarketDataSource + ?Sized,
{
    fn new(
        config: &'a BacktestConfig,
        analyzer: &'a A,
        source: &'a S,
        symbols: &'a [String],
    ) -> Result<Self, ConfigError> {
        let ledger = PositionLedger::new(
            config.initial_capital,
            &config.phases,
            config.correlation_tracker()?,
            config.max_positions,
        );
        Ok(Self {
            config,
            analyzer,
            source,
            symbols,
            ledger,
            classifier: RegimeClassifier::new(config.regime.clone()),
            previous_close: HashMap::new(),
            equity_curve: Vec::new(),
            stats: RunStats::default(),
        })
    }

    fn process_day(&mut self, date: NaiveDate) -> Result<(), EngineError> {
        // 1. Market data
        let bars = self.fetch_bars(date);
        if bars.is_empty() {
            debug!(%date, "no market data, skipping day");
            self.stats.data_gaps += 1;
            return Ok(());
        }
        let vix = self.vix_level(date, &bars);
        let snapshots: HashMap<String, MarketSnapshot> = bars
            .into_iter()
            .map(|(symbol, bar)| {
                let mut snapshot = MarketSnapshot::new(&symbol, date, bar, vix);
                snapshot.previous_close = self.previous_close.get(&symbol).copied();
                (symbol, snapshot)
            })
            .collect();

        // 2. Phase and regime
        let regime = self.classifier.classify(date, vix);
        let usage = self.classifier.bp_usage(regime);
        if self.ledger.begin_day(&self.config.phases, regime, usage) {
            self.stats.phase_changes += 1;
            info!(
                %date,
                phase = self.ledger.account().phase,
                capital = %self.ledger.account().capital,
                "phase changed"
            );
        }

        // 3-5. Manage, enter, manage
        self.manage(date, Checkpoint::Open, &snapshots)?;
        self.enter(date, &snapshots)?;
        self.manage(date, Checkpoint::Defense, &snapshots)?;
        self.manage(date, Checkpoint::Close, &snapshots)?;

        // 6. Equity
        self.record_equity(date, vix, regime);
        for (symbol, snapshot) in &snapshots {
            self.previous_close.insert(symbol.clone(), snapshot.bar.close);
        }
        Ok(())
    }

    /// Bars for every symbol with data today, in symbol order.
    fn fetch_bars(&mut self, date: NaiveDate) -> Vec<(String, DailyBar)> {
        let source = self.source;
        let fetched: Vec<(String, Result<DailyBar, DataError>)> = self
            .symbols
            .par_iter()
            .map(|symbol| (symbol.clone(), source.daily_bar(symbol, date)))
            .collect();

        let mut bars = Vec::with_capacity(fetched.len());
        for (symbol, result) in fetched {
            match result {
                Ok(bar) => bars.push((symbol, bar)),
                Err(DataError::Unavailable { .. }) => {
                    debug!(symbol = symbol.as_str(), %date, "no bar");
                    self.stats.skipped_symbol_days += 1;
                }
                Err(e) => {
                    warn!(symbol = symbol.as_str(), %date, error = %e, "skipping symbol");
                    self.stats.skipped_symbol_days += 1;
                }
            }
        }
        bars
    }

    /// VIX close for the day, or average implied volatility x 100 when the
    /// VIX series has no bar.
    fn vix_level(&self, date: NaiveDate, bars: &[(String, DailyBar)]) -> f64 {
        match self.source.daily_bar(&self.config.vix_symbol, date) {
            Ok(bar) => bar.close,
            Err(_) => {
                let avg_iv =
                    bars.iter().map(|(_, b)| b.implied_volatility).sum::<f64>() / bars.len() as f64;
                debug!(%date, approx = avg_iv * 100.0, "VIX missing, using average IV");
                avg_iv * 100.0
            }
        }
    }

    fn checkpoint_time(&self, checkpoint: Checkpoint) -> NaiveTime {
        let session = &self.config.session;
        match checkpoint {
            Checkpoint::Open => session.open,
            Checkpoint::Defense => session.defense,
            Checkpoint::Close => session.close,
        }
    }

    /// Manage open positions at one checkpoint. Positions opened on an
    /// earlier day are only managed at the open, so their exits land before
    /// the day's entries; later checkpoints just re-mark them.
    fn manage(
        &mut self,
        date: NaiveDate,
        checkpoint: Checkpoint,
        snapshots: &HashMap<String, MarketSnapshot>,
    ) -> Result<(), EngineError> {
        let as_of = date.and_time(self.checkpoint_time(checkpoint));
        let session_close = self.config.session.close;
        let config = self.config;

        let open: Vec<Position> = self.ledger.open_positions().to_vec();
        for position in open {
            let carried = position.entry_date < date;
            if carried && checkpoint == Checkpoint::Open && position.expiration <= date {
                self.settle_expired(date, &position, snapshots)?;
                continue;
            }

            let Some(snapshot) = snapshots.get(&position.symbol) else {
                continue;
            };
            let spot = snapshot.price(checkpoint.price_field());
            let mark = position.closing_value(
                &config.pricing,
                spot,
                snapshot.volatility(),
                as_of,
                session_close,
            );
            self.ledger.mark(position.id, mark)?;

            if carried && checkpoint != Checkpoint::Open {
                continue;
            }
            let Some(rules) = config.strategy(position.strategy) else {
                continue;
            };
            let obs = Observation {
                as_of,
                spot,
                dte: fractional_dte(as_of, position.expiration, session_close),
                mark,
            };

            match management::evaluate(&position, rules, &obs) {
                ManagementAction::Hold => {}
                ManagementAction::Close(reason) => {
                    self.ledger.close(position.id, date, mark, reason)?;
                }
                ManagementAction::Roll => {
                    self.ledger.close(position.id, date, mark, ExitReason::Rolled)?;
                    if self.replace(rules, &position, Adjustment::Roll, snapshot, as_of)? {
                        self.stats.rolls += 1;
                    }
                }
                ManagementAction::Convert { side } => {
                    self.ledger
                        .close(position.id, date, mark, ExitReason::Converted)?;
                    let adjustment = Adjustment::Convert { side };
                    if self.replace(rules, &position, adjustment, snapshot, as_of)? {
                        self.stats.conversions += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Settle a position from an earlier day whose expiration has come:
    /// intrinsic value at the day's close, or the last mark when its symbol
    /// has no bar today.
    fn settle_expired(
        &mut self,
        date: NaiveDate,
        position: &Position,
        snapshots: &HashMap<String, MarketSnapshot>,
    ) -> Result<(), EngineError> {
        let session_close = self.config.session.close;
        let exit_value = match snapshots.get(&position.symbol) {
            Some(snapshot) => position.closing_value(
                &self.config.pricing,
                snapshot.price(PriceField::Close),
                snapshot.volatility(),
                date.and_time(session_close),
                session_close,
            ),
            None => {
                debug!(
                    id = position.id,
                    symbol = position.symbol.as_str(),
                    %date,
                    "no bar at expiration, settling at last mark"
                );
                position.last_mark
            }
        };
        self.ledger
            .close(position.id, date, exit_value, ExitReason::Expiration)?;
        Ok(())
    }

    /// Book a signal. A signal that cannot form a valid position is counted
    /// as an evaluation error and dropped; `None` means it was never booked.
    fn admit(
        &mut self,
        signal: &EntrySignal,
        date: NaiveDate,
    ) -> Result<Option<Admission>, EngineError> {
        match self.ledger.try_open(signal, date) {
            Ok(admission) => Ok(Some(admission)),
            Err(e) if e.is_invalid_signal() => {
                warn!(
                    symbol = signal.symbol.as_str(),
                    strategy = %signal.strategy,
                    error = %e,
                    "invalid entry signal"
                );
                self.stats.evaluation_errors += 1;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open the replacement for a rolled or converted position. Returns
    /// whether it was admitted.
    fn replace(
        &mut self,
        rules: &StrategyRules,
        closed: &Position,
        adjustment: Adjustment,
        snapshot: &MarketSnapshot,
        as_of: chrono::NaiveDateTime,
    ) -> Result<bool, EngineError> {
        let signal = match self.analyzer.evaluate_adjustment(
            rules,
            closed,
            adjustment,
            snapshot,
            self.ledger.account(),
            as_of,
        ) {
            Ok(Some(signal)) => signal,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(symbol = closed.symbol.as_str(), error = %e, ?adjustment, "no replacement");
                self.stats.evaluation_errors += 1;
                return Ok(false);
            }
        };

        match self.admit(&signal, as_of.date())? {
            Some(Admission::Admitted(id)) => {
                debug!(id, replaced = closed.id, ?adjustment, "replacement opened");
                Ok(true)
            }
            Some(Admission::Rejected(reason)) => {
                debug!(replaced = closed.id, ?reason, "replacement rejected");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn enter(
        &mut self,
        date: NaiveDate,
        snapshots: &HashMap<String, MarketSnapshot>,
    ) -> Result<(), EngineError> {
        let as_of = date.and_time(self.config.session.entry);
        let weekday = date.weekday();
        let config = self.config;

        for rules in &config.strategies {
            if !rules.trades_on(weekday) || !rules.allowed_in_phase(self.ledger.account().phase) {
                continue;
            }
            for symbol in self.symbols {
                if !self.ledger.can_add_position() {
                    return Ok(());
                }
                if !rules.trades_symbol(symbol) {
                    continue;
                }
                let Some(snapshot) = snapshots.get(symbol) else {
                    continue;
                };

                let signal =
                    match self
                        .analyzer
                        .evaluate_entry(rules, snapshot, self.ledger.account(), as_of)
                    {
                        Ok(Some(signal)) => signal,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(
                                symbol = symbol.as_str(),
                                strategy = %rules.kind(),
                                error = %e,
                                "entry evaluation failed"
                            );
                            self.stats.evaluation_errors += 1;
                            continue;
                        }
                    };
                self.stats.entry_signals += 1;

                if let Some(Admission::Rejected(reason)) = self.admit(&signal, date)? {
                    debug!(
                        symbol = symbol.as_str(),
                        strategy = %rules.kind(),
                        ?reason,
                        "candidate dropped"
                    );
                }
            }
        }
        Ok(())
    }

    fn record_equity(&mut self, date: NaiveDate, vix: f64, regime: VolatilityRegime) {
        let equity = self.ledger.equity();
        let previous = self
            .equity_curve
            .last()
            .map(|r| r.capital)
            .unwrap_or(self.config.initial_capital);
        let account = self.ledger.account();

        self.equity_curve.push(DailyEquityRecord {
            date,
            capital: equity,
            daily_pnl: equity - previous,
            open_positions: self.ledger.open_count(),
            phase: account.phase,
            realized_capital: account.capital,
            used_bp: account.used_bp,
            bp_ceiling: account.ceiling(),
            vix,
            regime,
        });
    }

    /// Close everything still open at its last mark.
    fn close_remaining(&mut self, end: NaiveDate) -> Result<(), EngineError> {
        let exit_date = self.equity_curve.last().map(|r| r.date).unwrap_or(end);
        let open: Vec<(u64, Decimal)> = self
            .ledger
            .open_positions()
            .iter()
            .map(|p| (p.id, p.last_mark))
            .collect();
        for (id, mark) in open {
            self.ledger.close(id, exit_date, mark, ExitReason::EndOfPeriod)?;
        }
        Ok(())
    }

    fn into_result(self, start: NaiveDate, end: NaiveDate) -> BacktestResult {
        let days_by_regime = self.classifier.days_by_regime();
        let rejections = self.ledger.rejections().clone();
        let (trades, account) = self.ledger.into_parts();
        BacktestResult {
            name: self.config.name.clone(),
            symbols: self.symbols.to_vec(),
            start_date: start,
            end_date: end,
            initial_capital: self.config.initial_capital,
            final_capital: account.capital,
            trades,
            equity_curve: self.equity_curve,
            data_gaps: self.stats.data_gaps,
            skipped_symbol_days: self.stats.skipped_symbol_days,
            entry_signals: self.stats.entry_signals,
            rejections,
            rolls: self.stats.rolls,
            conversions: self.stats.conversions,
            evaluation_errors: self.stats.evaluation_errors,
            phase_changes: self.stats.phase_changes,
            days_by_regime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::trade::{PositionLeg, Structure};
    use crate::data::{InMemoryMarketData, OptionType};
    use crate::strategy::{EvaluationError, StrategyKind};
    use chrono::{Duration, NaiveDateTime, Weekday};
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Flat SPY at 100 and VIX at 16 on every weekday of the range.
    fn flat_market(start: NaiveDate, end: NaiveDate) -> InMemoryMarketData {
        let mut data = InMemoryMarketData::new();
        for date in TradingCalendar::new(start, end).unwrap().days() {
            data.insert("SPY", *date, DailyBar::flat(100.0, 0.20));
            data.insert("VIX", *date, DailyBar::flat(16.0, 0.0));
        }
        data
    }

    /// Open and close for one SPY day, IV 20%.
    fn bar(open: f64, close: f64) -> DailyBar {
        DailyBar {
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 0,
            implied_volatility: 0.20,
        }
    }

    /// Sells one 90/85 put vertical for a 500 credit, expiring `expires_in`
    /// calendar days after entry.
    struct ScriptedAnalyzer {
        expires_in: i64,
    }

    const FRIDAY_EXPIRY: ScriptedAnalyzer = ScriptedAnalyzer { expires_in: 4 };

    impl StrategyAnalyzer for ScriptedAnalyzer {
        fn evaluate_entry(
            &self,
            rules: &StrategyRules,
            snapshot: &MarketSnapshot,
            _account: &crate::risk::AccountState,
            as_of: NaiveDateTime,
        ) -> Result<Option<EntrySignal>, EvaluationError> {
            let expiration = as_of.date() + Duration::days(self.expires_in);
            Ok(Some(EntrySignal {
                strategy: rules.kind(),
                symbol: snapshot.symbol.clone(),
                structure: Structure::Vertical,
                legs: vec![
                    PositionLeg::new(OptionType::Put, 90.0, expiration, -1),
                    PositionLeg::new(OptionType::Put, 85.0, expiration, 1),
                ],
                expiration,
                contracts: 1,
                entry_value_per_contract: dec!(500),
                capital_per_contract: dec!(4_500),
                max_loss_per_contract: dec!(4_500),
                underlying_price: snapshot.bar.open,
                roll_count: 0,
            }))
        }
    }

    /// Like `FRIDAY_EXPIRY`, but quotes one symbol with no capital at risk.
    struct UnpricedSymbol(&'static str);

    impl StrategyAnalyzer for UnpricedSymbol {
        fn evaluate_entry(
            &self,
            rules: &StrategyRules,
            snapshot: &MarketSnapshot,
            account: &crate::risk::AccountState,
            as_of: NaiveDateTime,
        ) -> Result<Option<EntrySignal>, EvaluationError> {
            let signal = FRIDAY_EXPIRY.evaluate_entry(rules, snapshot, account, as_of)?;
            Ok(signal.map(|mut s| {
                if s.symbol == self.0 {
                    s.capital_per_contract = Decimal::ZERO;
                }
                s
            }))
        }
    }

    /// Like `FRIDAY_EXPIRY`, but every roll asks for more buying power than
    /// the account has.
    struct OversizedRoll;

    impl StrategyAnalyzer for OversizedRoll {
        fn evaluate_entry(
            &self,
            rules: &StrategyRules,
            snapshot: &MarketSnapshot,
            account: &crate::risk::AccountState,
            as_of: NaiveDateTime,
        ) -> Result<Option<EntrySignal>, EvaluationError> {
            FRIDAY_EXPIRY.evaluate_entry(rules, snapshot, account, as_of)
        }

        fn evaluate_adjustment(
            &self,
            rules: &StrategyRules,
            closed: &Position,
            adjustment: Adjustment,
            snapshot: &MarketSnapshot,
            account: &crate::risk::AccountState,
            as_of: NaiveDateTime,
        ) -> Result<Option<EntrySignal>, EvaluationError> {
            let signal = FRIDAY_EXPIRY
                .evaluate_adjustment(rules, closed, adjustment, snapshot, account, as_of)?;
            Ok(signal.map(|mut s| {
                s.capital_per_contract = dec!(1_000_000);
                s.max_loss_per_contract = dec!(1_000_000);
                s
            }))
        }
    }

    /// Sells a 90/110 strangle for a 300 credit expiring in 30 days, and
    /// converts into a 5-wide vertical at the tested short strike.
    struct ScriptedStrangle;

    impl StrategyAnalyzer for ScriptedStrangle {
        fn evaluate_entry(
            &self,
            rules: &StrategyRules,
            snapshot: &MarketSnapshot,
            _account: &crate::risk::AccountState,
            as_of: NaiveDateTime,
        ) -> Result<Option<EntrySignal>, EvaluationError> {
            let expiration = as_of.date() + Duration::days(30);
            Ok(Some(EntrySignal {
                strategy: rules.kind(),
                symbol: snapshot.symbol.clone(),
                structure: Structure::Strangle,
                legs: vec![
                    PositionLeg::new(OptionType::Put, 90.0, expiration, -1),
                    PositionLeg::new(OptionType::Call, 110.0, expiration, -1),
                ],
                expiration,
                contracts: 1,
                entry_value_per_contract: dec!(300),
                capital_per_contract: dec!(2_000),
                max_loss_per_contract: dec!(2_000),
                underlying_price: snapshot.bar.open,
                roll_count: 0,
            }))
        }

        fn evaluate_adjustment(
            &self,
            rules: &StrategyRules,
            closed: &Position,
            adjustment: Adjustment,
            snapshot: &MarketSnapshot,
            _account: &crate::risk::AccountState,
            _as_of: NaiveDateTime,
        ) -> Result<Option<EntrySignal>, EvaluationError> {
            let Adjustment::Convert { side } = adjustment else {
                return Ok(None);
            };
            let Some(short) = closed.short_strike(side) else {
                return Ok(None);
            };
            let long = match side {
                OptionType::Call => short + 5.0,
                OptionType::Put => short - 5.0,
            };
            Ok(Some(EntrySignal {
                strategy: rules.kind(),
                symbol: snapshot.symbol.clone(),
                structure: Structure::Vertical,
                legs: vec![
                    PositionLeg::new(side, short, closed.expiration, -1),
                    PositionLeg::new(side, long, closed.expiration, 1),
                ],
                expiration: closed.expiration,
                contracts: 1,
                entry_value_per_contract: dec!(150),
                capital_per_contract: dec!(350),
                max_loss_per_contract: dec!(350),
                underlying_price: snapshot.bar.close,
                roll_count: closed.roll_count,
            }))
        }
    }

    /// Only LT112 on Mondays, with exits that never fire before expiration.
    fn expiry_only_config() -> BacktestConfig {
        let mut rules = StrategyRules::defaults(StrategyKind::Lt112);
        if let StrategyRules::Lt112(r) = &mut rules {
            r.entry.weekdays = vec![Weekday::Mon];
            r.exit.profit_target = 10.0;
            r.exit.stop_loss = 10.0;
            r.management_dte = 0;
        }
        BacktestConfig {
            strategies: vec![rules],
            ..Default::default()
        }
    }

    #[test]
    fn test_credit_retained_at_expiration() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 8);
        let engine = BacktestEngine::with_analyzer(expiry_only_config(), FRIDAY_EXPIRY).unwrap();
        let result = engine
            .run(&flat_market(start, end), start, end, &symbols(&["SPY"]))
            .unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::Expiration);
        assert_eq!(trade.exit_date, end);
        assert_eq!(trade.entry_value, dec!(500));
        assert_eq!(trade.exit_value, Decimal::ZERO);
        assert_eq!(trade.pnl, dec!(500));
        assert_eq!(trade.pnl, trade.exit_value - trade.cost_basis());

        assert_eq!(result.final_capital, dec!(35_500));
        let last = result.equity_curve.last().unwrap();
        assert_eq!(last.capital, dec!(35_500));
        assert_eq!(last.open_positions, 0);
        assert_eq!(result.equity_curve.len(), 5);
        let daily_sum: Decimal = result.equity_curve.iter().map(|r| r.daily_pnl).sum();
        assert_eq!(daily_sum, dec!(500));
    }

    #[test]
    fn test_expiry_frees_capacity_for_same_day_entry() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 15);
        let mut config = expiry_only_config();
        config.correlation_limit = 1;
        // Monday to Monday: each expiry lands on the next entry day.
        let weekly = ScriptedAnalyzer { expires_in: 7 };
        let engine = BacktestEngine::with_analyzer(config, weekly).unwrap();
        let result = engine
            .run(&flat_market(start, end), start, end, &symbols(&["SPY"]))
            .unwrap();

        assert_eq!(result.rejections.total(), 0);
        assert_eq!(result.entry_signals, 2);
        assert_eq!(result.trades.len(), 2);

        let expired = &result.trades[0];
        assert_eq!(expired.exit_reason, ExitReason::Expiration);
        assert_eq!(expired.exit_date, d(2024, 3, 11));
        assert_eq!(expired.pnl, dec!(500));

        let reentry = &result.trades[1];
        assert_eq!(reentry.entry_date, d(2024, 3, 11));
        assert_eq!(reentry.exit_reason, ExitReason::EndOfPeriod);

        let monday = result
            .equity_curve
            .iter()
            .find(|r| r.date == d(2024, 3, 11))
            .unwrap();
        assert_eq!(monday.open_positions, 1);
        assert_eq!(monday.realized_capital, dec!(35_500));
    }

    #[test]
    fn test_invalid_signal_does_not_abort_run() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 8);
        let mut data = flat_market(start, end);
        for date in TradingCalendar::new(start, end).unwrap().days() {
            data.insert("MCL", *date, DailyBar::flat(75.0, 0.35));
        }
        let engine =
            BacktestEngine::with_analyzer(expiry_only_config(), UnpricedSymbol("MCL")).unwrap();
        let result = engine
            .run(&data, start, end, &symbols(&["MCL", "SPY"]))
            .unwrap();

        assert_eq!(result.evaluation_errors, 1);
        assert_eq!(result.rejections.total(), 0);
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].symbol, "SPY");
        assert_eq!(result.trades[0].pnl, dec!(500));
        assert_eq!(result.equity_curve.len(), 5);
    }

    #[test]
    fn test_expiry_without_bar_settles_at_last_mark() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 8);
        let mut data = InMemoryMarketData::new();
        for date in TradingCalendar::new(start, end).unwrap().days() {
            if *date != end {
                data.insert("SPY", *date, DailyBar::flat(100.0, 0.20));
            }
            data.insert("MCL", *date, DailyBar::flat(75.0, 0.35));
            data.insert("VIX", *date, DailyBar::flat(16.0, 0.0));
        }
        let mut config = expiry_only_config();
        config.strategies[0].entry_mut().symbols = vec!["SPY".to_string()];
        let engine = BacktestEngine::with_analyzer(config, FRIDAY_EXPIRY).unwrap();
        let result = engine
            .run(&data, start, end, &symbols(&["MCL", "SPY"]))
            .unwrap();

        assert_eq!(result.skipped_symbol_days, 1);
        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::Expiration);
        assert_eq!(trade.exit_date, end);

        // Thursday's equity carries the last mark: capital + credit + mark.
        let thursday = &result.equity_curve[3];
        assert_eq!(thursday.date, d(2024, 3, 7));
        assert_eq!(trade.exit_value, thursday.capital - dec!(35_500));
        assert_eq!(result.equity_curve[4].open_positions, 0);
    }

    /// `expiry_only_config` with a three-day management window.
    fn rolling_config() -> BacktestConfig {
        let mut config = expiry_only_config();
        if let StrategyRules::Lt112(r) = &mut config.strategies[0] {
            r.management_dte = 3;
        }
        config
    }

    /// Flat SPY, except Wednesday 2024-03-06 opens at 91 (testing the 90
    /// short put) and closes back at 100.
    fn wednesday_test_market(start: NaiveDate, end: NaiveDate) -> InMemoryMarketData {
        let mut data = flat_market(start, end);
        data.insert("SPY", d(2024, 3, 6), bar(91.0, 100.0));
        data
    }

    #[test]
    fn test_tested_position_rolls() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 8);
        let engine = BacktestEngine::with_analyzer(rolling_config(), FRIDAY_EXPIRY).unwrap();
        let result = engine
            .run(&wednesday_test_market(start, end), start, end, &symbols(&["SPY"]))
            .unwrap();

        assert_eq!(result.rolls, 1);
        assert_eq!(result.conversions, 0);
        assert_eq!(result.trades.len(), 2);

        let rolled = &result.trades[0];
        assert_eq!(rolled.exit_reason, ExitReason::Rolled);
        assert_eq!(rolled.exit_date, d(2024, 3, 6));
        assert_eq!(rolled.roll_count, 0);

        // The replacement is untested at Friday's open and closes on DTE.
        let replacement = &result.trades[1];
        assert_eq!(replacement.entry_date, d(2024, 3, 6));
        assert_eq!(replacement.roll_count, 1);
        assert_eq!(replacement.exit_reason, ExitReason::ManagementDte);
        assert_eq!(replacement.exit_date, end);
    }

    #[test]
    fn test_rejected_roll_leaves_original_closed() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 8);
        let engine = BacktestEngine::with_analyzer(rolling_config(), OversizedRoll).unwrap();
        let result = engine
            .run(&wednesday_test_market(start, end), start, end, &symbols(&["SPY"]))
            .unwrap();

        assert_eq!(result.rolls, 0);
        assert_eq!(result.rejections.buying_power, 1);
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::Rolled);

        let wednesday = &result.equity_curve[2];
        assert_eq!(wednesday.date, d(2024, 3, 6));
        assert_eq!(wednesday.open_positions, 0);
        assert_eq!(wednesday.used_bp, Decimal::ZERO);
        assert_eq!(
            result.final_capital,
            result.initial_capital + result.trades[0].pnl
        );
    }

    #[test]
    fn test_strangle_tested_on_both_sides_converts() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 6);
        let mut rules = StrategyRules::defaults(StrategyKind::Strangle);
        if let StrategyRules::Strangle(r) = &mut rules {
            r.entry.weekdays = vec![Weekday::Mon];
            r.exit.profit_target = 10.0;
            r.exit.stop_loss = 10.0;
            // Entered with 30 DTE: the window opens on Wednesday.
            r.management_dte = 29;
            r.tested_distance = 0.15;
        }
        let config = BacktestConfig {
            strategies: vec![rules],
            ..Default::default()
        };
        // Wednesday opens inside both tested zones, then closes at 90,
        // away from the call side the vertical keeps.
        let mut data = flat_market(start, end);
        data.insert("SPY", end, bar(103.0, 90.0));

        let engine = BacktestEngine::with_analyzer(config, ScriptedStrangle).unwrap();
        let result = engine.run(&data, start, end, &symbols(&["SPY"])).unwrap();

        assert_eq!(result.conversions, 1);
        assert_eq!(result.rolls, 0);
        assert_eq!(result.trades.len(), 2);

        let converted = &result.trades[0];
        assert_eq!(converted.structure, Structure::Strangle);
        assert_eq!(converted.exit_reason, ExitReason::Converted);
        assert_eq!(converted.exit_date, end);

        let vertical = &result.trades[1];
        assert_eq!(vertical.structure, Structure::Vertical);
        assert_eq!(vertical.entry_date, end);
        assert_eq!(vertical.exit_reason, ExitReason::ManagementDte);
    }

    #[test]
    fn test_zero_dte_time_defense() {
        let start = d(2024, 3, 7);
        let end = d(2024, 3, 8); // Friday
        let mut rules = StrategyRules::defaults(StrategyKind::ZeroDte);
        if let StrategyRules::ZeroDte(r) = &mut rules {
            r.exit.stop_loss = 1_000.0;
        }
        let config = BacktestConfig {
            initial_capital: dec!(45_000),
            strategies: vec![rules],
            ..Default::default()
        };
        // Flat open sells puts; the close finishes far below any short strike.
        let mut data = flat_market(start, end);
        data.insert("SPY", end, bar(100.0, 90.0));

        let engine = BacktestEngine::new(config).unwrap();
        let result = engine.run(&data, start, end, &symbols(&["SPY"])).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.strategy, StrategyKind::ZeroDte);
        assert_eq!(trade.entry_date, end);
        assert_eq!(trade.exit_date, end);
        assert_eq!(trade.exit_reason, ExitReason::TimeDefense);
        assert!(trade.pnl < Decimal::ZERO);
    }

    #[test]
    fn test_phase_change_applies_next_day() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 8);
        let config = BacktestConfig {
            initial_capital: dec!(39_800),
            ..expiry_only_config()
        };
        // Expires Wednesday; the 500 credit lifts capital past 40,000.
        let engine =
            BacktestEngine::with_analyzer(config, ScriptedAnalyzer { expires_in: 2 }).unwrap();
        let result = engine
            .run(&flat_market(start, end), start, end, &symbols(&["SPY"]))
            .unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.phase_changes, 1);

        let wednesday = &result.equity_curve[2];
        assert_eq!(wednesday.date, d(2024, 3, 6));
        assert_eq!(wednesday.realized_capital, dec!(40_300));
        assert_eq!(wednesday.phase, 1);

        let thursday = &result.equity_curve[3];
        assert_eq!(thursday.phase, 2);
        assert!(thursday.bp_ceiling > wednesday.bp_ceiling);
    }

    #[test]
    fn test_no_eligible_weekday_means_no_trades() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 7); // Monday to Thursday
        let mut config = BacktestConfig::default();
        config.initial_capital = dec!(45_000);
        config.strategies = vec![StrategyRules::defaults(StrategyKind::ZeroDte)];
        let engine = BacktestEngine::new(config).unwrap();
        let result = engine
            .run(&flat_market(start, end), start, end, &symbols(&["SPY"]))
            .unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.entry_signals, 0);
        assert!(result
            .equity_curve
            .iter()
            .all(|r| r.capital == dec!(45_000) && r.daily_pnl.is_zero()));
    }

    #[test]
    fn test_data_gap_skips_day() {
        let start = d(2024, 3, 4);
        let end = d(2024, 3, 8);
        let mut data = InMemoryMarketData::new();
        for date in [d(2024, 3, 4), d(2024, 3, 5), d(2024, 3, 7), d(2024, 3, 8)] {
            data.insert("SPY", date, DailyBar::flat(100.0, 0.20));
        }
        let engine = BacktestEngine::with_analyzer(expiry_only_config(), FRIDAY_EXPIRY).unwrap();
        let result = engine.run(&data, start, end, &symbols(&["SPY"])).unwrap();

        assert_eq!(result.data_gaps, 1);
        assert_eq!(result.equity_curve.len(), 4);
        assert!(result.equity_curve.iter().all(|r| r.date != d(2024, 3, 6)));
        // No VIX series: average IV x 100.
        assert!((result.equity_curve[0].vix - 20.0).abs() < 1e-9);
        assert_eq!(result.equity_curve[0].regime, VolatilityRegime::Elevated);
    }

    #[test]
    fn test_config_errors_are_fatal() {
        let engine = BacktestEngine::new(BacktestConfig::default()).unwrap();
        let data = InMemoryMarketData::new();

        let inverted = engine.run(&data, d(2024, 3, 8), d(2024, 3, 4), &symbols(&["SPY"]));
        assert!(matches!(
            inverted,
            Err(EngineError::Config(ConfigError::InvalidDateRange { .. }))
        ));

        let unmapped = engine.run(&data, d(2024, 3, 4), d(2024, 3, 8), &symbols(&["ACME"]));
        assert!(matches!(
            unmapped,
            Err(EngineError::Config(ConfigError::UnmappedSymbol(_)))
        ));
    }

    /// Three months of wandering prices for an equity, an energy and a
    /// metals symbol.
    fn synthetic_market(start: NaiveDate, end: NaiveDate) -> InMemoryMarketData {
        let mut data = InMemoryMarketData::new();
        for (i, date) in TradingCalendar::new(start, end).unwrap().days().iter().enumerate() {
            let t = i as f64;
            let spy = 480.0 + 15.0 * (t / 9.0).sin() + 0.3 * t;
            let mcl = 75.0 + 6.0 * (t / 5.0).cos();
            let mgc = 2000.0 - 2.0 * t + 30.0 * (t / 13.0).sin();
            let mut bar = DailyBar::flat(spy, 0.16 + 0.04 * (t / 7.0).sin().abs());
            bar.close = spy * (1.0 + 0.004 * (t / 3.0).sin());
            data.insert("SPY", *date, bar);
            data.insert("MCL", *date, DailyBar::flat(mcl, 0.35));
            data.insert("MGC", *date, DailyBar::flat(mgc, 0.15));
            data.insert("VIX", *date, DailyBar::flat(14.0 + 8.0 * (t / 11.0).sin().abs(), 0.0));
        }
        data
    }

    #[test]
    fn test_runs_are_deterministic() {
        let start = d(2024, 1, 2);
        let end = d(2024, 4, 30);
        let data = synthetic_market(start, end);
        let universe = symbols(&["SPY", "MCL", "MGC"]);
        let mut config = BacktestConfig::default();
        config.initial_capital = dec!(45_000);

        let engine = BacktestEngine::new(config).unwrap();
        let first = engine.run(&data, start, end, &universe).unwrap();
        let second = engine.run(&data, start, end, &universe).unwrap();

        assert!(!first.trades.is_empty());
        assert_eq!(
            serde_json::to_string(&first.trades).unwrap(),
            serde_json::to_string(&second.trades).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&first.equity_curve).unwrap(),
            serde_json::to_string(&second.equity_curve).unwrap()
        );

        for trade in &first.trades {
            assert_eq!(trade.pnl, trade.exit_value - trade.cost_basis());
            assert!(trade.exit_date >= trade.entry_date);
        }
        for record in &first.equity_curve {
            assert!(record.open_positions <= engine.config().max_positions);
        }
        let realized: Decimal = first.initial_capital + first.total_pnl();
        assert_eq!(realized, first.final_capital);
    }

    #[test]
    fn test_run_batch_matches_single_runs() {
        let start = d(2024, 1, 2);
        let end = d(2024, 2, 29);
        let data = synthetic_market(start, end);
        let universe = symbols(&["SPY", "MCL", "MGC"]);

        let mut small = BacktestConfig::default();
        small.name = "small".to_string();
        let mut large = BacktestConfig::default();
        large.name = "large".to_string();
        large.initial_capital = dec!(80_000);

        let engines = vec![
            BacktestEngine::new(small).unwrap(),
            BacktestEngine::new(large).unwrap(),
        ];
        let batch = BacktestEngine::run_batch(&engines, &data, start, end, &universe);
        assert_eq!(batch.len(), 2);

        let single = engines[1].run(&data, start, end, &universe).unwrap();
        let batched = batch[1].as_ref().unwrap();
        assert_eq!(batched.name, "large");
        assert_eq!(
            serde_json::to_string(&batched.trades).unwrap(),
            serde_json::to_string(&single.trades).unwrap()
        );
    }
}
