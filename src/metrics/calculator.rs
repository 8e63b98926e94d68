//! Performance metrics calculator.
//!
//! Works on the closed-trade history and the daily equity series of one
//! run. Every percentage-style field is a fraction (0.10 = 10%), and every
//! ratio goes through [`safe_ratio`] so no NaN or infinity reaches a report.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{BacktestResult, DailyEquityRecord, ExitReason, Trade};
use crate::strategy::StrategyKind;

use super::config::MetricsConfig;

/// Value reported for a ratio whose denominator is zero while its
/// numerator is positive (e.g. profit factor with no losing trades).
pub const RATIO_CAP: f64 = 99.0;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

const EPSILON: f64 = 1e-12;

/// Divide with sentinels: zero denominators give `RATIO_CAP` for a
/// positive numerator and 0 otherwise; results are clamped to
/// `[-RATIO_CAP, RATIO_CAP]`.
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if !numerator.is_finite() || !denominator.is_finite() {
        return 0.0;
    }
    if denominator.abs() < EPSILON {
        return if numerator > EPSILON { RATIO_CAP } else { 0.0 };
    }
    (numerator / denominator).clamp(-RATIO_CAP, RATIO_CAP)
}

fn to_f64(value: Decimal) -> f64 {
    value.try_into().unwrap_or(0.0)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Drawdown at one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub date: NaiveDate,
    /// `(equity - peak) / peak`, never positive.
    pub drawdown: f64,
}

/// A contiguous run of records below the running peak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPeriod {
    /// First record below the peak.
    pub start: NaiveDate,
    /// Last record below the peak (the last record overall if unrecovered).
    pub end: NaiveDate,
    pub trough: NaiveDate,
    /// Deepest drawdown in the period, never positive.
    pub depth: f64,
    pub duration_days: i64,
    pub recovered: bool,
}

/// Compounded return of one calendar bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodReturn {
    /// "2024", "2024-Q1" or "2024-03".
    pub period: String,
    pub start_equity: Decimal,
    pub end_equity: Decimal,
    pub return_fraction: f64,
}

/// Per-strategy slice of the trade history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyBreakdown {
    pub trades: usize,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    /// Share of the run's total P&L.
    pub pnl_share: f64,
}

/// Comprehensive performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    // Trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub profit_factor: f64,
    /// Average P&L per trade.
    pub expectancy: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub avg_holding_days: f64,
    pub exit_reasons: BTreeMap<ExitReason, usize>,

    // Returns and risk
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub trading_days: usize,
    pub total_return: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,
    pub cvar_99: f64,

    // Drawdown
    pub max_drawdown: f64,
    pub max_drawdown_duration_days: i64,
    pub drawdown_series: Vec<DrawdownPoint>,
    pub drawdown_periods: Vec<DrawdownPeriod>,

    // Calendar buckets
    pub monthly_returns: Vec<PeriodReturn>,
    pub quarterly_returns: Vec<PeriodReturn>,
    pub yearly_returns: Vec<PeriodReturn>,

    pub by_strategy: BTreeMap<StrategyKind, StrategyBreakdown>,

    // Heuristics
    pub longest_losing_streak: usize,
    pub longest_negative_day_streak: usize,
    /// Share of positive monthly buckets.
    pub consistency_score: f64,
}

/// Metrics calculator.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate all metrics. The initial capital is recovered from the
    /// first equity record (`capital - daily_pnl`).
    pub fn calculate(
        trades: &[Trade],
        equity: &[DailyEquityRecord],
        config: &MetricsConfig,
    ) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::default();
        Self::trade_statistics(trades, &mut metrics);
        Self::strategy_breakdown(trades, &mut metrics);
        metrics.longest_losing_streak = Self::longest_losing_streak(trades);

        let Some(first) = equity.first() else {
            return metrics;
        };
        let initial = first.capital - first.daily_pnl;
        let final_equity = equity.last().map(|r| r.capital).unwrap_or(initial);
        metrics.initial_capital = initial;
        metrics.final_equity = final_equity;
        metrics.trading_days = equity.len();

        let initial_f = to_f64(initial);
        let returns = Self::daily_returns(initial_f, equity);

        metrics.total_return = safe_ratio(to_f64(final_equity) - initial_f, initial_f);
        metrics.annualized_return =
            Self::annualized_return(initial_f, to_f64(final_equity), equity.len());
        metrics.annualized_volatility = Self::annualized_volatility(&returns);
        metrics.sharpe_ratio = Self::sharpe(&returns, config.risk_free_rate);
        metrics.sortino_ratio = Self::sortino(&returns, config.risk_free_rate);

        metrics.var_95 = Self::historical_var(&returns, 0.95);
        metrics.var_99 = Self::historical_var(&returns, 0.99);
        metrics.cvar_95 = Self::historical_cvar(&returns, 0.95);
        metrics.cvar_99 = Self::historical_cvar(&returns, 0.99);

        metrics.drawdown_series = Self::drawdown_series(equity);
        metrics.max_drawdown = metrics
            .drawdown_series
            .iter()
            .map(|p| p.drawdown)
            .fold(0.0, f64::min);
        metrics.drawdown_periods =
            Self::drawdown_periods(&metrics.drawdown_series, config.heuristics.min_drawdown_depth);
        metrics.max_drawdown_duration_days = metrics
            .drawdown_periods
            .iter()
            .map(|p| p.duration_days)
            .max()
            .unwrap_or(0);
        metrics.calmar_ratio = safe_ratio(metrics.annualized_return, metrics.max_drawdown.abs());

        metrics.monthly_returns = Self::bucket_returns(initial, equity, |d| {
            format!("{}-{:02}", d.year(), d.month())
        });
        metrics.quarterly_returns = Self::bucket_returns(initial, equity, |d| {
            format!("{}-Q{}", d.year(), (d.month() - 1) / 3 + 1)
        });
        metrics.yearly_returns = Self::bucket_returns(initial, equity, |d| d.year().to_string());

        metrics.longest_negative_day_streak =
            Self::longest_negative_day_streak(&returns, config.heuristics.flat_day_tolerance);
        metrics.consistency_score = Self::consistency(&metrics.monthly_returns);

        metrics
    }

    /// Convenience wrapper over a finished run.
    pub fn calculate_result(result: &BacktestResult, config: &MetricsConfig) -> PerformanceMetrics {
        Self::calculate(&result.trades, &result.equity_curve, config)
    }

    fn trade_statistics(trades: &[Trade], metrics: &mut PerformanceMetrics) {
        let total = trades.len();
        metrics.total_trades = total;
        if total == 0 {
            return;
        }

        let winners: Vec<Decimal> = trades.iter().filter(|t| t.pnl > Decimal::ZERO).map(|t| t.pnl).collect();
        let losers: Vec<Decimal> = trades.iter().filter(|t| t.pnl < Decimal::ZERO).map(|t| t.pnl).collect();

        metrics.winning_trades = winners.len();
        metrics.losing_trades = losers.len();
        metrics.win_rate = winners.len() as f64 / total as f64;

        metrics.gross_profit = winners.iter().copied().sum();
        metrics.gross_loss = losers.iter().copied().sum();
        metrics.total_pnl = trades.iter().map(|t| t.pnl).sum();
        metrics.profit_factor =
            safe_ratio(to_f64(metrics.gross_profit), to_f64(metrics.gross_loss).abs());
        metrics.expectancy = (metrics.total_pnl / Decimal::from(total)).round_dp(2);

        if !winners.is_empty() {
            metrics.avg_win = (metrics.gross_profit / Decimal::from(winners.len())).round_dp(2);
        }
        if !losers.is_empty() {
            metrics.avg_loss = (metrics.gross_loss / Decimal::from(losers.len())).round_dp(2);
        }
        metrics.largest_win = winners.iter().copied().max().unwrap_or(Decimal::ZERO);
        metrics.largest_loss = losers.iter().copied().min().unwrap_or(Decimal::ZERO);

        metrics.avg_holding_days =
            trades.iter().map(|t| t.holding_days as f64).sum::<f64>() / total as f64;
        for trade in trades {
            *metrics.exit_reasons.entry(trade.exit_reason).or_insert(0) += 1;
        }
    }

    fn strategy_breakdown(trades: &[Trade], metrics: &mut PerformanceMetrics) {
        let total_pnl = to_f64(trades.iter().map(|t| t.pnl).sum());
        let mut wins: BTreeMap<StrategyKind, usize> = BTreeMap::new();

        for trade in trades {
            let entry = metrics.by_strategy.entry(trade.strategy).or_default();
            entry.trades += 1;
            entry.total_pnl += trade.pnl;
            if trade.is_winner() {
                *wins.entry(trade.strategy).or_insert(0) += 1;
            }
        }
        for (kind, stats) in metrics.by_strategy.iter_mut() {
            let won = wins.get(kind).copied().unwrap_or(0);
            stats.win_rate = won as f64 / stats.trades as f64;
            stats.pnl_share = safe_ratio(to_f64(stats.total_pnl), total_pnl);
        }
    }

    /// Daily returns; the first record is measured against the initial
    /// capital.
    pub fn daily_returns(initial: f64, equity: &[DailyEquityRecord]) -> Vec<f64> {
        let mut previous = initial;
        equity
            .iter()
            .map(|record| {
                let current = to_f64(record.capital);
                let r = if previous.abs() < EPSILON {
                    0.0
                } else {
                    current / previous - 1.0
                };
                previous = current;
                finite_or_zero(r)
            })
            .collect()
    }

    /// CAGR assuming 252 trading days per year.
    pub fn annualized_return(initial: f64, final_equity: f64, days: usize) -> f64 {
        if initial <= 0.0 || days == 0 {
            return 0.0;
        }
        let growth = final_equity / initial;
        if growth <= 0.0 {
            return -1.0;
        }
        finite_or_zero(growth.powf(TRADING_DAYS_PER_YEAR / days as f64) - 1.0)
    }

    fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    fn sample_std(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let mean = Self::mean(values);
        let var = values.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        var.sqrt()
    }

    pub fn annualized_volatility(returns: &[f64]) -> f64 {
        Self::sample_std(returns) * TRADING_DAYS_PER_YEAR.sqrt()
    }

    pub fn sharpe(returns: &[f64], risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let excess = Self::mean(returns) - risk_free_rate / TRADING_DAYS_PER_YEAR;
        safe_ratio(excess * TRADING_DAYS_PER_YEAR.sqrt(), Self::sample_std(returns))
    }

    /// Sortino ratio with downside deviation below the daily risk-free rate.
    pub fn sortino(returns: &[f64], risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
        let excess = Self::mean(returns) - daily_rf;
        let downside = returns
            .iter()
            .map(|r| (r - daily_rf).min(0.0).powi(2))
            .sum::<f64>()
            / returns.len() as f64;
        safe_ratio(excess * TRADING_DAYS_PER_YEAR.sqrt(), downside.sqrt())
    }

    fn tail(returns: &[f64], confidence: f64) -> Vec<f64> {
        let mut sorted: Vec<f64> = returns.iter().copied().filter(|r| r.is_finite()).collect();
        if sorted.is_empty() {
            return sorted;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let index = (((1.0 - confidence) * sorted.len() as f64) as usize).min(sorted.len() - 1);
        sorted.truncate(index + 1);
        sorted
    }

    /// Historical VaR as a positive loss fraction.
    pub fn historical_var(returns: &[f64], confidence: f64) -> f64 {
        Self::tail(returns, confidence)
            .last()
            .map(|r| (-r).max(0.0))
            .unwrap_or(0.0)
    }

    /// Average loss at or beyond the VaR quantile, as a positive fraction.
    pub fn historical_cvar(returns: &[f64], confidence: f64) -> f64 {
        let tail = Self::tail(returns, confidence);
        (-Self::mean(&tail)).max(0.0)
    }

    /// Running-peak drawdown of every record.
    pub fn drawdown_series(equity: &[DailyEquityRecord]) -> Vec<DrawdownPoint> {
        let mut peak = f64::MIN;
        equity
            .iter()
            .map(|record| {
                let value = to_f64(record.capital);
                peak = peak.max(value);
                let drawdown = if peak > 0.0 {
                    ((value - peak) / peak).min(0.0)
                } else {
                    0.0
                };
                DrawdownPoint {
                    date: record.date,
                    drawdown: finite_or_zero(drawdown),
                }
            })
            .collect()
    }

    /// Contiguous runs of negative drawdown. Periods shallower than
    /// `min_depth` are left out.
    pub fn drawdown_periods(series: &[DrawdownPoint], min_depth: f64) -> Vec<DrawdownPeriod> {
        let mut periods = Vec::new();
        let mut current: Option<DrawdownPeriod> = None;

        for point in series {
            if point.drawdown < 0.0 {
                let period = current.get_or_insert_with(|| DrawdownPeriod {
                    start: point.date,
                    end: point.date,
                    trough: point.date,
                    depth: 0.0,
                    duration_days: 0,
                    recovered: false,
                });
                period.end = point.date;
                period.duration_days = (point.date - period.start).num_days();
                if point.drawdown < period.depth {
                    period.depth = point.drawdown;
                    period.trough = point.date;
                }
            } else if let Some(mut period) = current.take() {
                period.recovered = true;
                periods.push(period);
            }
        }
        if let Some(period) = current {
            periods.push(period);
        }

        periods.retain(|p| p.depth.abs() >= min_depth);
        periods
    }

    /// Compounded return per calendar bucket, each measured against the
    /// previous bucket's closing equity (the initial capital for the first).
    pub fn bucket_returns<F>(
        initial: Decimal,
        equity: &[DailyEquityRecord],
        key: F,
    ) -> Vec<PeriodReturn>
    where
        F: Fn(NaiveDate) -> String,
    {
        let mut buckets: Vec<PeriodReturn> = Vec::new();
        let mut base = initial;

        for record in equity {
            let period = key(record.date);
            match buckets.last_mut() {
                Some(bucket) if bucket.period == period => {
                    bucket.end_equity = record.capital;
                }
                _ => {
                    if let Some(previous) = buckets.last() {
                        base = previous.end_equity;
                    }
                    buckets.push(PeriodReturn {
                        period,
                        start_equity: base,
                        end_equity: record.capital,
                        return_fraction: 0.0,
                    });
                }
            }
        }

        for bucket in &mut buckets {
            let start = to_f64(bucket.start_equity);
            bucket.return_fraction = safe_ratio(to_f64(bucket.end_equity) - start, start);
        }
        buckets
    }

    /// Longest run of consecutive losing trades, in close order.
    pub fn longest_losing_streak(trades: &[Trade]) -> usize {
        let mut longest = 0;
        let mut current = 0;
        for trade in trades {
            if trade.pnl < Decimal::ZERO {
                current += 1;
                longest = longest.max(current);
            } else {
                current = 0;
            }
        }
        longest
    }

    /// Longest run of daily returns below `-tolerance`.
    pub fn longest_negative_day_streak(returns: &[f64], tolerance: f64) -> usize {
        let mut longest = 0;
        let mut current = 0;
        for r in returns {
            if *r < -tolerance {
                current += 1;
                longest = longest.max(current);
            } else {
                current = 0;
            }
        }
        longest
    }

    pub fn consistency(buckets: &[PeriodReturn]) -> f64 {
        if buckets.is_empty() {
            return 0.0;
        }
        buckets.iter().filter(|b| b.return_fraction > 0.0).count() as f64 / buckets.len() as f64
    }
}
