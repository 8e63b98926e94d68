//! Letter grade and target check for a finished run.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::calculator::PerformanceMetrics;
use super::config::GradingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 85.0 => Self::A,
            s if s >= 70.0 => Self::B,
            s if s >= 55.0 => Self::C,
            s if s >= 40.0 => Self::D,
            _ => Self::F,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        };
        f.write_str(s)
    }
}

/// Component scores (0-100), the weighted total and the grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub return_score: f64,
    pub risk_score: f64,
    pub consistency_score: f64,
    pub overall_score: f64,
    pub grade: Grade,
    pub meets_return_target: bool,
    pub within_drawdown_tolerance: bool,
}

impl PerformanceReport {
    pub fn grade(metrics: &PerformanceMetrics, config: &GradingConfig) -> Self {
        let unit = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) * 100.0 } else { 0.0 };

        let return_score = unit(metrics.annualized_return / config.annual_return_target);
        let risk_score = unit(1.0 - metrics.max_drawdown.abs() / config.max_drawdown_tolerance);
        let consistency_score = unit(metrics.consistency_score);

        let total_weight = config.total_weight();
        let overall_score = if total_weight > 0.0 {
            (return_score * config.return_weight
                + risk_score * config.risk_weight
                + consistency_score * config.consistency_weight)
                / total_weight
        } else {
            0.0
        };

        Self {
            return_score,
            risk_score,
            consistency_score,
            overall_score,
            grade: Grade::from_score(overall_score),
            meets_return_target: metrics.annualized_return >= config.annual_return_target,
            within_drawdown_tolerance: metrics.max_drawdown.abs() <= config.max_drawdown_tolerance,
        }
    }

    pub fn meets_targets(&self) -> bool {
        self.meets_return_target && self.within_drawdown_tolerance
    }
}

/// Human-readable run summary.
pub fn summary(name: &str, metrics: &PerformanceMetrics, report: &PerformanceReport) -> String {
    let mut out = format!(
        r#"
Performance Summary: {}
===================
Period: {} trading days
Capital: ${} -> ${}

Returns:
  Total Return: {:.2}%
  Annualized Return: {:.2}%
  Annualized Volatility: {:.2}%

Risk-Adjusted:
  Sharpe Ratio: {:.2}
  Sortino Ratio: {:.2}
  Calmar Ratio: {:.2}

Risk:
  Max Drawdown: {:.2}%
  Longest Drawdown: {} days
  VaR 95/99: {:.2}% / {:.2}%
  CVaR 95/99: {:.2}% / {:.2}%

Trades:
  Total: {} ({} wins, {} losses)
  Win Rate: {:.1}%
  Profit Factor: {:.2}
  Expectancy: ${}
  Avg Win / Loss: ${} / ${}
  Avg Holding: {:.1} days
  Longest Losing Streak: {}
"#,
        name,
        metrics.trading_days,
        metrics.initial_capital,
        metrics.final_equity,
        metrics.total_return * 100.0,
        metrics.annualized_return * 100.0,
        metrics.annualized_volatility * 100.0,
        metrics.sharpe_ratio,
        metrics.sortino_ratio,
        metrics.calmar_ratio,
        metrics.max_drawdown * 100.0,
        metrics.max_drawdown_duration_days,
        metrics.var_95 * 100.0,
        metrics.var_99 * 100.0,
        metrics.cvar_95 * 100.0,
        metrics.cvar_99 * 100.0,
        metrics.total_trades,
        metrics.winning_trades,
        metrics.losing_trades,
        metrics.win_rate * 100.0,
        metrics.profit_factor,
        metrics.expectancy,
        metrics.avg_win,
        metrics.avg_loss,
        metrics.avg_holding_days,
        metrics.longest_losing_streak,
    );

    if !metrics.by_strategy.is_empty() {
        out.push_str("\nBy Strategy:\n");
        for (kind, stats) in &metrics.by_strategy {
            out.push_str(&format!(
                "  {:<10} {:>4} trades  {:>5.1}% wins  ${} ({:.1}% of P&L)\n",
                kind.as_str(),
                stats.trades,
                stats.win_rate * 100.0,
                stats.total_pnl,
                stats.pnl_share * 100.0,
            ));
        }
    }

    out.push_str(&format!(
        "\nGrade: {} ({:.1}/100; return {:.0}, risk {:.0}, consistency {:.0})\nTargets met: {}\n",
        report.grade,
        report.overall_score,
        report.return_score,
        report.risk_score,
        report.consistency_score,
        if report.meets_targets() { "yes" } else { "no" },
    ));
    out
}
