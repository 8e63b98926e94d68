//! Run artifacts.
//!
//! Writes a finished run into an output directory:
//! - `trades.csv` / `trades.json`
//! - `equity.csv` / `equity.json`
//! - `metrics.json` (metrics plus grade)
//! - `summary.txt`

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::backtest::{BacktestResult, DailyEquityRecord, Trade};
use crate::metrics::{summary, PerformanceMetrics, PerformanceReport};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn money(value: Decimal) -> f64 {
    value.try_into().unwrap_or(0.0)
}

/// Trade history as a frame, one row per closed position.
pub fn trades_frame(trades: &[Trade]) -> Result<DataFrame, ExportError> {
    let df = DataFrame::new(vec![
        Series::new("position_id".into(), trades.iter().map(|t| t.position_id).collect::<Vec<_>>()).into(),
        Series::new("strategy".into(), trades.iter().map(|t| t.strategy.as_str()).collect::<Vec<_>>()).into(),
        Series::new("symbol".into(), trades.iter().map(|t| t.symbol.as_str()).collect::<Vec<_>>()).into(),
        Series::new("structure".into(), trades.iter().map(|t| format!("{:?}", t.structure)).collect::<Vec<_>>()).into(),
        Series::new("contracts".into(), trades.iter().map(|t| t.contracts).collect::<Vec<_>>()).into(),
        Series::new("entry_date".into(), trades.iter().map(|t| t.entry_date.to_string()).collect::<Vec<_>>()).into(),
        Series::new("exit_date".into(), trades.iter().map(|t| t.exit_date.to_string()).collect::<Vec<_>>()).into(),
        Series::new("entry_value".into(), trades.iter().map(|t| money(t.entry_value)).collect::<Vec<_>>()).into(),
        Series::new("exit_value".into(), trades.iter().map(|t| money(t.exit_value)).collect::<Vec<_>>()).into(),
        Series::new("pnl".into(), trades.iter().map(|t| money(t.pnl)).collect::<Vec<_>>()).into(),
        Series::new("exit_reason".into(), trades.iter().map(|t| format!("{:?}", t.exit_reason)).collect::<Vec<_>>()).into(),
        Series::new("holding_days".into(), trades.iter().map(|t| t.holding_days).collect::<Vec<_>>()).into(),
        Series::new("capital_required".into(), trades.iter().map(|t| money(t.capital_required)).collect::<Vec<_>>()).into(),
        Series::new("max_loss".into(), trades.iter().map(|t| money(t.max_loss)).collect::<Vec<_>>()).into(),
        Series::new("roll_count".into(), trades.iter().map(|t| t.roll_count).collect::<Vec<_>>()).into(),
    ])?;
    Ok(df)
}

/// Daily equity series as a frame.
pub fn equity_frame(equity: &[DailyEquityRecord]) -> Result<DataFrame, ExportError> {
    let df = DataFrame::new(vec![
        Series::new("date".into(), equity.iter().map(|r| r.date.to_string()).collect::<Vec<_>>()).into(),
        Series::new("capital".into(), equity.iter().map(|r| money(r.capital)).collect::<Vec<_>>()).into(),
        Series::new("daily_pnl".into(), equity.iter().map(|r| money(r.daily_pnl)).collect::<Vec<_>>()).into(),
        Series::new("open_positions".into(), equity.iter().map(|r| r.open_positions as u32).collect::<Vec<_>>()).into(),
        Series::new("phase".into(), equity.iter().map(|r| r.phase as u32).collect::<Vec<_>>()).into(),
        Series::new("realized_capital".into(), equity.iter().map(|r| money(r.realized_capital)).collect::<Vec<_>>()).into(),
        Series::new("used_bp".into(), equity.iter().map(|r| money(r.used_bp)).collect::<Vec<_>>()).into(),
        Series::new("bp_ceiling".into(), equity.iter().map(|r| money(r.bp_ceiling)).collect::<Vec<_>>()).into(),
        Series::new("vix".into(), equity.iter().map(|r| r.vix).collect::<Vec<_>>()).into(),
        Series::new("regime".into(), equity.iter().map(|r| format!("{:?}", r.regime)).collect::<Vec<_>>()).into(),
    ])?;
    Ok(df)
}

pub fn write_csv(df: &mut DataFrame, path: &Path) -> Result<(), ExportError> {
    let file = File::create(path).map_err(io_error(path))?;
    CsvWriter::new(file).include_header(true).finish(df)?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<(), ExportError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n").map_err(io_error(path))?;
    writer.flush().map_err(io_error(path))?;
    Ok(())
}

#[derive(Serialize)]
struct MetricsArtifact<'a> {
    name: &'a str,
    metrics: &'a PerformanceMetrics,
    report: &'a PerformanceReport,
}

/// Write every artifact of a run into `dir`, creating it if needed.
/// Returns the written paths.
pub fn export_run(
    result: &BacktestResult,
    metrics: &PerformanceMetrics,
    report: &PerformanceReport,
    dir: &Path,
) -> Result<Vec<PathBuf>, ExportError> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;
    let mut written = Vec::new();

    let path = dir.join("trades.csv");
    write_csv(&mut trades_frame(&result.trades)?, &path)?;
    written.push(path);

    let path = dir.join("trades.json");
    write_json(&result.trades, &path)?;
    written.push(path);

    let path = dir.join("equity.csv");
    write_csv(&mut equity_frame(&result.equity_curve)?, &path)?;
    written.push(path);

    let path = dir.join("equity.json");
    write_json(&result.equity_curve, &path)?;
    written.push(path);

    let path = dir.join("metrics.json");
    write_json(
        &MetricsArtifact {
            name: &result.name,
            metrics,
            report,
        },
        &path,
    )?;
    written.push(path);

    let path = dir.join("summary.txt");
    fs::write(&path, summary(&result.name, metrics, report)).map_err(io_error(&path))?;
    written.push(path);

    info!(dir = %dir.display(), files = written.len(), "exported run artifacts");
    Ok(written)
}

/// Output subdirectory names for a batch of runs: each config file's stem
/// plus its run name. Names that still repeat get the run's position
/// (1-based) appended.
pub fn run_dir_names<P: AsRef<Path>>(runs: &[(P, &str)]) -> Vec<String> {
    let base: Vec<String> = runs
        .iter()
        .map(|(path, name)| {
            let stem = path
                .as_ref()
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("config");
            if stem == *name {
                stem.to_string()
            } else {
                format!("{}-{}", stem, name)
            }
        })
        .collect();

    base.iter()
        .enumerate()
        .map(|(i, dir)| {
            if base.iter().filter(|d| *d == dir).count() > 1 {
                format!("{}-{}", dir, i + 1)
            } else {
                dir.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{ExitReason, Structure};
    use crate::metrics::{GradingConfig, MetricsCalculator, MetricsConfig};
    use crate::regime::VolatilityRegime;
    use crate::strategy::StrategyKind;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn sample_trade() -> Trade {
        Trade {
            position_id: 1,
            strategy: StrategyKind::Lt112,
            symbol: "SPY".to_string(),
            structure: Structure::Vertical,
            contracts: 1,
            entry_date: d(6),
            exit_date: d(8),
            entry_value: dec!(500),
            exit_value: Decimal::ZERO,
            pnl: dec!(500),
            exit_reason: ExitReason::Expiration,
            holding_days: 2,
            capital_required: dec!(500),
            max_loss: dec!(500),
            roll_count: 0,
        }
    }

    fn sample_equity() -> Vec<DailyEquityRecord> {
        vec![DailyEquityRecord {
            date: d(8),
            capital: dec!(35_500),
            daily_pnl: dec!(500),
            open_positions: 0,
            phase: 1,
            realized_capital: dec!(35_500),
            used_bp: Decimal::ZERO,
            bp_ceiling: dec!(15_975),
            vix: 14.0,
            regime: VolatilityRegime::Normal,
        }]
    }

    #[test]
    fn test_trades_frame_shape() {
        let df = trades_frame(&[sample_trade(), sample_trade()]).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 15);
        let pnl = df.column("pnl").unwrap().f64().unwrap().get(0);
        assert_eq!(pnl, Some(500.0));
    }

    #[test]
    fn test_empty_frames() {
        assert_eq!(trades_frame(&[]).unwrap().height(), 0);
        assert_eq!(equity_frame(&[]).unwrap().height(), 0);
    }

    #[test]
    fn test_export_run_writes_artifacts() {
        let dir = std::env::temp_dir().join(format!("theta-export-{}", std::process::id()));
        let result = BacktestResult {
            name: "export".to_string(),
            symbols: vec!["SPY".to_string()],
            start_date: d(6),
            end_date: d(8),
            initial_capital: dec!(35_000),
            final_capital: dec!(35_500),
            trades: vec![sample_trade()],
            equity_curve: sample_equity(),
            ..Default::default()
        };
        let metrics = MetricsCalculator::calculate_result(&result, &MetricsConfig::default());
        let report = PerformanceReport::grade(&metrics, &GradingConfig::default());

        let written = export_run(&result, &metrics, &report, &dir).unwrap();
        assert_eq!(written.len(), 6);
        assert!(written.iter().all(|p| p.exists()));

        let csv = fs::read_to_string(dir.join("trades.csv")).unwrap();
        assert!(csv.starts_with("position_id,strategy,symbol"));
        assert!(csv.contains("lt112"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("metrics.json")).unwrap()).unwrap();
        assert_eq!(json["name"], "export");
        assert_eq!(json["metrics"]["total_trades"], 1);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_run_dir_names_are_unique() {
        let runs = [
            (PathBuf::from("configs/aggressive.toml"), "theta"),
            (PathBuf::from("configs/conservative.toml"), "theta"),
            (PathBuf::from("theta.toml"), "theta"),
            (PathBuf::from("a/base.toml"), "base"),
            (PathBuf::from("b/base.toml"), "base"),
        ];
        assert_eq!(
            run_dir_names(&runs),
            vec![
                "aggressive-theta",
                "conservative-theta",
                "theta",
                "base-4",
                "base-5",
            ]
        );
    }
}
