//! Theta Backtest CLI
//!
//! Usage:
//!
//! # Run a single backtest
//! theta-backtest run --config config/default.toml --data data/bars --output results
//!
//! # Run several configurations side by side over the same data
//! theta-backtest sweep --configs a.toml,b.toml --data data/bars
//!
//! # Check a configuration without running it
//! theta-backtest check-config --config config/default.toml

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use theta_backtest::backtest::{BacktestEngine, BacktestResult};
use theta_backtest::config::BacktestConfig;
use theta_backtest::data::{BarLoader, InMemoryMarketData};
use theta_backtest::metrics::{summary, MetricsCalculator, PerformanceReport};
use theta_backtest::report::{export_run, run_dir_names};

#[derive(Parser)]
#[command(name = "theta-backtest")]
#[command(about = "Day-stepping backtester for options income strategies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest with given configuration
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Directory with one bar file per symbol
        #[arg(short, long, default_value = "data/bars")]
        data: PathBuf,

        /// First day (YYYY-MM-DD); defaults to one year before --end
        #[arg(short, long)]
        start: Option<String>,

        /// Last day (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        end: Option<String>,

        /// Comma-separated symbols; defaults to every symbol the strategies trade
        #[arg(long)]
        symbols: Option<String>,

        /// Comma-separated subset of the configured strategies (e.g. "0dte,lt112")
        #[arg(long)]
        strategies: Option<String>,

        /// Directory for trades, equity and metrics artifacts
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run several configurations in parallel over the same data
    Sweep {
        /// Comma-separated configuration files
        #[arg(long)]
        configs: String,

        #[arg(short, long, default_value = "data/bars")]
        data: PathBuf,

        #[arg(short, long)]
        start: Option<String>,

        #[arg(short, long)]
        end: Option<String>,

        #[arg(long)]
        symbols: Option<String>,

        /// Parent directory; each configuration writes to a subdirectory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse and validate a configuration
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date format: {} (expected YYYY-MM-DD)", value))
}

fn date_range(start: Option<&str>, end: Option<&str>) -> Result<(NaiveDate, NaiveDate)> {
    let end = match end {
        Some(s) => parse_date(s)?,
        None => chrono::Local::now().date_naive(),
    };
    let start = match start {
        Some(s) => parse_date(s)?,
        None => end - chrono::Duration::days(365),
    };
    Ok((start, end))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn load_config(path: &Path) -> Result<BacktestConfig> {
    let config = BacktestConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Load the traded symbols plus every VIX symbol the configurations use.
fn load_data(
    data_dir: &Path,
    symbols: &[String],
    configs: &[&BacktestConfig],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<InMemoryMarketData> {
    let mut to_load = symbols.to_vec();
    for config in configs {
        if !to_load.contains(&config.vix_symbol) {
            to_load.push(config.vix_symbol.clone());
        }
    }
    let loader = BarLoader::new(data_dir);
    let data = loader
        .load(&to_load, start, end)
        .with_context(|| format!("Failed to load bars from {}", data_dir.display()))?;
    info!(symbols = to_load.len(), dir = %data_dir.display(), "market data loaded");
    Ok(data)
}

fn report_result(config: &BacktestConfig, result: &BacktestResult, output: Option<&Path>) -> Result<()> {
    let metrics = MetricsCalculator::calculate_result(result, &config.metrics);
    let report = PerformanceReport::grade(&metrics, &config.metrics.grading);
    println!("{}", summary(&result.name, &metrics, &report));

    if let Some(dir) = output {
        let written = export_run(result, &metrics, &report, dir)
            .with_context(|| format!("Failed to export results to {}", dir.display()))?;
        println!("Wrote {} files to {}", written.len(), dir.display());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config_path: &Path,
    data_dir: &Path,
    start: Option<&str>,
    end: Option<&str>,
    symbols: Option<&str>,
    strategies: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(list) = strategies {
        config
            .retain_strategies(&split_list(list))
            .context("Invalid --strategies")?;
    }
    let (start, end) = date_range(start, end)?;
    let symbols = symbols.map(split_list).unwrap_or_else(|| config.traded_symbols());

    let data = load_data(data_dir, &symbols, &[&config], start, end)?;
    let engine = BacktestEngine::new(config.clone())?;
    let result = engine
        .run(&data, start, end, &symbols)
        .context("Backtest failed")?;

    report_result(&config, &result, output)
}

fn cmd_sweep(
    configs: &str,
    data_dir: &Path,
    start: Option<&str>,
    end: Option<&str>,
    symbols: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let paths: Vec<PathBuf> = split_list(configs).into_iter().map(PathBuf::from).collect();
    if paths.is_empty() {
        bail!("No configuration files given");
    }
    let configs = paths
        .iter()
        .map(|p| load_config(p))
        .collect::<Result<Vec<_>>>()?;

    let (start, end) = date_range(start, end)?;
    let symbols = match symbols {
        Some(list) => split_list(list),
        None => {
            let mut all: Vec<String> = configs.iter().flat_map(|c| c.traded_symbols()).collect();
            all.sort();
            all.dedup();
            all
        }
    };

    let refs: Vec<&BacktestConfig> = configs.iter().collect();
    let data = load_data(data_dir, &symbols, &refs, start, end)?;

    let engines = configs
        .iter()
        .map(|c| BacktestEngine::new(c.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    let results = BacktestEngine::run_batch(&engines, &data, start, end, &symbols);

    let runs: Vec<(&Path, &str)> = paths
        .iter()
        .map(PathBuf::as_path)
        .zip(configs.iter().map(|c| c.name.as_str()))
        .collect();
    let dirs = run_dir_names(&runs);

    let mut failures = 0;
    for (((config, path), dir), result) in configs.iter().zip(&paths).zip(&dirs).zip(results) {
        match result {
            Ok(result) => {
                let dir = output.map(|o| o.join(dir));
                report_result(config, &result, dir.as_deref())?;
            }
            Err(e) => {
                failures += 1;
                warn!(config = %path.display(), error = %e, "run failed");
            }
        }
    }
    if failures > 0 {
        bail!("{} of {} runs failed", failures, configs.len());
    }
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("Configuration OK: {}", config.name);
    println!("  Initial capital: ${}", config.initial_capital);
    println!("  Max positions: {}", config.max_positions);
    println!("  Correlation limit: {}", config.correlation_limit);
    for rules in &config.strategies {
        println!(
            "  {:<10} target DTE {:>3}  weekdays {:?}",
            rules.kind().as_str(),
            rules.entry().target_dte,
            rules.entry().weekdays
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("theta_backtest=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data,
            start,
            end,
            symbols,
            strategies,
            output,
        } => cmd_run(
            &config,
            &data,
            start.as_deref(),
            end.as_deref(),
            symbols.as_deref(),
            strategies.as_deref(),
            output.as_deref(),
        ),
        Commands::Sweep {
            configs,
            data,
            start,
            end,
            symbols,
            output,
        } => cmd_sweep(
            &configs,
            &data,
            start.as_deref(),
            end.as_deref(),
            symbols.as_deref(),
            output.as_deref(),
        ),
        Commands::CheckConfig { config } => cmd_check_config(&config),
    }
}
