//! Daily bar loader backed by polars.
//!
//! Reads one file per symbol from a data directory, either
//! `{dir}/{SYMBOL}.parquet` or `{dir}/{SYMBOL}.csv`, with the schema:
//! - date (string `%Y-%m-%d` or a date column)
//! - open, high, low, close (numeric)
//! - volume (integer, optional)
//! - iv (annualized implied volatility as a fraction)
//!
//! Files are loaded into an [`InMemoryMarketData`] before the run starts so
//! the day loop never touches the filesystem.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use polars::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use super::source::InMemoryMarketData;
use super::types::DailyBar;

/// Required columns in every bar file.
pub const EXPECTED_COLUMNS: &[&str] = &["date", "open", "high", "low", "close", "iv"];

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("File not found for symbol {0}")]
    FileNotFound(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Loader for per-symbol daily bar files.
pub struct BarLoader {
    data_dir: PathBuf,
}

impl BarLoader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn parquet_path(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{}.parquet", symbol))
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{}.csv", symbol))
    }

    /// Symbols with a bar file in the data directory.
    pub fn available_symbols(&self) -> Result<Vec<String>, LoaderError> {
        if !self.data_dir.exists() {
            return Ok(vec![]);
        }

        let mut symbols = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let is_bar_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("parquet") | Some("csv")
            );
            if is_bar_file {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    symbols.push(stem.to_string());
                }
            }
        }
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    /// Load the raw frame for a symbol, preferring parquet over CSV.
    pub fn load_frame(&self, symbol: &str) -> Result<DataFrame, LoaderError> {
        let parquet = self.parquet_path(symbol);
        if parquet.exists() {
            let lf = LazyFrame::scan_parquet(&parquet, ScanArgsParquet::default())?;
            return Ok(lf.collect()?);
        }

        let csv = self.csv_path(symbol);
        if csv.exists() {
            let df = CsvReadOptions::default()
                .with_has_header(true)
                .try_into_reader_with_file_path(Some(csv))?
                .finish()?;
            return Ok(df);
        }

        Err(LoaderError::FileNotFound(symbol.to_string()))
    }

    /// Load the bars of one symbol inside `start..=end`.
    pub fn load_symbol(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(NaiveDate, DailyBar)>, LoaderError> {
        let df = self.load_frame(symbol)?;
        let bars = dataframe_to_bars(&df)?
            .into_iter()
            .filter(|(date, _)| *date >= start && *date <= end)
            .collect::<Vec<_>>();
        debug!(symbol, rows = bars.len(), "loaded bars");
        Ok(bars)
    }

    /// Load several symbols into memory. A symbol without a file is logged
    /// and left out; the engine then treats it as a data gap on every day.
    pub fn load(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<InMemoryMarketData, LoaderError> {
        let mut data = InMemoryMarketData::new();
        for symbol in symbols {
            match self.load_symbol(symbol, start, end) {
                Ok(bars) => data.insert_series(symbol, bars),
                Err(LoaderError::FileNotFound(_)) => {
                    warn!(symbol = symbol.as_str(), dir = %self.data_dir.display(), "no bar file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Convert days since Unix epoch to NaiveDate.
fn date_from_days(days: i32) -> NaiveDate {
    NaiveDate::from_num_days_from_ce_opt(days + 719163).unwrap_or_default()
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, LoaderError> {
    let column = df.column(name)?.cast(&DataType::Float64)?;
    Ok(column.f64()?.into_iter().collect())
}

/// Convert a bar frame into dated bars. Rows with an unparseable date or a
/// missing price are dropped; the result is sorted by date.
pub fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<(NaiveDate, DailyBar)>, LoaderError> {
    for name in EXPECTED_COLUMNS {
        if df.column(name).is_err() {
            return Err(LoaderError::InvalidData(format!("missing column '{}'", name)));
        }
    }

    let date_col = df.column("date")?;
    let dates: Vec<Option<NaiveDate>> = if let Ok(str_col) = date_col.str() {
        str_col
            .into_iter()
            .map(|s| s.and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()))
            .collect()
    } else if let Ok(date_col) = date_col.date() {
        date_col.into_iter().map(|d| d.map(date_from_days)).collect()
    } else {
        return Err(LoaderError::InvalidData(
            "date column has unexpected type".to_string(),
        ));
    };

    let open = float_column(df, "open")?;
    let high = float_column(df, "high")?;
    let low = float_column(df, "low")?;
    let close = float_column(df, "close")?;
    let iv = float_column(df, "iv")?;
    let volume: Vec<Option<i64>> = match df.column("volume") {
        Ok(col) => col.cast(&DataType::Int64)?.i64()?.into_iter().collect(),
        Err(_) => vec![Some(0); df.height()],
    };

    let mut bars = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        let row = (
            dates[idx], open[idx], high[idx], low[idx], close[idx], iv[idx],
        );
        let (Some(date), Some(open), Some(high), Some(low), Some(close), Some(iv)) = row else {
            continue;
        };
        bars.push((
            date,
            DailyBar {
                open,
                high,
                low,
                close,
                volume: volume[idx].unwrap_or(0),
                implied_volatility: iv,
            },
        ));
    }

    bars.sort_by_key(|(date, _)| *date);
    bars.dedup_by_key(|(date, _)| *date);
    Ok(bars)
}
