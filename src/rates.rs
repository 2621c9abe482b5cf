//! Historical rate loading.
//!
//! Rate tables are CSV files with a header row and one row per year. The rate
//! column holds annual returns in percent (3.2 for 3.2%); blank cells are read
//! as 0. Anything else that fails to parse is reported as a data source error.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use csv::ReaderBuilder;
use tracing::{info, warn};

use crate::core::RateSeries;
use crate::error::{Error, Result};

pub const DEFAULT_RATE_COLUMN: &str = "return_pct";

pub trait RateSeriesProvider {
    fn load(&self) -> Result<RateSeries>;
}

/// Rates read from a CSV file on disk.
#[derive(Debug, Clone)]
pub struct CsvRateSource {
    path: PathBuf,
    column: String,
}

impl CsvRateSource {
    pub fn new(path: impl Into<PathBuf>, column: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            column: column.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RateSeriesProvider for CsvRateSource {
    fn load(&self) -> Result<RateSeries> {
        let file = File::open(&self.path).map_err(|e| {
            Error::DataSource(format!(
                "failed to open rate table '{}': {e}",
                self.path.display()
            ))
        })?;
        let series = parse_rate_csv(file, &self.column)?;
        info!(
            path = %self.path.display(),
            column = %self.column,
            years = series.len(),
            "loaded rate series"
        );
        Ok(series)
    }
}

/// Rates already held in memory, as fractions.
#[derive(Debug, Clone)]
pub struct StaticRateSource {
    rates: Vec<f64>,
}

impl StaticRateSource {
    pub fn new(rates: Vec<f64>) -> Self {
        Self { rates }
    }
}

impl RateSeriesProvider for StaticRateSource {
    fn load(&self) -> Result<RateSeries> {
        RateSeries::new(self.rates.clone())
    }
}

/// Memoizes the first successful load of the wrapped provider.
#[derive(Debug)]
pub struct CachedRateSource<P> {
    inner: P,
    cache: OnceLock<RateSeries>,
}

impl<P: RateSeriesProvider> CachedRateSource<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: OnceLock::new(),
        }
    }
}

impl<P: RateSeriesProvider> RateSeriesProvider for CachedRateSource<P> {
    fn load(&self) -> Result<RateSeries> {
        if let Some(series) = self.cache.get() {
            return Ok(series.clone());
        }
        let series = self.inner.load()?;
        Ok(self.cache.get_or_init(|| series).clone())
    }
}

/// Reads the named percentage column from CSV data.
pub fn parse_rate_csv<R: Read>(reader: R, column: &str) -> Result<RateSeries> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let column_index = headers.iter().position(|h| h == column).ok_or_else(|| {
        Error::DataSource(format!(
            "rate column '{column}' not found; available columns: {}",
            headers.iter().collect::<Vec<_>>().join(", ")
        ))
    })?;

    let mut percentages = Vec::new();
    for (row_idx, record) in csv_reader.records().enumerate() {
        let record = record?;
        // header is line 1
        let line = row_idx + 2;
        let cell = record.get(column_index).unwrap_or("");
        percentages.push(parse_percentage(cell, line)?);
    }

    if percentages.is_empty() {
        return Err(Error::DataSource(format!(
            "rate column '{column}' has no rows"
        )));
    }

    RateSeries::from_percentages(percentages)
}

fn parse_percentage(cell: &str, line: usize) -> Result<Option<f64>> {
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        warn!(line, "missing rate treated as 0");
        return Ok(None);
    }
    let value = cell
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|_| Error::DataSource(format!("line {line}: cannot parse rate '{cell}'")))?;
    if !value.is_finite() {
        return Err(Error::DataSource(format!(
            "line {line}: rate '{cell}' is not finite"
        )));
    }
    Ok(Some(value))
}
