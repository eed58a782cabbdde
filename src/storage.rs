//! Forecast persistence: a single merged CSV file or one CSV per year-week
//! partition.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::forecast::ForecastSlot;
use crate::ml::scoring::QuantileLevels;
use crate::observation::{CalendarRow, YearWeek, distinct_weeks, rows_in_weeks};

/// One persisted forecast row. Field order is the on-disk column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub weekday: u32,
    pub date: NaiveDate,
    pub hour: u32,
    pub weekofyear: u32,
    pub year_week: YearWeek,
    pub holiday: u8,
    pub bridge_holiday: u8,
    pub floor: u32,
    pub forecast_q_5: f64,
    pub forecast_q_50: f64,
    pub forecast_q_95: f64,
}

impl ForecastRecord {
    /// Quantile columns of the persisted schema, lower to upper.
    pub const QUANTILE_COLUMNS: [&'static str; 3] =
        ["forecast_q_5", "forecast_q_50", "forecast_q_95"];

    /// Fail unless `levels` name the schema's quantile columns.
    pub fn check_levels(levels: &QuantileLevels) -> Result<()> {
        let names = levels.column_names();
        if names.iter().zip(Self::QUANTILE_COLUMNS).all(|(a, b)| a == b) {
            Ok(())
        } else {
            Err(ForecastError::InvalidParameter(format!(
                "quantile levels {:?} produce columns {names:?}, forecast records store {:?}",
                levels.levels(),
                Self::QUANTILE_COLUMNS
            )))
        }
    }

    /// Record for `slot` with `[lower, median, upper]` forecast values.
    pub fn from_slot(slot: &ForecastSlot, quantiles: [f64; 3]) -> Self {
        let [lower, median, upper] = quantiles;
        Self {
            timestamp: slot.timestamp,
            weekday: slot.features.weekday,
            date: slot.features.date,
            hour: slot.features.hour,
            weekofyear: slot.features.week_of_year,
            year_week: slot.features.year_week,
            holiday: u8::from(slot.features.holiday),
            bridge_holiday: u8::from(slot.features.bridge_day),
            floor: slot.floor,
            forecast_q_5: lower,
            forecast_q_50: median,
            forecast_q_95: upper,
        }
    }
}

impl CalendarRow for ForecastRecord {
    fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    fn date(&self) -> NaiveDate {
        self.date
    }

    fn year_week(&self) -> YearWeek {
        self.year_week
    }

    fn is_holiday(&self) -> bool {
        self.holiday != 0
    }

    fn is_bridge_day(&self) -> bool {
        self.bridge_holiday != 0
    }
}

/// Destination for forecast batches.
pub trait ForecastStore {
    fn write(&self, records: &[ForecastRecord]) -> Result<()>;

    /// Stored rows whose year-week is in `year_weeks`.
    fn read(&self, year_weeks: &[YearWeek]) -> Result<Vec<ForecastRecord>>;
}

fn read_csv(path: &Path) -> Result<Vec<ForecastRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: ForecastRecord = row?;
        records.push(record);
    }
    Ok(records)
}

fn write_csv(path: &Path, records: &[ForecastRecord], append: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let existed = append && path.exists();
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!existed)
        .from_writer(file);
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

// ==================== Local CSV ====================

/// One CSV file; a new batch replaces every stored row on the dates it
/// covers.
#[derive(Debug, Clone)]
pub struct LocalCsvStore {
    path: PathBuf,
}

impl LocalCsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ForecastStore for LocalCsvStore {
    fn write(&self, records: &[ForecastRecord]) -> Result<()> {
        let dates: HashSet<NaiveDate> = records.iter().map(|r| r.date).collect();
        let existing = read_csv(&self.path)?;
        let kept = existing.len();
        let mut merged: Vec<ForecastRecord> = existing
            .into_iter()
            .filter(|r| !dates.contains(&r.date))
            .collect();
        let replaced = kept - merged.len();
        merged.extend_from_slice(records);

        write_csv(&self.path, &merged, false)?;
        tracing::info!(
            "Saved {} forecast rows to {} (replaced {} rows on {} dates)",
            records.len(),
            self.path.display(),
            replaced,
            dates.len()
        );
        Ok(())
    }

    fn read(&self, year_weeks: &[YearWeek]) -> Result<Vec<ForecastRecord>> {
        Ok(rows_in_weeks(&read_csv(&self.path)?, year_weeks))
    }
}

// ==================== Partitioned CSV ====================

/// How a batch meets the partitions it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Append,
    /// Replace the touched partitions
    Overwrite,
}

/// One directory per year-week, `<root>/year_week=<key>/part.csv`.
#[derive(Debug, Clone)]
pub struct PartitionedCsvStore {
    root: PathBuf,
    mode: WriteMode,
}

impl PartitionedCsvStore {
    pub fn new(root: impl Into<PathBuf>, mode: WriteMode) -> Self {
        Self {
            root: root.into(),
            mode,
        }
    }

    fn partition_path(&self, week: YearWeek) -> PathBuf {
        self.root
            .join(format!("year_week={week}"))
            .join("part.csv")
    }
}

impl ForecastStore for PartitionedCsvStore {
    fn write(&self, records: &[ForecastRecord]) -> Result<()> {
        let append = self.mode == WriteMode::Append;
        for week in distinct_weeks(records) {
            let batch = rows_in_weeks(records, &[week]);
            write_csv(&self.partition_path(week), &batch, append)?;
            tracing::debug!("Wrote {} rows to partition {} ({:?})", batch.len(), week, self.mode);
        }
        tracing::info!(
            "Saved {} forecast rows under {}",
            records.len(),
            self.root.display()
        );
        Ok(())
    }

    fn read(&self, year_weeks: &[YearWeek]) -> Result<Vec<ForecastRecord>> {
        let mut records = Vec::new();
        for week in year_weeks {
            records.extend(read_csv(&self.partition_path(*week))?);
        }
        Ok(records)
    }
}
