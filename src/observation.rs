//! Per-floor power observations and the calendar-week key they are
//! partitioned by.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::calendar::{is_bridge_day, is_holiday};
use crate::error::{ForecastError, Result};

// ==================== Year-Week Key ====================

/// Composite (ISO year, ISO week) key, rendered as `2024-W07`.
///
/// Deliberately not `Ord`: chronological order of weeks always comes from
/// the timestamps of the observations carrying them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct YearWeek {
    pub year: i32,
    pub week: u32,
}

impl YearWeek {
    pub fn new(year: i32, week: u32) -> Self {
        Self { year, week }
    }

    /// Key of the ISO week containing `date`.
    pub fn from_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }
}

impl fmt::Display for YearWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

impl FromStr for YearWeek {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ForecastError::InvalidParameter(format!("invalid year-week key '{s}'"));
        let (year, week) = s.split_once("-W").ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let week: u32 = week.parse().map_err(|_| invalid())?;
        if !(1..=53).contains(&week) {
            return Err(invalid());
        }
        Ok(Self { year, week })
    }
}

impl Serialize for YearWeek {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearWeek {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ==================== Calendar Features ====================

/// Calendar attributes shared by observations and forecast slots.
pub trait CalendarRow {
    fn timestamp(&self) -> DateTime<FixedOffset>;
    fn date(&self) -> NaiveDate;
    fn year_week(&self) -> YearWeek;
    fn is_holiday(&self) -> bool;
    fn is_bridge_day(&self) -> bool;
}

/// Time features derived from a zoned timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeFeatures {
    pub date: NaiveDate,
    /// Day of week, 0 = Monday
    pub weekday: u32,
    pub hour: u32,
    pub week_of_year: u32,
    pub year_week: YearWeek,
    pub minutes_from_daystart: u32,
    pub holiday: bool,
    pub bridge_day: bool,
}

impl TimeFeatures {
    pub fn from_timestamp(timestamp: &DateTime<FixedOffset>) -> Self {
        let date = timestamp.date_naive();
        let year_week = YearWeek::from_date(date);
        Self {
            date,
            weekday: date.weekday().num_days_from_monday(),
            hour: timestamp.hour(),
            week_of_year: year_week.week,
            year_week,
            minutes_from_daystart: timestamp.hour() * 60 + timestamp.minute(),
            holiday: is_holiday(date),
            bridge_day: is_bridge_day(date),
        }
    }
}

// ==================== Observation ====================

/// A single power reading for one floor.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<FixedOffset>,
    pub floor: u32,
    pub features: TimeFeatures,
    /// Hours since the previous sample; strictly positive once computed
    pub time_delta_hours: Option<f64>,
    /// Average power over the sampling interval (kW)
    pub power: f64,
}

impl Observation {
    /// Build an observation, deriving every calendar feature from the
    /// timestamp.
    pub fn new(timestamp: DateTime<FixedOffset>, floor: u32, power: f64) -> Self {
        Self {
            features: TimeFeatures::from_timestamp(&timestamp),
            timestamp,
            floor,
            time_delta_hours: None,
            power,
        }
    }

    pub fn with_time_delta(mut self, hours: f64) -> Self {
        self.time_delta_hours = Some(hours);
        self
    }
}

impl CalendarRow for Observation {
    fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    fn date(&self) -> NaiveDate {
        self.features.date
    }

    fn year_week(&self) -> YearWeek {
        self.features.year_week
    }

    fn is_holiday(&self) -> bool {
        self.features.holiday
    }

    fn is_bridge_day(&self) -> bool {
        self.features.bridge_day
    }
}

// ==================== Window Helpers ====================

/// Sort rows by timestamp (stable, so equal timestamps keep input order).
pub fn sort_chronologically<T: CalendarRow>(rows: &mut [T]) {
    rows.sort_by_key(|row| row.timestamp());
}

/// Distinct year-week keys in order of first appearance.
///
/// Callers pass rows in ascending timestamp order, which makes the result
/// chronological even across year boundaries.
pub fn distinct_weeks<T: CalendarRow>(rows: &[T]) -> Vec<YearWeek> {
    let mut seen = HashSet::new();
    rows.iter()
        .map(CalendarRow::year_week)
        .filter(|week| seen.insert(*week))
        .collect()
}

/// Clone the rows whose week is in `weeks`, keeping their order.
pub fn rows_in_weeks<T: CalendarRow + Clone>(rows: &[T], weeks: &[YearWeek]) -> Vec<T> {
    let wanted: HashSet<YearWeek> = weeks.iter().copied().collect();
    rows.iter()
        .filter(|row| wanted.contains(&row.year_week()))
        .cloned()
        .collect()
}
