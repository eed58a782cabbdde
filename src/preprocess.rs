//! Turn raw cumulative meter readings into per-floor power observations.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::calendar::to_berlin;
use crate::error::{ForecastError, Result};
use crate::observation::{Observation, sort_chronologically};

/// A reading as exported by the meter gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawReading {
    #[serde(alias = "recordedtimestamp")]
    pub timestamp: String,
    /// Zone name carrying the floor number, e.g. `Floor_3_Main`
    #[serde(alias = "systemname")]
    pub zone: String,
    /// Cumulative energy counter in raw units
    #[serde(alias = "value")]
    pub energy: f64,
}

/// Read raw readings from a CSV file.
pub fn read_raw_readings(path: &Path) -> Result<Vec<RawReading>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut readings = Vec::new();
    for row in reader.deserialize() {
        let reading: RawReading = row?;
        readings.push(reading);
    }
    tracing::info!("Read {} raw readings from {}", readings.len(), path.display());
    Ok(readings)
}

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a timestamp, taking it as UTC when it carries no offset.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ForecastError::Timestamp(format!("unrecognized timestamp '{raw}'")))
}

/// First run of digits in a zone name.
pub fn floor_from_zone(zone: &str) -> Result<u32> {
    let digits: String = zone
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits
        .parse()
        .map_err(|_| ForecastError::InvalidParameter(format!("no floor number in zone '{zone}'")))
}

/// Convert raw readings of any number of floors into observations sorted by
/// timestamp.
///
/// Energy is divided by `energy_scale_factor`. Duplicate timestamps of a
/// floor keep the last reading. Power is the energy difference between two
/// consecutive readings over the hours between them; pairs where either is
/// not positive are dropped, and so is each floor's first reading.
pub fn preprocess(readings: &[RawReading], energy_scale_factor: f64) -> Result<Vec<Observation>> {
    if energy_scale_factor.is_nan() || energy_scale_factor <= 0.0 {
        return Err(ForecastError::InvalidParameter(format!(
            "energy scale factor must be positive, got {energy_scale_factor}"
        )));
    }

    let mut per_floor: BTreeMap<u32, HashMap<DateTime<Utc>, f64>> = BTreeMap::new();
    let mut duplicates = 0usize;
    for reading in readings {
        let floor = floor_from_zone(&reading.zone)?;
        let timestamp = parse_timestamp(&reading.timestamp)?;
        let energy = reading.energy / energy_scale_factor;
        if per_floor
            .entry(floor)
            .or_default()
            .insert(timestamp, energy)
            .is_some()
        {
            duplicates += 1;
        }
    }

    let mut observations = Vec::new();
    let mut dropped = 0usize;
    for (floor, series) in per_floor {
        let mut series: Vec<(DateTime<Utc>, f64)> = series.into_iter().collect();
        series.sort_by_key(|(ts, _)| *ts);

        for pair in series.windows(2) {
            let (prev_ts, prev_energy) = pair[0];
            let (ts, energy) = pair[1];
            let energy_delta = energy - prev_energy;
            let hours = (ts - prev_ts).num_milliseconds() as f64 / 3_600_000.0;
            if energy_delta <= 0.0 || hours <= 0.0 {
                dropped += 1;
                continue;
            }
            observations.push(
                Observation::new(to_berlin(ts), floor, energy_delta / hours).with_time_delta(hours),
            );
        }
    }
    sort_chronologically(&mut observations);

    tracing::info!(
        "Preprocessed {} readings into {} observations ({} duplicates, {} non-positive deltas)",
        readings.len(),
        observations.len(),
        duplicates,
        dropped
    );
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    fn raw(ts: &str, zone: &str, energy: f64) -> RawReading {
        RawReading {
            timestamp: ts.to_string(),
            zone: zone.to_string(),
            energy,
        }
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 6, 3, 10, 15, 0).unwrap();
        assert_eq!(parse_timestamp("2024-06-03T10:15:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-06-03T12:15:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-06-03 12:15:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-06-03 10:15:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-06-03T10:15:00.000").unwrap(), expected);
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(ForecastError::Timestamp(_))
        ));
    }

    #[test]
    fn test_floor_from_zone() {
        assert_eq!(floor_from_zone("Floor_3_Main").unwrap(), 3);
        assert_eq!(floor_from_zone("OG12-east7").unwrap(), 12);
        assert!(floor_from_zone("Basement").is_err());
    }

    // ==================== Preprocess Tests ====================

    #[test]
    fn test_power_from_consecutive_readings() {
        let readings = vec![
            raw("2024-06-03T10:00:00Z", "Floor_1", 1000.0),
            raw("2024-06-03T10:15:00Z", "Floor_1", 1100.0),
            raw("2024-06-03T10:30:00Z", "Floor_1", 1300.0),
        ];
        let obs = preprocess(&readings, 100.0).unwrap();

        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].time_delta_hours, Some(0.25));
        assert!((obs[0].power - 4.0).abs() < 1e-12);
        assert!((obs[1].power - 8.0).abs() < 1e-12);
        // 10:15 UTC is 12:15 in Berlin summer time
        assert_eq!(obs[0].timestamp.hour(), 12);
        assert_eq!(obs[0].features.minutes_from_daystart, 12 * 60 + 15);
    }

    #[test]
    fn test_duplicates_keep_last_and_floors_are_separate() {
        let readings = vec![
            raw("2024-06-03T10:00:00Z", "Floor_1", 1000.0),
            raw("2024-06-03T10:00:00Z", "Floor_3", 50.0),
            raw("2024-06-03T10:15:00Z", "Floor_1", 1100.0),
            raw("2024-06-03T10:15:00Z", "Floor_1", 1200.0),
            raw("2024-06-03T10:30:00Z", "Floor_3", 150.0),
        ];
        let obs = preprocess(&readings, 100.0).unwrap();

        let floor1: Vec<_> = obs.iter().filter(|o| o.floor == 1).collect();
        let floor3: Vec<_> = obs.iter().filter(|o| o.floor == 3).collect();
        assert_eq!(floor1.len(), 1);
        assert!((floor1[0].power - 8.0).abs() < 1e-12);
        assert_eq!(floor3.len(), 1);
        assert_eq!(floor3[0].time_delta_hours, Some(0.5));
        assert!(obs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_non_positive_energy_deltas_are_dropped() {
        let readings = vec![
            raw("2024-06-03T10:00:00Z", "Floor_1", 1000.0),
            raw("2024-06-03T10:15:00Z", "Floor_1", 1000.0),
            raw("2024-06-03T10:30:00Z", "Floor_1", 900.0),
            raw("2024-06-03T10:45:00Z", "Floor_1", 1000.0),
        ];
        let obs = preprocess(&readings, 1.0).unwrap();
        assert_eq!(obs.len(), 1);
        assert!((obs[0].power - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        let readings = vec![
            raw("2024-06-03T10:30:00Z", "Floor_1", 1300.0),
            raw("2024-06-03T10:00:00Z", "Floor_1", 1000.0),
            raw("2024-06-03T10:15:00Z", "Floor_1", 1100.0),
        ];
        let obs = preprocess(&readings, 100.0).unwrap();
        assert_eq!(obs.len(), 2);
        assert!(obs[0].timestamp < obs[1].timestamp);
    }

    #[test]
    fn test_invalid_scale_factor() {
        assert!(preprocess(&[], 0.0).is_err());
        assert!(preprocess(&[], 100.0).unwrap().is_empty());
    }

    #[test]
    fn test_read_raw_readings_with_source_column_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        std::fs::write(
            &path,
            "recordedtimestamp,systemname,value\n\
             2024-06-03T10:00:00Z,Floor_4,10\n\
             2024-06-03T10:15:00Z,Floor_4,20\n",
        )
        .unwrap();

        let readings = read_raw_readings(&path).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1], raw("2024-06-03T10:15:00Z", "Floor_4", 20.0));
    }
}
