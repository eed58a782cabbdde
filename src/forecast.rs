//! Two-week forward window and the quantile forecast produced on it.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::calendar::to_berlin;
use crate::error::{ForecastError, Result};
use crate::ml::features::FeatureRow;
use crate::ml::model::QuantileRegressor;
use crate::ml::scoring::triples_from_predictions;
use crate::observation::{CalendarRow, Observation, TimeFeatures, YearWeek};
use crate::storage::ForecastRecord;

/// Days covered by one forecast window.
pub const FORECAST_DAYS: i64 = 14;

/// One future timestamp to forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSlot {
    pub timestamp: DateTime<FixedOffset>,
    pub floor: u32,
    pub features: TimeFeatures,
    /// Length of the slot in hours
    pub time_delta_hours: f64,
}

impl CalendarRow for ForecastSlot {
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

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Build the slots of the two weeks following the last row of `recent`.
///
/// The slot length is the median sampling interval of `recent`, truncated to
/// whole minutes. `recent` must hold a single floor in ascending order.
pub fn forecast_window(recent: &[Observation]) -> Result<Vec<ForecastSlot>> {
    let last = recent.last().ok_or_else(|| {
        ForecastError::InvalidParameter("cannot build a forecast window from no rows".into())
    })?;
    if let Some(other) = recent.iter().find(|row| row.floor != last.floor) {
        return Err(ForecastError::InvalidParameter(format!(
            "forecast window mixes floors {} and {}",
            other.floor, last.floor
        )));
    }

    let mut deltas: Vec<f64> = recent.iter().filter_map(|row| row.time_delta_hours).collect();
    let median_hours = median(&mut deltas).ok_or_else(|| {
        ForecastError::InvalidParameter("rows carry no sampling interval".into())
    })?;
    let interval_minutes = (60.0 * median_hours) as i64;
    if interval_minutes <= 0 {
        return Err(ForecastError::InvalidParameter(format!(
            "median sampling interval of {median_hours} h is shorter than a minute"
        )));
    }

    let step = Duration::minutes(interval_minutes);
    let slots = FORECAST_DAYS * 24 * 60 / interval_minutes;
    let start = last.timestamp.with_timezone(&Utc) + step;
    let slot_hours = interval_minutes as f64 / 60.0;

    let window: Vec<ForecastSlot> = (0..slots)
        .map(|i| {
            let timestamp = to_berlin(start + step * i as i32);
            ForecastSlot {
                features: TimeFeatures::from_timestamp(&timestamp),
                timestamp,
                floor: last.floor,
                time_delta_hours: slot_hours,
            }
        })
        .collect();

    tracing::debug!(
        "Forecast window for floor {}: {} slots of {} min from {}",
        last.floor,
        window.len(),
        interval_minutes,
        start
    );
    Ok(window)
}

/// Predict every slot and convert the quantiles from power to energy.
pub fn generate_forecast(
    model: &dyn QuantileRegressor,
    window: &[ForecastSlot],
) -> Result<Vec<ForecastRecord>> {
    let rows: Vec<FeatureRow> = window
        .iter()
        .map(|slot| FeatureRow::from_time_features(&slot.features))
        .collect();
    let triples = triples_from_predictions(&model.predict(&rows)?)?;
    if triples.len() != window.len() {
        return Err(ForecastError::Fit(format!(
            "model returned {} predictions for {} slots",
            triples.len(),
            window.len()
        )));
    }

    Ok(window
        .iter()
        .zip(triples)
        .map(|(slot, triple)| {
            ForecastRecord::from_slot(
                slot,
                [
                    triple.lower * slot.time_delta_hours,
                    triple.median * slot.time_delta_hours,
                    triple.upper * slot.time_delta_hours,
                ],
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike};

    use super::*;
    use crate::ml::features::Dataset;

    fn readings(start: DateTime<Utc>, count: i64, minutes: i64) -> Vec<Observation> {
        (0..count)
            .map(|i| {
                let ts = to_berlin(start + Duration::minutes(minutes * i));
                Observation::new(ts, 3, 5.0).with_time_delta(minutes as f64 / 60.0)
            })
            .collect()
    }

    #[derive(Debug, Default)]
    struct FixedModel {
        params: crate::ml::params::ModelParams,
    }

    impl QuantileRegressor for FixedModel {
        fn family(&self) -> &str {
            "fixed"
        }

        fn params(&self) -> &crate::ml::params::ModelParams {
            &self.params
        }

        fn fit(&mut self, _train: &Dataset, _eval: Option<&Dataset>) -> Result<()> {
            Ok(())
        }

        fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<Vec<f64>>> {
            Ok(rows.iter().map(|_| vec![2.0, 4.0, 8.0]).collect())
        }

        fn to_artifact(&self) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    // ==================== Window Tests ====================

    #[test]
    fn test_window_uses_median_interval() {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let mut rows = readings(start, 20, 15);
        rows[4].time_delta_hours = Some(3.0);

        let window = forecast_window(&rows).unwrap();
        assert_eq!(window.len(), 14 * 24 * 4);
        assert!(window.iter().all(|slot| slot.time_delta_hours == 0.25));
        assert!(window.iter().all(|slot| slot.floor == 3));

        let last = rows.last().unwrap().timestamp;
        assert_eq!(window[0].timestamp, last + Duration::minutes(15));
        assert_eq!(
            window[1].timestamp - window[0].timestamp,
            Duration::minutes(15)
        );
    }

    #[test]
    fn test_window_follows_berlin_offset_across_dst() {
        // Last reading right before the October switch back to CET
        let start = Utc.with_ymd_and_hms(2024, 10, 26, 0, 0, 0).unwrap();
        let rows = readings(start, 4, 60);

        let window = forecast_window(&rows).unwrap();
        assert_eq!(window[0].timestamp.offset().local_minus_utc(), 7200);
        assert_eq!(window.last().unwrap().timestamp.offset().local_minus_utc(), 3600);
        assert!(window.windows(2).all(|pair| pair[1].timestamp > pair[0].timestamp));
    }

    #[test]
    fn test_window_flags_calendar_days() {
        // Two weeks from Dec 15th reach into the Christmas season
        let start = Utc.with_ymd_and_hms(2024, 12, 14, 12, 0, 0).unwrap();
        let rows = readings(start, 3, 60);

        let window = forecast_window(&rows).unwrap();
        let christmas = window
            .iter()
            .find(|slot| slot.date().month() == 12 && slot.date().day() == 25)
            .unwrap();
        assert!(christmas.is_holiday());
        assert_eq!(christmas.timestamp.hour(), christmas.features.hour);
    }

    #[test]
    fn test_window_rejects_bad_input() {
        assert!(forecast_window(&[]).is_err());

        let start = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let mut rows = readings(start, 3, 15);
        rows[1].floor = 4;
        assert!(forecast_window(&rows).is_err());

        let rows: Vec<Observation> = readings(start, 3, 15)
            .into_iter()
            .map(|mut row| {
                row.time_delta_hours = None;
                row
            })
            .collect();
        assert!(forecast_window(&rows).is_err());
    }

    // ==================== Forecast Tests ====================

    #[test]
    fn test_forecast_converts_power_to_energy() {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let window = forecast_window(&readings(start, 5, 30)).unwrap();

        let records = generate_forecast(&FixedModel::default(), &window).unwrap();
        assert_eq!(records.len(), window.len());
        assert_eq!(records[0].forecast_q_5, 1.0);
        assert_eq!(records[0].forecast_q_50, 2.0);
        assert_eq!(records[0].forecast_q_95, 4.0);
        assert_eq!(records[0].floor, 3);
    }

    #[test]
    fn test_median_of_even_count() {
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&mut []), None);
    }
}
