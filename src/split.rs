//! Partition a floor's history into CV, test and remaining history windows
//! along whole calendar weeks.

use crate::error::{ForecastError, Result};
use crate::observation::{CalendarRow, YearWeek, distinct_weeks, rows_in_weeks};

/// The three disjoint windows of a floor's history.
#[derive(Debug, Clone)]
pub struct WeekSplit<T> {
    /// The `k_cv` weeks before the test weeks
    pub cv: Vec<T>,
    /// The `k_test` most recent weeks
    pub test: Vec<T>,
    /// Everything strictly older than the CV window
    pub history: Vec<T>,
    pub cv_weeks: Vec<YearWeek>,
    pub test_weeks: Vec<YearWeek>,
}

/// Split `rows` (ascending by timestamp) into CV, test and history windows.
///
/// The last `k_cv + k_test` distinct weeks by first appearance are taken; the
/// earlier `k_cv` of them form the CV window and the rest the test window.
pub fn split_cv_test<T: CalendarRow + Clone>(
    rows: &[T],
    k_cv: usize,
    k_test: usize,
) -> Result<WeekSplit<T>> {
    let weeks = distinct_weeks(rows);
    let needed = k_cv + k_test;
    if weeks.len() < needed {
        return Err(ForecastError::InsufficientHistory {
            needed,
            got: weeks.len(),
        });
    }

    let recent = &weeks[weeks.len() - needed..];
    let (cv_weeks, test_weeks) = recent.split_at(k_cv);
    let history_weeks = &weeks[..weeks.len() - needed];

    let split = WeekSplit {
        cv: rows_in_weeks(rows, cv_weeks),
        test: rows_in_weeks(rows, test_weeks),
        history: rows_in_weeks(rows, history_weeks),
        cv_weeks: cv_weeks.to_vec(),
        test_weeks: test_weeks.to_vec(),
    };

    tracing::debug!(
        "Split {} rows into cv={} ({} weeks), test={} ({} weeks), history={}",
        rows.len(),
        split.cv.len(),
        k_cv,
        split.test.len(),
        k_test,
        split.history.len()
    );

    Ok(split)
}
