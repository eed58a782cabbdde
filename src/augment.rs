//! Backfill holiday and bridge-day weeks into the CV window when the
//! upcoming weeks contain such days but the CV window barely does.

use std::collections::HashSet;

use crate::observation::{CalendarRow, YearWeek, distinct_weeks, rows_in_weeks};

/// Calendar flag whose scarcity is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarFlag {
    Holiday,
    BridgeDay,
}

impl CalendarFlag {
    fn is_set<T: CalendarRow>(self, row: &T) -> bool {
        match self {
            CalendarFlag::Holiday => row.is_holiday(),
            CalendarFlag::BridgeDay => row.is_bridge_day(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CalendarFlag::Holiday => "holiday",
            CalendarFlag::BridgeDay => "bridge day",
        }
    }
}

/// Result of one backfill pass.
#[derive(Debug, Clone)]
pub struct Backfill<T> {
    /// CV window, backfilled weeks first
    pub cv: Vec<T>,
    /// Weeks taken from history, oldest first
    pub added_weeks: Vec<YearWeek>,
    /// How many weeks were wanted; may exceed `added_weeks.len()`
    pub requested: usize,
}

impl<T> Backfill<T> {
    pub fn is_partial(&self) -> bool {
        self.added_weeks.len() < self.requested
    }
}

/// Windows the augmenter reads from.
#[derive(Debug)]
pub struct AugmentInput<'a, T, F> {
    pub cv: &'a [T],
    pub test: &'a [T],
    /// The two weeks about to be forecast
    pub forecast_window: &'a [F],
    /// Rows strictly older than the CV window, ascending by timestamp
    pub history: &'a [T],
}

impl<T, F> Clone for AugmentInput<'_, T, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, F> Copy for AugmentInput<'_, T, F> {}

/// Count distinct calendar dates in `rows` with `flag` set.
pub fn flagged_dates<T: CalendarRow>(rows: &[T], flag: CalendarFlag) -> usize {
    rows.iter()
        .filter(|row| flag.is_set(*row))
        .map(CalendarRow::date)
        .collect::<HashSet<_>>()
        .len()
}

/// The `n` most recent weeks of `history` containing a flagged day, in
/// chronological order.
pub fn recent_flagged_weeks<T: CalendarRow>(
    history: &[T],
    flag: CalendarFlag,
    n: usize,
) -> Vec<YearWeek> {
    recent_flagged_weeks_excluding(history, flag, n, &HashSet::new())
}

/// Like [`recent_flagged_weeks`], skipping weeks in `exclude`.
fn recent_flagged_weeks_excluding<T: CalendarRow>(
    history: &[T],
    flag: CalendarFlag,
    n: usize,
    exclude: &HashSet<YearWeek>,
) -> Vec<YearWeek> {
    let mut flagged: Vec<&T> = history
        .iter()
        .filter(|row| flag.is_set(*row) && !exclude.contains(&row.year_week()))
        .collect();
    flagged.sort_by_key(|row| row.timestamp());

    let mut seen = HashSet::new();
    let weeks: Vec<YearWeek> = flagged
        .iter()
        .map(|row| row.year_week())
        .filter(|week| seen.insert(*week))
        .collect();

    let skip = weeks.len().saturating_sub(n);
    weeks[skip..].to_vec()
}

/// Backfill weeks containing `flag` days until the CV window holds at least
/// `target_n` flagged dates, but only when the flag appears in the test or
/// forecast window.
///
/// Returns the CV window unchanged when no backfill is needed. When history
/// holds fewer flagged weeks than the deficit, whatever is available is
/// taken. History weeks already present in the CV window are never taken
/// again.
pub fn backfill_flagged_weeks<T, F>(
    input: AugmentInput<'_, T, F>,
    flag: CalendarFlag,
    target_n: usize,
) -> Backfill<T>
where
    T: CalendarRow + Clone,
    F: CalendarRow,
{
    let upcoming = input.forecast_window.iter().any(|row| flag.is_set(row))
        || input.test.iter().any(|row| flag.is_set(row));
    let in_cv = flagged_dates(input.cv, flag);

    if !upcoming || in_cv >= target_n {
        return Backfill {
            cv: input.cv.to_vec(),
            added_weeks: Vec::new(),
            requested: 0,
        };
    }

    let deficit = target_n - in_cv;
    let cv_weeks: HashSet<YearWeek> = input.cv.iter().map(CalendarRow::year_week).collect();
    let added_weeks = recent_flagged_weeks_excluding(input.history, flag, deficit, &cv_weeks);

    let mut added = rows_in_weeks(input.history, &added_weeks);
    added.sort_by_key(|row| row.timestamp());

    if added_weeks.len() < deficit {
        tracing::warn!(
            "Only {} of {} {} weeks available in history",
            added_weeks.len(),
            deficit,
            flag.name()
        );
    }
    tracing::info!(
        "Backfilled {} {} weeks ({} rows) into CV window: {:?}",
        added_weeks.len(),
        flag.name(),
        added.len(),
        added_weeks.iter().map(|w| w.to_string()).collect::<Vec<_>>()
    );

    added.extend(input.cv.iter().cloned());
    Backfill {
        cv: added,
        added_weeks,
        requested: deficit,
    }
}

/// Apply holiday then bridge-day backfill to the CV window.
pub fn augment_cv_window<T, F>(
    input: AugmentInput<'_, T, F>,
    holiday_target: usize,
    bridge_target: usize,
) -> Vec<T>
where
    T: CalendarRow + Clone,
    F: CalendarRow,
{
    let holidays = backfill_flagged_weeks(input, CalendarFlag::Holiday, holiday_target);
    let bridged = backfill_flagged_weeks(
        AugmentInput {
            cv: &holidays.cv,
            ..input
        },
        CalendarFlag::BridgeDay,
        bridge_target,
    );
    tracing::debug!(
        "CV window after augmentation: {} rows over {} weeks",
        bridged.cv.len(),
        distinct_weeks(&bridged.cv).len()
    );
    bridged.cv
}
