//! Calendar rules used to flag holiday and bridge-day observations.
//!
//! Holidays follow North Rhine-Westphalia, where the metered building is
//! located, plus a Christmas season during which consumption behaves like a
//! holiday. Local time is Europe/Berlin.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc, Weekday,
};

/// First day of the Christmas season (December 23rd).
const CHRISTMAS_SEASON_START_DAY: u32 = 23;
/// Length of the Christmas season in days, reaching New Year's Day.
const CHRISTMAS_SEASON_DAYS: i64 = 10;

const CET_OFFSET_SECS: i32 = 3600;
const CEST_OFFSET_SECS: i32 = 2 * 3600;

/// Check whether a date is a public holiday in North Rhine-Westphalia.
pub fn is_public_holiday(date: NaiveDate) -> bool {
    match (date.month(), date.day()) {
        (1, 1) => return true,   // New Year
        (5, 1) => return true,   // Labour Day
        (10, 3) => return true,  // German Unity Day
        (11, 1) => return true,  // All Saints' Day
        (12, 25) => return true, // Christmas Day
        (12, 26) => return true, // 2nd Day of Christmas
        _ => {}
    }

    let Some(easter) = easter_date(date.year()) else {
        return false;
    };
    let offset = (date - easter).num_days();

    // Good Friday, Easter Monday, Ascension, Whit Monday, Corpus Christi
    matches!(offset, -2 | 1 | 39 | 50 | 60)
}

/// Check whether a date falls in the Christmas season (Dec 23 to Jan 1).
pub fn is_christmas_season(date: NaiveDate) -> bool {
    let season_year = if date.month() == 1 {
        date.year() - 1
    } else {
        date.year()
    };
    let Some(start) = NaiveDate::from_ymd_opt(season_year, 12, CHRISTMAS_SEASON_START_DAY) else {
        return false;
    };
    let offset = (date - start).num_days();
    (0..CHRISTMAS_SEASON_DAYS).contains(&offset)
}

/// Holiday flag as used by the model: public holiday or Christmas season.
pub fn is_holiday(date: NaiveDate) -> bool {
    is_public_holiday(date) || is_christmas_season(date)
}

/// Check whether a date is a bridge day.
///
/// A bridge day is a Monday directly before a Tuesday public holiday, or a
/// Friday directly after a Thursday public holiday, and is not itself a
/// public holiday.
pub fn is_bridge_day(date: NaiveDate) -> bool {
    if is_public_holiday(date) {
        return false;
    }
    match date.weekday() {
        Weekday::Mon => is_public_holiday(date + Duration::days(1)),
        Weekday::Fri => is_public_holiday(date - Duration::days(1)),
        _ => false,
    }
}

/// Calculate Easter Sunday using the anonymous Gregorian algorithm.
fn easter_date(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;

    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

// ==================== Europe/Berlin ====================

/// Last Sunday of a month at 01:00 UTC, the EU daylight-saving switch instant.
fn last_sunday_switch(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = first_next - Duration::days(1);
    let back = last.weekday().num_days_from_sunday() as i64;
    let sunday = last - Duration::days(back);
    Some(Utc.from_utc_datetime(&sunday.and_hms_opt(1, 0, 0)?))
}

/// UTC offset of Europe/Berlin at a given instant.
pub fn berlin_offset(instant: DateTime<Utc>) -> FixedOffset {
    let year = instant.year();
    let summer = match (last_sunday_switch(year, 3), last_sunday_switch(year, 10)) {
        (Some(start), Some(end)) => instant >= start && instant < end,
        _ => false,
    };
    let secs = if summer {
        CEST_OFFSET_SECS
    } else {
        CET_OFFSET_SECS
    };
    FixedOffset::east_opt(secs).unwrap_or_else(|| Utc.fix())
}

/// Convert a UTC instant to Berlin local time.
pub fn to_berlin(instant: DateTime<Utc>) -> DateTime<FixedOffset> {
    instant.with_timezone(&berlin_offset(instant))
}

#[cfg(test)]
mod tests {
    use chrono::Timelike;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // ==================== Easter Date Tests ====================

    #[test]
    fn test_easter_known_years() {
        assert_eq!(easter_date(2024).unwrap(), date(2024, 3, 31));
        assert_eq!(easter_date(2025).unwrap(), date(2025, 4, 20));
        assert_eq!(easter_date(2008).unwrap(), date(2008, 3, 23));
    }

    // ==================== Holiday Tests ====================

    #[test]
    fn test_fixed_public_holidays() {
        assert!(is_public_holiday(date(2024, 1, 1)));
        assert!(is_public_holiday(date(2024, 5, 1)));
        assert!(is_public_holiday(date(2024, 10, 3)));
        assert!(is_public_holiday(date(2024, 11, 1)));
        assert!(is_public_holiday(date(2024, 12, 25)));
        assert!(is_public_holiday(date(2024, 12, 26)));
    }

    #[test]
    fn test_bavarian_only_holidays_are_not_flagged() {
        // Epiphany and Assumption Day are not holidays in NRW
        assert!(!is_public_holiday(date(2024, 1, 6)));
        assert!(!is_public_holiday(date(2024, 8, 15)));
    }

    #[test]
    fn test_easter_based_holidays_2024() {
        assert!(is_public_holiday(date(2024, 3, 29))); // Good Friday
        assert!(is_public_holiday(date(2024, 4, 1))); // Easter Monday
        assert!(is_public_holiday(date(2024, 5, 9))); // Ascension
        assert!(is_public_holiday(date(2024, 5, 20))); // Whit Monday
        assert!(is_public_holiday(date(2024, 5, 30))); // Corpus Christi
        assert!(!is_public_holiday(date(2024, 3, 31))); // Easter Sunday itself
    }

    #[test]
    fn test_christmas_season_spans_new_year() {
        assert!(!is_christmas_season(date(2024, 12, 22)));
        assert!(is_christmas_season(date(2024, 12, 23)));
        assert!(is_christmas_season(date(2024, 12, 31)));
        assert!(is_christmas_season(date(2025, 1, 1)));
        assert!(!is_christmas_season(date(2025, 1, 2)));
        assert!(is_holiday(date(2024, 12, 27)));
    }

    // ==================== Bridge Day Tests ====================

    #[test]
    fn test_friday_after_ascension_is_bridge_day() {
        // Ascension 2024 is Thursday May 9
        assert!(is_bridge_day(date(2024, 5, 10)));
        // Corpus Christi 2024 is Thursday May 30
        assert!(is_bridge_day(date(2024, 5, 31)));
    }

    #[test]
    fn test_monday_before_tuesday_holiday_is_bridge_day() {
        // German Unity Day 2023 is Tuesday October 3
        assert!(is_bridge_day(date(2023, 10, 2)));
    }

    #[test]
    fn test_regular_days_are_not_bridge_days() {
        assert!(!is_bridge_day(date(2024, 7, 19)));
        assert!(!is_bridge_day(date(2024, 5, 9))); // holiday itself
        // Wednesday after a Tuesday holiday
        assert!(!is_bridge_day(date(2023, 10, 4)));
    }

    // ==================== Berlin Offset Tests ====================

    #[test]
    fn test_berlin_offset_winter_and_summer() {
        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let summer = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();

        assert_eq!(berlin_offset(winter).local_minus_utc(), 3600);
        assert_eq!(berlin_offset(summer).local_minus_utc(), 7200);
    }

    #[test]
    fn test_berlin_offset_switches_at_one_utc() {
        // 2024 spring forward: Sunday March 31, 01:00 UTC
        let before = Utc.with_ymd_and_hms(2024, 3, 31, 0, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 31, 1, 0, 0).unwrap();
        assert_eq!(berlin_offset(before).local_minus_utc(), 3600);
        assert_eq!(berlin_offset(after).local_minus_utc(), 7200);

        // 2024 fall back: Sunday October 27, 01:00 UTC
        let before = Utc.with_ymd_and_hms(2024, 10, 27, 0, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 10, 27, 1, 0, 0).unwrap();
        assert_eq!(berlin_offset(before).local_minus_utc(), 7200);
        assert_eq!(berlin_offset(after).local_minus_utc(), 3600);
    }

    #[test]
    fn test_to_berlin_keeps_instant() {
        let instant = Utc.with_ymd_and_hms(2024, 7, 15, 22, 30, 0).unwrap();
        let local = to_berlin(instant);

        assert_eq!(local.with_timezone(&Utc), instant);
        assert_eq!(local.hour(), 0);
        assert_eq!(local.date_naive(), date(2024, 7, 16));
    }

    // ==================== Property-Based Tests ====================

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn bridge_days_are_mondays_or_fridays(ordinal in 0i64..3650) {
                let day = date(2020, 1, 1) + Duration::days(ordinal);
                if is_bridge_day(day) {
                    prop_assert!(matches!(day.weekday(), Weekday::Mon | Weekday::Fri));
                    prop_assert!(!is_public_holiday(day));
                }
            }

            #[test]
            fn easter_always_on_sunday(year in 1900i32..2100) {
                let easter = easter_date(year).unwrap();
                prop_assert_eq!(easter.weekday(), Weekday::Sun);
            }
        }
    }
}
