// Date and time utilities for the log tree.  All times are UTC; the tree is partitioned by UTC
// date.

use crate::Timestamp;

use anyhow::Result;
use chrono::prelude::DateTime;
use chrono::{Datelike, Duration, TimeZone, Timelike, Utc};

/// The current time, without subsecond precision.

pub fn now() -> Timestamp {
    let t = Utc::now();
    t.with_nanosecond(0).unwrap_or(t)
}

/// Returns None if the components do not make a valid time.

pub fn timestamp_from_ymdhms(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<Timestamp> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second).single()
}

/// Parse an RFC 3339 timestamp with any offset and normalize it to UTC.

pub fn parse_rfc3339(s: &str) -> Result<Timestamp> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

pub fn truncate_to_day(t: Timestamp) -> Timestamp {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0).single().unwrap_or(t)
}

pub fn truncate_to_hour(t: Timestamp) -> Timestamp {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0).single().unwrap_or(t)
}

pub fn add_day(t: Timestamp) -> Timestamp {
    t + Duration::days(1)
}

pub fn add_hour(t: Timestamp) -> Timestamp {
    t + Duration::hours(1)
}

/// Returns vector of (year, month, day) with times inclusive between the days of t1 and t2; sub-day
/// information in t1 and t2 is ignored.

pub fn date_range(t1: Timestamp, t2: Timestamp) -> Vec<(i32, u32, u32)> {
    let d2 = truncate_to_day(t2);
    let mut date_range = Vec::new();
    let mut current_date = truncate_to_day(t1);
    while current_date <= d2 {
        date_range.push((current_date.year(), current_date.month(), current_date.day()));
        current_date = add_day(current_date);
    }
    date_range
}

#[test]
fn test_date_range() {
    let from = timestamp_from_ymdhms(2023, 5, 30, 5, 20, 33).unwrap();
    let to = timestamp_from_ymdhms(2023, 6, 4, 0, 0, 0).unwrap();
    assert!(date_range(from, to).eq(&vec![
        (2023, 5, 30),
        (2023, 5, 31),
        (2023, 6, 1),
        (2023, 6, 2),
        (2023, 6, 3),
        (2023, 6, 4)
    ]));

    // Empty range
    assert!(date_range(to, from).is_empty());
}

#[test]
fn test_parse_rfc3339() {
    let t = parse_rfc3339("2023-08-15T12:46:53+02:00").unwrap();
    assert!(t == timestamp_from_ymdhms(2023, 8, 15, 10, 46, 53).unwrap());
    assert!(parse_rfc3339("2023-08-15 12:46").is_err());
}

#[test]
fn test_truncate() {
    let t = timestamp_from_ymdhms(2023, 8, 15, 10, 46, 53).unwrap();
    assert!(truncate_to_hour(t) == timestamp_from_ymdhms(2023, 8, 15, 10, 0, 0).unwrap());
    assert!(truncate_to_day(t) == timestamp_from_ymdhms(2023, 8, 15, 0, 0, 0).unwrap());
    assert!(add_hour(truncate_to_hour(t)) == timestamp_from_ymdhms(2023, 8, 15, 11, 0, 0).unwrap());
}
