//! Conversions between epoch milliseconds and the compact per-granularity
//! integer values stored in the index.
//!
//! DAY values count days since 1970-01-01 UTC, MONTH values count months
//! since January 1970, YEAR values count years since 1970. Converting back
//! yields the instant at the start of the day, month, or year in UTC;
//! intra-unit time is not preserved.

use std::{fmt, str::FromStr};

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const EPOCH_YEAR: i32 = 1970;

/// Temporal quantization unit of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    Day,
    Month,
    Year,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Day, Granularity::Month, Granularity::Year];

    /// Uppercase name, used in durable-store rows and transport.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "DAY",
            Granularity::Month => "MONTH",
            Granularity::Year => "YEAR",
        }
    }

    /// Lowercase segment used in fast-store keys.
    pub fn key_segment(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = IndexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "DAY" => Ok(Granularity::Day),
            "MONTH" => Ok(Granularity::Month),
            "YEAR" => Ok(Granularity::Year),
            other => Err(IndexError::Validation(format!(
                "unknown granularity: {other}"
            ))),
        }
    }
}

/// Converts epoch milliseconds to days since 1970-01-01 UTC.
pub fn to_day_epoch(millis: i64) -> u32 {
    millis.div_euclid(MS_PER_DAY).max(0) as u32
}

/// Converts epoch milliseconds to months since January 1970, UTC calendar.
pub fn to_month_epoch(millis: i64) -> u32 {
    let date = Utc.timestamp_millis_opt(millis).unwrap();
    let months = (date.year() - EPOCH_YEAR) * 12 + (date.month() as i32 - 1);
    months.max(0) as u32
}

/// Converts epoch milliseconds to years since 1970, UTC calendar.
pub fn to_year_epoch(millis: i64) -> u32 {
    let date = Utc.timestamp_millis_opt(millis).unwrap();
    (date.year() - EPOCH_YEAR).max(0) as u32
}

/// Converts epoch milliseconds to the compact value for a granularity.
pub fn to_epoch_value(millis: i64, granularity: Granularity) -> u32 {
    match granularity {
        Granularity::Day => to_day_epoch(millis),
        Granularity::Month => to_month_epoch(millis),
        Granularity::Year => to_year_epoch(millis),
    }
}

/// Converts days since the epoch back to milliseconds at UTC midnight.
pub fn day_epoch_to_millis(day_epoch: u32) -> i64 {
    day_epoch as i64 * MS_PER_DAY
}

/// Converts months since January 1970 back to milliseconds at the first of
/// the month, UTC midnight.
pub fn month_epoch_to_millis(month_epoch: u32) -> i64 {
    let year = EPOCH_YEAR + (month_epoch / 12) as i32;
    let month = (month_epoch % 12) + 1;
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .unwrap()
        .timestamp_millis()
}

/// Converts years since 1970 back to milliseconds at Jan 1, UTC midnight.
pub fn year_epoch_to_millis(year_epoch: u32) -> i64 {
    Utc.with_ymd_and_hms(EPOCH_YEAR + year_epoch as i32, 1, 1, 0, 0, 0)
        .unwrap()
        .timestamp_millis()
}

/// Converts a compact value back to epoch milliseconds.
pub fn epoch_value_to_millis(value: u32, granularity: Granularity) -> i64 {
    match granularity {
        Granularity::Day => day_epoch_to_millis(value),
        Granularity::Month => month_epoch_to_millis(value),
        Granularity::Year => year_epoch_to_millis(value),
    }
}
