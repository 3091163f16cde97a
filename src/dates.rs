use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// A calendar day, serialized as `[year, month, day]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(i32, u32, u32)", into = "(i32, u32, u32)")]
pub struct CalendarDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl CalendarDate {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    pub fn to_naive(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

impl From<(i32, u32, u32)> for CalendarDate {
    fn from((year, month, day): (i32, u32, u32)) -> Self {
        Self { year, month, day }
    }
}

impl From<CalendarDate> for (i32, u32, u32) {
    fn from(date: CalendarDate) -> Self {
        (date.year, date.month, date.day)
    }
}

impl From<NaiveDate> for CalendarDate {
    fn from(date: NaiveDate) -> Self {
        Self::new(date.year(), date.month(), date.day())
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for CalendarDate {
    fn from(dt: DateTime<Tz>) -> Self {
        dt.date_naive().into()
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Parses an optional `YYYY-MM-DD` string.
///
/// `None` means "no constraint" and yields `Ok(None)`. Anything that does not
/// split on `-` into exactly three integers naming a real day is rejected.
pub fn parse_date(input: Option<&str>) -> Result<Option<CalendarDate>> {
    let Some(raw) = input else {
        return Ok(None);
    };

    let malformed = || AppError::MalformedDate(format!("expected YYYY-MM-DD, got {raw:?}"));

    let segments: Vec<&str> = raw.trim().split('-').collect();
    let [year, month, day] = segments.as_slice() else {
        return Err(malformed());
    };

    let year: i32 = year.parse().map_err(|_| malformed())?;
    let month: u32 = month.parse().map_err(|_| malformed())?;
    let day: u32 = day.parse().map_err(|_| malformed())?;

    let date = CalendarDate::new(year, month, day);
    if date.to_naive().is_none() {
        return Err(AppError::MalformedDate(format!("{raw:?} is not a calendar date")));
    }
    Ok(Some(date))
}
