//! Time-of-day and weekday windows.
//!
//! Days use the platform numbering, 1 = Sunday through 7 = Saturday. All
//! comparisons are made in UTC at minute resolution.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use tracing::warn;

use super::model::TimeRange;
use crate::error::RuleError;

/// Parses `HH:MM` into a time of day.
pub fn parse_clock(value: &str) -> Result<NaiveTime, RuleError> {
    let invalid = || RuleError::InvalidTime(value.to_string());
    let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
    let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Parses a comma separated day list such as `1,2,3`.
pub fn parse_days(value: &str) -> Result<Vec<Weekday>, RuleError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|day| !day.is_empty())
        .map(|day| {
            day.parse::<u8>()
                .ok()
                .and_then(weekday_from_platform)
                .ok_or_else(|| RuleError::InvalidDay(day.to_string()))
        })
        .collect()
}

pub fn weekday_from_platform(day: u8) -> Option<Weekday> {
    match day {
        1 => Some(Weekday::Sun),
        2 => Some(Weekday::Mon),
        3 => Some(Weekday::Tue),
        4 => Some(Weekday::Wed),
        5 => Some(Weekday::Thu),
        6 => Some(Weekday::Fri),
        7 => Some(Weekday::Sat),
        _ => None,
    }
}

fn minutes(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

impl TimeRange {
    /// A range with any part left empty applies at all times.
    pub fn is_unbounded(&self) -> bool {
        self.start_time.trim().is_empty()
            || self.end_time.trim().is_empty()
            || self.days_of_week.trim().is_empty()
    }

    /// Whether `now` falls inside the window.
    ///
    /// A window whose end is before its start spans midnight: the part after
    /// midnight belongs to the day it started on.
    pub fn check(&self, now: DateTime<Utc>) -> Result<bool, RuleError> {
        if self.is_unbounded() {
            return Ok(true);
        }
        let start = minutes(parse_clock(&self.start_time)?);
        let end = minutes(parse_clock(&self.end_time)?);
        let days = parse_days(&self.days_of_week)?;
        let current = minutes(now.time());
        let today = now.weekday();

        if start <= end {
            return Ok(days.contains(&today) && start <= current && current <= end);
        }
        if current >= start {
            return Ok(days.contains(&today));
        }
        if current <= end {
            return Ok(days.contains(&today.pred()));
        }
        Ok(false)
    }

    /// Like [`TimeRange::check`], but a malformed window never applies.
    pub fn applies_at(&self, now: DateTime<Utc>) -> bool {
        self.check(now).unwrap_or_else(|e| {
            warn!("Ignoring malformed time range {self:?}: {e}");
            false
        })
    }
}
