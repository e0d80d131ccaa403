//! Scale-to-zero schedule evaluation.
//!
//! A pool's scale-down schedule is a standard five-field cron expression
//! (minute, hour, day-of-month, month, day-of-week). Each fire time opens a
//! short window during which the pool's idle target is forced to zero. The
//! window absorbs reconciliation jitter: a tick that lands a little after
//! the fire time still sees it as active.
//!
//! Evaluation never reads the clock; `now` is always supplied.

use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use thiserror::Error;
use tracing::warn;

/// Day-of-week names indexed by standard cron number (0 and 7 are Sunday).
const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("invalid day-of-week {0:?}")]
    DayOfWeek(String),

    #[error("invalid cron expression: {0}")]
    Parse(String),
}

/// A parsed five-field schedule.
///
/// When both day-of-month and day-of-week are restricted, a day matches
/// if either field does, as in standard cron. The cron crate requires
/// both, so that case is held as two schedules and the earlier fire time
/// wins.
#[derive(Debug, Clone)]
pub struct ScaleDownSchedule {
    expression: String,
    schedules: Vec<Schedule>,
}

impl ScaleDownSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields[..] else {
            return Err(ScheduleError::FieldCount(fields.len()));
        };

        // The cron crate wants a leading seconds field and numbers Sunday
        // as 1, so weekdays are passed by name.
        let day_of_week = translate_day_of_week(day_of_week)?;
        let day_pairs = if is_restricted(day_of_month) && is_restricted(&day_of_week) {
            vec![(day_of_month, "*"), ("*", day_of_week.as_str())]
        } else {
            vec![(day_of_month, day_of_week.as_str())]
        };

        let schedules = day_pairs
            .into_iter()
            .map(|(dom, dow)| {
                Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
                    .map_err(|e| ScheduleError::Parse(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            expression: expression.to_string(),
            schedules,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }

    /// True when a fire time falls in `(now - window, now]`.
    ///
    /// The next fire time after `now - window` is inside
    /// `[now - window, now + window]` and not after `now`.
    pub fn is_active(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        let Some(start) = now.checked_sub_signed(window) else {
            return false;
        };
        let end = now.checked_add_signed(window).unwrap_or(now);
        self.next_after(start)
            .is_some_and(|fire| fire >= start && fire <= end && fire <= now)
    }
}

/// Whether a scale-to-zero window is active for `schedule` at `now`.
///
/// An absent or blank schedule is never active. An unparseable schedule is
/// logged and treated as absent so the pool keeps its minimum.
pub fn should_scale_to_zero(schedule: Option<&str>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(expression) = schedule.map(str::trim).filter(|s| !s.is_empty()) else {
        return false;
    };
    match ScaleDownSchedule::parse(expression) {
        Ok(schedule) => schedule.is_active(now, window),
        Err(e) => {
            warn!(schedule = %expression, error = %e, "ignoring invalid scale-down schedule");
            false
        }
    }
}

/// A day field starting with `*` (`*`, `*/2`) leaves the day open.
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*') && field != "?"
}

/// Rewrite numeric weekdays (0-7, Sunday = 0 or 7) as names, keeping
/// lists, ranges and steps intact.
fn translate_day_of_week(field: &str) -> Result<String, ScheduleError> {
    let parts = field
        .split(',')
        .map(|part| -> Result<String, ScheduleError> {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                // "5-7" would wrap past Saturday once 7 becomes SUN.
                Some((from, "7")) if step.is_none() && from != "0" && from != "7" => {
                    format!("{}-SAT,SUN", weekday(from)?)
                }
                Some((from, to)) => format!("{}-{}", weekday(from)?, weekday(to)?),
                None => weekday(range)?.into_owned(),
            };
            Ok(match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(","))
}

fn weekday(token: &str) -> Result<Cow<'_, str>, ScheduleError> {
    if token.is_empty() {
        return Err(ScheduleError::DayOfWeek(token.to_string()));
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        // "*", "?" and names pass through to the cron parser.
        return Ok(Cow::Borrowed(token));
    }
    token
        .parse::<usize>()
        .ok()
        .and_then(|n| WEEKDAYS.get(n))
        .map(|name| Cow::Borrowed(*name))
        .ok_or_else(|| ScheduleError::DayOfWeek(token.to_string()))
}
