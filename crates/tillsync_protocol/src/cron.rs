//! 5-field cron expressions: minute, hour, day-of-month, month, day-of-week.
//!
//! Supports `*`, ranges, lists, `*/step` and `a-b/step`, with `7` accepted as
//! an alias for Sunday in the day-of-week field. Day matching follows the
//! classic Vixie rule: when both day-of-month and day-of-week are restricted,
//! a timestamp matches if it satisfies either one. Seconds and years are not
//! supported.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Upper bound on minute stepping when searching for the next fire time.
const MAX_SEARCH_MINUTES: u32 = 366 * 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression must contain 5 fields")]
    FieldCount,
    #[error("empty cron field")]
    EmptyField,
    #[error("invalid integer in cron field: {0}")]
    InvalidInteger(String),
    #[error("cron value out of range")]
    OutOfRange,
    #[error("invalid range in cron field")]
    InvalidRange,
    #[error("cron step must be > 0")]
    ZeroStep,
    #[error("could not compute a next fire time within one year")]
    NoUpcomingFire,
}

/// One parsed cron field: the allowed values plus whether the raw token was a
/// bare `*`. The wildcard flag matters for the day-of-month/day-of-week rule.
#[derive(Debug, Clone)]
struct Field {
    allowed: BTreeSet<u32>,
    wildcard: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.allowed.contains(&value)
    }
}

fn parse_int(token: &str) -> Result<u32, CronError> {
    token
        .parse::<u32>()
        .map_err(|_| CronError::InvalidInteger(token.to_string()))
}

fn expand_field(
    token: &str,
    minimum: u32,
    maximum: u32,
    seven_is_sunday: bool,
) -> Result<Field, CronError> {
    let raw = token.trim();
    if raw.is_empty() {
        return Err(CronError::EmptyField);
    }

    let wildcard = raw == "*";
    let mut allowed = BTreeSet::new();
    let maximum_allowed = if seven_is_sunday { 7 } else { maximum };

    for segment in raw.split(',') {
        let part = segment.trim();
        if part.is_empty() {
            return Err(CronError::EmptyField);
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step_raw)) => {
                let step = parse_int(step_raw)?;
                if step == 0 {
                    return Err(CronError::ZeroStep);
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (start, end) = if base == "*" {
            (minimum, maximum)
        } else if let Some((start_raw, end_raw)) = base.split_once('-') {
            (parse_int(start_raw)?, parse_int(end_raw)?)
        } else {
            let value = parse_int(base)?;
            (value, value)
        };

        if start < minimum || start > maximum_allowed || end < minimum || end > maximum_allowed {
            return Err(CronError::OutOfRange);
        }
        if start > end {
            return Err(CronError::InvalidRange);
        }

        let mut value = start;
        while value <= end {
            let normalized = if seven_is_sunday && value == 7 { 0 } else { value };
            if normalized < minimum || normalized > maximum {
                return Err(CronError::OutOfRange);
            }
            allowed.insert(normalized);
            value += step;
        }
    }

    if allowed.is_empty() {
        return Err(CronError::EmptyField);
    }
    Ok(Field { allowed, wildcard })
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: Field,
    hours: Field,
    dom: Field,
    months: Field,
    dow: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount);
        }
        Ok(Self {
            minutes: expand_field(parts[0], 0, 59, false)?,
            hours: expand_field(parts[1], 0, 23, false)?,
            dom: expand_field(parts[2], 1, 31, false)?,
            months: expand_field(parts[3], 1, 12, false)?,
            dow: expand_field(parts[4], 0, 6, true)?,
        })
    }

    /// Validate an expression without keeping the parse.
    pub fn validate(expr: &str) -> Result<(), CronError> {
        Self::parse(expr).map(|_| ())
    }

    /// Whether a local wall-clock minute matches this expression.
    pub fn matches_local(&self, candidate: &NaiveDateTime) -> bool {
        if !self.minutes.contains(candidate.minute()) {
            return false;
        }
        if !self.hours.contains(candidate.hour()) {
            return false;
        }
        if !self.months.contains(candidate.month()) {
            return false;
        }

        let dom_match = self.dom.contains(candidate.day());
        let dow_match = self.dow.contains(candidate.weekday().num_days_from_sunday());
        match (self.dom.wildcard, self.dow.wildcard) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// First firing strictly after `from`, evaluated in `tz` wall-clock time
    /// and returned in UTC. Searches minute by minute with a one-year cutoff.
    ///
    /// Local minutes that fall in a spring-forward gap are skipped; minutes
    /// made ambiguous by a fall-back transition resolve to the earlier
    /// offset.
    pub fn next_fire_after(&self, from: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, CronError> {
        let local = from.with_timezone(&tz).naive_local();
        let truncated = local
            .date()
            .and_hms_opt(local.hour(), local.minute(), 0)
            .ok_or(CronError::NoUpcomingFire)?;

        let mut candidate = truncated + Duration::minutes(1);
        for _ in 0..MAX_SEARCH_MINUTES {
            if self.matches_local(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Ok(earliest.with_timezone(&Utc))
                    }
                    chrono::LocalResult::None => {}
                }
            }
            candidate += Duration::minutes(1);
        }
        Err(CronError::NoUpcomingFire)
    }
}
