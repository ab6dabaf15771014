use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::{Error, Result};

const CRON_PREFIX: &str = "cron ";

/// A parsed cron expression together with its source text.
///
/// The source text is kept because [`Schedule`] has no stable textual form
/// and the expression participates in trigger-config fingerprints.
#[derive(Clone, Debug)]
pub struct CronExpr {
    source: String,
    schedule: Schedule,
}

impl CronExpr {
    /// Parse a cron expression. Five-field (minute-resolution) expressions
    /// are accepted and normalized to the six-field form by pinning the
    /// seconds column to `0`.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let fields = trimmed.split_whitespace().count();
        let normalized = if fields == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_owned()
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| Error::InvalidInterval {
            input: expr.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: trimmed.to_owned(),
            schedule,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The next occurrence strictly after `reference`, in UTC.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule
            .after(&reference)
            .next()
            .ok_or_else(|| Error::NoFutureOccurrence(self.source.clone()))
    }
}

/// The interval syntax shared by cron tasks and cleanup schedules.
///
/// * a number is a delay in milliseconds,
/// * a duration string (`"1h"`, `"24h"`, `"500ms"`) is a fixed delay,
/// * `"CRON <expr>"` (case-insensitive prefix) is a cron schedule.
#[derive(Clone, Debug)]
pub enum Interval {
    Every(Duration),
    Cron(CronExpr),
}

impl Interval {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        let prefixed = trimmed
            .get(..CRON_PREFIX.len())
            .map(|head| head.eq_ignore_ascii_case(CRON_PREFIX))
            .unwrap_or(false);
        if prefixed {
            return Ok(Self::Cron(CronExpr::parse(&trimmed[CRON_PREFIX.len()..])?));
        }

        // A star-studded five-token string is almost certainly a cron
        // expression missing its prefix; refuse it instead of guessing.
        if trimmed.contains('*') && trimmed.split_whitespace().count() >= 5 {
            return Err(Error::BareCronExpression(trimmed.to_owned()));
        }

        match humantime::parse_duration(trimmed) {
            Ok(duration) => Ok(Self::Every(duration)),
            Err(e) => Err(Error::InvalidInterval {
                input: input.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::Every(Duration::from_millis(millis))
    }

    /// Compute the next run time relative to `reference`.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Every(duration) => {
                let delta = chrono::Duration::from_std(*duration).unwrap_or(chrono::Duration::MAX);
                Ok(reference + delta)
            }
            Self::Cron(expr) => expr.next_after(reference),
        }
    }
}

impl From<u64> for Interval {
    fn from(millis: u64) -> Self {
        Self::from_millis(millis)
    }
}

impl From<Duration> for Interval {
    fn from(duration: Duration) -> Self {
        Self::Every(duration)
    }
}

impl TryFrom<&str> for Interval {
    type Error = Error;

    fn try_from(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}

/// Accepted interval inputs for the registration APIs: an [`Interval`], a
/// millisecond count, a [`Duration`], or the string syntax.
pub trait IntoInterval {
    fn into_interval(self) -> Result<Interval>;
}

impl IntoInterval for Interval {
    fn into_interval(self) -> Result<Interval> {
        Ok(self)
    }
}

impl IntoInterval for u64 {
    fn into_interval(self) -> Result<Interval> {
        Ok(Interval::from_millis(self))
    }
}

impl IntoInterval for Duration {
    fn into_interval(self) -> Result<Interval> {
        Ok(Interval::Every(self))
    }
}

impl IntoInterval for &str {
    fn into_interval(self) -> Result<Interval> {
        Interval::parse(self)
    }
}

impl IntoInterval for String {
    fn into_interval(self) -> Result<Interval> {
        Interval::parse(&self)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_duration_strings() {
        let reference = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();

        for (input, secs) in [("1h", 3600), ("24h", 86400), ("30s", 30)] {
            let interval = Interval::parse(input).unwrap();
            let next = interval.next_after(reference).unwrap();
            assert_eq!((next - reference).num_seconds(), secs, "input {input}");
        }

        let half_second = Interval::parse("500ms").unwrap();
        let next = half_second.next_after(reference).unwrap();
        assert_eq!((next - reference).num_milliseconds(), 500);
    }

    #[test]
    fn millis_input_is_a_delay() {
        let reference = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        let interval = Interval::from_millis(3_600_000);
        let next = interval.next_after(reference).unwrap();
        assert_eq!((next - reference).num_hours(), 1);
    }

    #[test]
    fn cron_prefix_is_case_insensitive() {
        let reference = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();

        for input in ["CRON 0 3 * * *", "cron 0 3 * * *", "Cron 0 3 * * *"] {
            let interval = Interval::parse(input).unwrap();
            let next = interval.next_after(reference).unwrap();
            assert_eq!(
                next,
                Utc.with_ymd_and_hms(2023, 1, 2, 3, 0, 0).unwrap(),
                "input {input}"
            );
        }
    }

    #[test]
    fn six_field_cron_keeps_seconds() {
        let reference = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        let interval = Interval::parse("CRON */10 * * * * *").unwrap();
        let next = interval.next_after(reference).unwrap();
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 10).unwrap()
        );
    }

    #[test]
    fn bare_cron_expression_is_rejected() {
        assert!(matches!(
            Interval::parse("*/5 * * * *"),
            Err(Error::BareCronExpression(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Interval::parse("sometime soon"),
            Err(Error::InvalidInterval { .. })
        ));
    }
}
