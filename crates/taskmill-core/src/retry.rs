use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{CronExpr, Result};

/// Delay shape applied between failed attempts.
#[derive(Clone, Debug)]
pub enum Backoff {
    /// `next = now + interval`.
    Fixed { interval: Duration },
    /// `next = now + interval * attempts`.
    Linear { interval: Duration },
    /// `next = now + clamp(min * factor^(attempts - 1), min, max)`.
    Exponential {
        min: Duration,
        max: Duration,
        factor: f64,
    },
    /// `next = now + intervals[min(attempts - 1, len - 1)]`.
    Series { intervals: Vec<Duration> },
    /// `next =` the next occurrence of the expression after `now`.
    Cron(CronExpr),
}

/// Retry policy for a reactive task.
///
/// `max_attempts` and `max_duration` are alternative exhaustion criteria:
/// setting an explicit `max_duration` lifts the default attempt cap, so a
/// policy with only `max_duration` retries until the failure streak is older
/// than the duration.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    backoff: Backoff,
    max_attempts: Option<i32>,
    max_duration: Option<Duration>,
    reset_retries_on_data_change: bool,
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Backoff::Exponential {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
        })
    }
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            max_attempts: None,
            max_duration: None,
            reset_retries_on_data_change: true,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(Backoff::Fixed { interval })
    }

    pub fn linear(interval: Duration) -> Self {
        Self::new(Backoff::Linear { interval })
    }

    pub fn exponential(min: Duration, max: Duration) -> Self {
        Self::new(Backoff::Exponential {
            min,
            max,
            factor: 2.0,
        })
    }

    pub fn series(intervals: Vec<Duration>) -> Self {
        Self::new(Backoff::Series { intervals })
    }

    pub fn cron(expr: &str) -> Result<Self> {
        Ok(Self::new(Backoff::Cron(CronExpr::parse(expr)?)))
    }

    /// Cap the number of attempts; `-1` retries forever.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Fail once the failure streak is older than `max_duration`. Lifts the
    /// attempt cap unless one was set explicitly.
    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn reset_retries_on_data_change(mut self, reset: bool) -> Self {
        self.reset_retries_on_data_change = reset;
        self
    }

    pub fn resets_on_data_change(&self) -> bool {
        self.reset_retries_on_data_change
    }

    fn effective_max_attempts(&self) -> i32 {
        match (self.max_attempts, self.max_duration) {
            (Some(n), _) => n,
            (None, Some(_)) => -1,
            (None, None) => DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// When the next attempt may start, given that `attempts` invocations
    /// (the failed one included) have already run.
    pub fn next_run(&self, attempts: i32, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let attempts = attempts.max(1);
        let delay = match &self.backoff {
            Backoff::Fixed { interval } => *interval,
            Backoff::Linear { interval } => interval.saturating_mul(attempts as u32),
            Backoff::Exponential { min, max, factor } => {
                let raw = min.as_millis() as f64 * factor.powi(attempts - 1);
                let clamped = raw.clamp(min.as_millis() as f64, max.as_millis() as f64);
                Duration::from_millis(clamped as u64)
            }
            Backoff::Series { intervals } => {
                let index = (attempts as usize - 1).min(intervals.len().saturating_sub(1));
                intervals.get(index).copied().unwrap_or(Duration::ZERO)
            }
            Backoff::Cron(expr) => return expr.next_after(now),
        };

        Ok(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX))
    }

    /// Whether the item should transition to `failed` instead of being
    /// rescheduled.
    pub fn should_fail(
        &self,
        attempts: i32,
        first_error_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let max_attempts = self.effective_max_attempts();
        if max_attempts >= 0 && attempts >= max_attempts {
            return true;
        }

        if let (Some(max_duration), Some(first)) = (self.max_duration, first_error_at) {
            let elapsed = (now - first).to_std().unwrap_or(Duration::ZERO);
            if elapsed >= max_duration {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn fixed_backoff() {
        let policy = RetryPolicy::fixed(Duration::from_millis(50));
        for attempts in 1..4 {
            let next = policy.next_run(attempts, at()).unwrap();
            assert_eq!((next - at()).num_milliseconds(), 50);
        }
    }

    #[test]
    fn linear_backoff_scales_with_attempts() {
        let policy = RetryPolicy::linear(Duration::from_secs(10));
        let next = policy.next_run(3, at()).unwrap();
        assert_eq!((next - at()).num_seconds(), 30);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10));

        let expected = [100, 200, 400, 800, 1600, 3200, 6400, 10_000, 10_000];
        for (attempt, millis) in expected.iter().enumerate() {
            let next = policy.next_run(attempt as i32 + 1, at()).unwrap();
            assert_eq!(
                (next - at()).num_milliseconds(),
                *millis,
                "attempt {}",
                attempt + 1
            );
        }
    }

    #[test]
    fn series_backoff_sticks_to_last_entry() {
        let policy = RetryPolicy::series(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(30),
        ]);

        assert_eq!((policy.next_run(1, at()).unwrap() - at()).num_seconds(), 1);
        assert_eq!((policy.next_run(2, at()).unwrap() - at()).num_seconds(), 5);
        assert_eq!((policy.next_run(3, at()).unwrap() - at()).num_seconds(), 30);
        assert_eq!((policy.next_run(9, at()).unwrap() - at()).num_seconds(), 30);
    }

    #[test]
    fn cron_backoff_follows_the_schedule() {
        let policy = RetryPolicy::cron("0 3 * * *").unwrap();
        let next = policy.next_run(1, at()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 6, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn default_attempt_cap() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1));
        assert!(!policy.should_fail(4, None, at()));
        assert!(policy.should_fail(5, None, at()));
    }

    #[test]
    fn negative_max_attempts_retries_forever() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1)).max_attempts(-1);
        assert!(!policy.should_fail(1_000_000, None, at()));
    }

    #[test]
    fn max_duration_lifts_the_attempt_cap() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1)).max_duration(Duration::from_secs(60));

        let fresh = at() - chrono::Duration::seconds(30);
        let stale = at() - chrono::Duration::seconds(90);

        assert!(!policy.should_fail(100, Some(fresh), at()));
        assert!(policy.should_fail(1, Some(stale), at()));
    }

    #[test]
    fn explicit_attempts_and_duration_combine() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1))
            .max_attempts(3)
            .max_duration(Duration::from_secs(3600));

        assert!(policy.should_fail(3, None, at()));
    }
}
