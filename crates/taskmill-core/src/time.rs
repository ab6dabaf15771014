//! Small conversions between wall-clock math (chrono) and the wire
//! representation (`bson::DateTime`).

use std::time::Duration;

use chrono::Utc;
use mongodb::bson;

pub fn now() -> bson::DateTime {
    bson::DateTime::now()
}

/// `now + delta`, saturating on overflow.
pub fn from_now(delta: Duration) -> bson::DateTime {
    after(now(), delta)
}

pub fn after(start: bson::DateTime, delta: Duration) -> bson::DateTime {
    let millis = start
        .timestamp_millis()
        .saturating_add(delta.as_millis().min(i64::MAX as u128) as i64);
    bson::DateTime::from_millis(millis)
}

pub fn to_chrono(dt: bson::DateTime) -> chrono::DateTime<Utc> {
    dt.to_chrono()
}

pub fn from_chrono(dt: chrono::DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(dt)
}

/// How long until `deadline`, or zero if it already passed.
pub fn until(deadline: bson::DateTime) -> Duration {
    let delta = deadline.timestamp_millis() - now().timestamp_millis();
    if delta <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(delta as u64)
    }
}

pub fn is_expired(deadline: bson::DateTime) -> bool {
    deadline <= now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_now_advances() {
        let base = now();
        let later = after(base, Duration::from_secs(60));
        assert_eq!(later.timestamp_millis() - base.timestamp_millis(), 60_000);
    }

    #[test]
    fn until_clamps_to_zero() {
        let past = bson::DateTime::from_millis(0);
        assert_eq!(until(past), Duration::ZERO);
    }
}
