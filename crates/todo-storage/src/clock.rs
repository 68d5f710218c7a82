//! Millisecond clock that never repeats itself.
//!
//! Ledger entries and todos are keyed by ISO timestamps. Two writes inside
//! the same millisecond (or after the wall clock stepped backwards) would
//! collide, so each issued instant is strictly greater than the previous one.

use crate::lock;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use todo_core::schema::iso_timestamp;

#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_after(last: DateTime<Utc>) -> Self {
        Self {
            last: Mutex::new(Some(truncate_to_millis(last))),
        }
    }

    pub fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = truncate_to_millis(now);
        let mut last = lock(&self.last);
        let next = match *last {
            Some(previous) if now <= previous => previous + Duration::milliseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }

    pub fn next_id(&self, now: DateTime<Utc>) -> String {
        iso_timestamp(self.next(now))
    }
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
