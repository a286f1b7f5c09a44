//! Time window arithmetic shared by the rate, signup and quota checks.
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};

/// A window measured continuously backwards from "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    length: ChronoDuration,
}

impl SlidingWindow {
    pub fn new(length: Duration) -> Self {
        Self {
            length: chrono_duration(length),
        }
    }

    pub const fn length(&self) -> ChronoDuration {
        self.length
    }

    /// Earliest instant still inside the window ending at `now`.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.length
    }

    /// When the oldest in-window event leaves the window.
    pub fn reset_at(&self, oldest: DateTime<Utc>) -> DateTime<Utc> {
        oldest + self.length
    }
}

/// The UTC calendar day containing `now`, used to key daily usage.
pub fn calendar_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// Whole seconds until `reset`, rounded up and never below one.
pub fn retry_after_secs(now: DateTime<Utc>, reset: DateTime<Utc>) -> u64 {
    let remaining = reset - now;
    let millis = remaining.num_milliseconds().max(0);
    let secs = u64::try_from(millis).unwrap_or(0).div_ceil(1000);
    secs.max(1)
}

pub fn chrono_duration(window: Duration) -> ChronoDuration {
    ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(1))
}
