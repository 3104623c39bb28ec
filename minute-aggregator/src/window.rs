//! Tumbling windows
//!
//! Every event belongs to exactly one fixed-size, non-overlapping window whose
//! start is the event time floored to the window size (aligned on the Unix
//! epoch):
//!
//! ```text
//! Window size: 60s
//! 00:00:10 -> [00:00:00, 00:01:00)
//! 00:00:59 -> [00:00:00, 00:01:00)
//! 00:01:00 -> [00:01:00, 00:02:00)
//! ```
//!
//! A window keeps accepting late events until `start + size + grace`, after
//! which it is closed: late events are dead-lettered and the accumulator is
//! evicted once its final snapshot is stored.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Identifies one aggregation bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub window_start: DateTime<Utc>,
    pub device_id: Option<String>,
}

impl WindowKey {
    pub fn global(window_start: DateTime<Utc>) -> Self {
        Self {
            window_start,
            device_id: None,
        }
    }

    pub fn for_device(window_start: DateTime<Utc>, device_id: impl Into<String>) -> Self {
        Self {
            window_start,
            device_id: Some(device_id.into()),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_id {
            Some(device_id) => write!(f, "{}/{}", self.window_start.to_rfc3339(), device_id),
            None => write!(f, "{}", self.window_start.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TumblingWindowAssigner {
    size_ms: i64,
    grace_ms: i64,
}

impl TumblingWindowAssigner {
    pub fn new(size: Duration, grace: Duration) -> Self {
        assert!(!size.is_zero(), "Window size must be positive");
        Self {
            size_ms: duration_ms(size),
            grace_ms: duration_ms(grace),
        }
    }

    pub fn size(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.size_ms)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.grace_ms)
    }

    /// `floor(event_time / size) * size`. Returns `None` only when the result
    /// falls outside the representable range.
    pub fn assign(&self, event_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ts = event_time.timestamp_millis();
        let aligned = ts.div_euclid(self.size_ms) * self.size_ms;
        DateTime::from_timestamp_millis(aligned)
    }

    /// The instant at which the window stops accepting events.
    pub fn closes_at(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        window_start + self.size() + self.grace()
    }

    pub fn is_closed(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.closes_at(window_start) <= now
    }

    /// Every window starting at or before the returned instant is closed at `now`.
    pub fn closed_horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.size() - self.grace()
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
