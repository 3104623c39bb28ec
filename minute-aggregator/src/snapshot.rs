use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

use crate::window::WindowKey;

/// Aggregates materialized from an accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateValues {
    pub total_events: u64,
    pub avg_metric: f64,
    pub unique_users: u64,
    pub anomaly_events: u64,
}

/// Version stamp of a snapshot: milliseconds since the Unix epoch, the precision
/// of the `updated_at` column that storage resolves conflicts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(i64);

impl Version {
    pub fn from_millis(millis: i64) -> Self {
        Version(millis)
    }

    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        Version(instant.timestamp_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(instant) => write!(f, "{}", instant.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Issues version stamps from the wall clock.
///
/// A stamp is the current instant in milliseconds. It is pushed one millisecond
/// past the key's previous stamp when the clock has not advanced, and past the
/// startup floor when storage already holds newer rows. Keys never advance each
/// other's stamps, so a flush of many keys stamps them all with the same instant.
#[derive(Debug)]
pub struct VersionClock {
    floor_ms: AtomicI64,
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            floor_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Every stamp issued after this call is strictly greater than `floor`.
    /// Used at startup with the highest version already in storage.
    pub fn seed(&self, floor: Version) {
        self.floor_ms.fetch_max(floor.as_millis(), Ordering::SeqCst);
    }

    /// Stamp for a key whose last snapshot carried `previous`.
    pub fn stamp(&self, now: DateTime<Utc>, previous: Option<Version>) -> Version {
        let mut millis = now.timestamp_millis();
        let floor = self.floor_ms.load(Ordering::SeqCst);
        if floor != i64::MIN {
            millis = millis.max(floor.saturating_add(1));
        }
        if let Some(previous) = previous {
            millis = millis.max(previous.as_millis().saturating_add(1));
        }
        Version(millis)
    }
}

/// An immutable copy of one accumulator, the unit of write to storage. Storage
/// keeps the snapshot with the highest `version` per key.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: WindowKey,
    pub values: AggregateValues,
    pub version: Version,
    /// Accumulator revision this snapshot covers, used to acknowledge it
    pub revision: u64,
}

impl Snapshot {
    pub fn window_start(&self) -> DateTime<Utc> {
        self.key.window_start
    }
}
