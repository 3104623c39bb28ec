//! Window Accumulator Table
//!
//! The only shared mutable state in the pipeline. Consumption workers call
//! [`AccumulatorTable::update`], the flusher snapshots, acknowledges and evicts.
//! Every operation on a key runs under that key's map shard lock, so an update
//! and a snapshot of the same window never interleave.
//!
//! Each accumulator also remembers the lowest source offset per partition that
//! contributed to it, and holds it until the window is evicted. A stored
//! snapshot of an open window is not enough to release it: after a restart the
//! window must be rebuilt from its first event, or its next snapshot would
//! replace the stored totals with partial ones. The offset tracker uses these
//! low watermarks to keep commits behind every resident window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::event::TelemetryEvent;
use crate::snapshot::{AggregateValues, Snapshot, Version, VersionClock};
use crate::window::WindowKey;

/// Position of a message in the source log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceOffset {
    pub partition: i32,
    pub offset: i64,
}

impl SourceOffset {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("window {0} is already closed")]
    WindowClosed(WindowKey),
}

/// Mutable aggregate state for one window key.
#[derive(Debug)]
pub struct WindowAccumulator {
    total_events: u64,
    metric_sum: f64,
    metric_count: u64,
    unique_users: AHashSet<String>,
    anomaly_events: u64,
    /// Stamp of the last snapshot taken, stored or not
    last_version: Option<Version>,
    /// Bumped on every applied event
    revision: u64,
    /// Highest revision covered by a stored snapshot
    flushed_revision: u64,
    flush_paused: bool,
    /// Lowest offset per partition ever applied, held until eviction
    first_offsets: HashMap<i32, i64>,
}

impl WindowAccumulator {
    fn new() -> Self {
        Self {
            total_events: 0,
            metric_sum: 0.0,
            metric_count: 0,
            unique_users: AHashSet::new(),
            anomaly_events: 0,
            last_version: None,
            revision: 0,
            flushed_revision: 0,
            flush_paused: false,
            first_offsets: HashMap::new(),
        }
    }

    fn apply(
        &mut self,
        event: &TelemetryEvent,
        anomaly_score_threshold: f64,
        source: Option<SourceOffset>,
    ) {
        self.total_events += 1;
        self.metric_sum += event.metric_value;
        self.metric_count += 1;
        if event.is_anomaly(anomaly_score_threshold) {
            self.anomaly_events += 1;
        }
        if let Some(user_id) = &event.user_id {
            if !self.unique_users.contains(user_id) {
                self.unique_users.insert(user_id.clone());
            }
        }
        if let Some(source) = source {
            keep_lowest(&mut self.first_offsets, source.partition, source.offset);
        }
        self.revision += 1;
    }

    pub fn values(&self) -> AggregateValues {
        let avg_metric = if self.metric_count == 0 {
            0.0
        } else {
            self.metric_sum / self.metric_count as f64
        };
        AggregateValues {
            total_events: self.total_events,
            avg_metric,
            unique_users: self.unique_users.len() as u64,
            anomaly_events: self.anomaly_events,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.revision > self.flushed_revision
    }

    pub fn is_paused(&self) -> bool {
        self.flush_paused
    }

    fn held_offsets(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.first_offsets
            .iter()
            .map(|(partition, offset)| (*partition, *offset))
    }
}

fn keep_lowest(offsets: &mut HashMap<i32, i64>, partition: i32, offset: i64) {
    offsets
        .entry(partition)
        .and_modify(|current| *current = (*current).min(offset))
        .or_insert(offset);
}

/// Point-in-time figures for the whole table, used for the memory pressure gauges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub windows: usize,
    pub dirty_windows: usize,
    pub paused_windows: usize,
    pub buffered_events: u64,
    pub tracked_users: u64,
}

pub struct AccumulatorTable {
    windows: DashMap<WindowKey, WindowAccumulator>,
    anomaly_score_threshold: f64,
    /// Windows starting at or before this instant (epoch millis) are closed
    closed_horizon_ms: AtomicI64,
}

impl AccumulatorTable {
    pub fn new(anomaly_score_threshold: f64) -> Self {
        Self {
            windows: DashMap::new(),
            anomaly_score_threshold,
            closed_horizon_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Apply one event to its window, creating the accumulator on first use.
    ///
    /// The closed-horizon check happens while the key's shard is locked, so a
    /// window the flusher has already closed can never be reopened with a
    /// partial accumulator that would later overwrite the stored totals.
    pub fn update(
        &self,
        key: WindowKey,
        event: &TelemetryEvent,
        source: Option<SourceOffset>,
    ) -> Result<(), UpdateError> {
        let entry = self.windows.entry(key);
        if entry.key().window_start.timestamp_millis()
            <= self.closed_horizon_ms.load(Ordering::SeqCst)
        {
            return Err(UpdateError::WindowClosed(entry.key().clone()));
        }

        entry
            .or_insert_with(WindowAccumulator::new)
            .apply(event, self.anomaly_score_threshold, source);
        Ok(())
    }

    /// Stop accepting events for every window starting at or before `horizon`.
    /// The horizon only moves forward.
    pub fn close_through(&self, horizon: DateTime<Utc>) {
        self.closed_horizon_ms
            .fetch_max(horizon.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn is_closed(&self, key: &WindowKey) -> bool {
        key.window_start.timestamp_millis() <= self.closed_horizon_ms.load(Ordering::SeqCst)
    }

    /// Keys with changes since their last stored snapshot, excluding keys whose
    /// flush is paused after a fatal sink error. Sorted for deterministic writes.
    pub fn snapshot_due(&self) -> Vec<WindowKey> {
        let mut keys: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|entry| entry.value().is_dirty() && !entry.value().is_paused())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Copy the current state of `key` into a versioned snapshot. The stamp is
    /// strictly greater than any earlier snapshot of the same key.
    pub fn snapshot(
        &self,
        key: &WindowKey,
        clock: &VersionClock,
        now: DateTime<Utc>,
    ) -> Option<Snapshot> {
        let mut accumulator = self.windows.get_mut(key)?;
        let accumulator = accumulator.value_mut();
        let version = clock.stamp(now, accumulator.last_version);
        accumulator.last_version = Some(version);

        Some(Snapshot {
            key: key.clone(),
            values: accumulator.values(),
            version,
            revision: accumulator.revision,
        })
    }

    /// Record that `snapshot` is durably stored.
    pub fn acknowledge(&self, snapshot: &Snapshot) {
        if let Some(mut accumulator) = self.windows.get_mut(&snapshot.key) {
            let accumulator = accumulator.value_mut();
            accumulator.flushed_revision = accumulator.flushed_revision.max(snapshot.revision);
        }
    }

    /// Stop flushing `key` until an operator resumes it. The key keeps accumulating
    /// and keeps holding its offsets.
    pub fn pause(&self, key: &WindowKey) {
        if let Some(mut accumulator) = self.windows.get_mut(key) {
            accumulator.value_mut().flush_paused = true;
        }
    }

    /// Resume every paused key, returns how many were resumed.
    pub fn resume_paused(&self) -> usize {
        let mut resumed = 0;
        for mut entry in self.windows.iter_mut() {
            if entry.value().flush_paused {
                entry.value_mut().flush_paused = false;
                resumed += 1;
            }
        }
        resumed
    }

    /// Drop closed windows whose final state is stored. Dirty or paused windows
    /// stay until a later flush succeeds. Returns the number evicted.
    pub fn evict_closed(&self) -> usize {
        let horizon = self.closed_horizon_ms.load(Ordering::SeqCst);
        let mut evicted = 0;
        self.windows.retain(|key, accumulator| {
            let evict = key.window_start.timestamp_millis() <= horizon
                && !accumulator.is_dirty()
                && !accumulator.is_paused();
            if evict {
                evicted += 1;
            }
            !evict
        });
        evicted
    }

    /// Lowest offset per partition held by any resident window.
    pub fn low_watermarks(&self) -> HashMap<i32, i64> {
        let mut watermarks = HashMap::new();
        for entry in self.windows.iter() {
            for (partition, offset) in entry.value().held_offsets() {
                keep_lowest(&mut watermarks, partition, offset);
            }
        }
        watermarks
    }

    pub fn values(&self, key: &WindowKey) -> Option<AggregateValues> {
        self.windows.get(key).map(|accumulator| accumulator.values())
    }

    pub fn contains(&self, key: &WindowKey) -> bool {
        self.windows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn stats(&self) -> TableStats {
        let mut stats = TableStats::default();
        for entry in self.windows.iter() {
            let accumulator = entry.value();
            stats.windows += 1;
            stats.buffered_events += accumulator.total_events;
            stats.tracked_users += accumulator.unique_users.len() as u64;
            if accumulator.is_dirty() {
                stats.dirty_windows += 1;
            }
            if accumulator.is_paused() {
                stats.paused_windows += 1;
            }
        }
        stats
    }
}
