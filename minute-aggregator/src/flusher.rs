//! Flush Scheduler
//!
//! Runs on a fixed interval, independent of consumption. Every tick it:
//!
//! 1. closes the windows whose grace period has ended,
//! 2. snapshots every window changed since its last stored snapshot,
//! 3. writes the snapshots in batches, retrying transient failures with backoff,
//! 4. acknowledges what was stored and evicts closed windows that are clean.
//!
//! A snapshot that could not be stored leaves its window dirty, so the next tick
//! writes a newer snapshot that includes everything accumulated meanwhile. A
//! batch rejected as a contract violation is split up to find the offending keys,
//! which are paused until an operator resumes them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::accumulator::{AccumulatorTable, TableStats};
use crate::health::HealthHandle;
use crate::metrics_consts::{
    ACTIVE_WINDOWS, BUFFERED_EVENTS, DIRTY_WINDOWS, FLUSH_DURATION, FLUSH_TICKS, KEYS_PAUSED,
    SINK_WRITE_ATTEMPTS, SNAPSHOTS_DEFERRED, SNAPSHOTS_WRITTEN, STATE_LOST_ON_SHUTDOWN,
    TRACKED_USERS, WINDOWS_EVICTED,
};
use crate::retry::RetryPolicy;
use crate::sink::{SinkError, SnapshotSink};
use crate::snapshot::{Snapshot, VersionClock};
use crate::window::TumblingWindowAssigner;

const MAX_BATCH_ROWS: usize = 1000;

/// Outcome of one flush pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Snapshots durably stored
    pub written: usize,
    /// Snapshots that failed transiently and stay dirty for the next tick
    pub deferred: usize,
    /// Keys paused after a contract violation
    pub paused: usize,
    pub evicted: usize,
}

pub struct Flusher {
    table: Arc<AccumulatorTable>,
    sink: Arc<dyn SnapshotSink>,
    clock: Arc<VersionClock>,
    assigner: TumblingWindowAssigner,
    retry: RetryPolicy,
}

impl Flusher {
    pub fn new(
        table: Arc<AccumulatorTable>,
        sink: Arc<dyn SnapshotSink>,
        clock: Arc<VersionClock>,
        assigner: TumblingWindowAssigner,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            table,
            sink,
            clock,
            assigner,
            retry,
        }
    }

    /// Make sure no stamp is issued at or below what storage already holds, so
    /// a restarted process supersedes earlier rows even if its clock lags.
    pub async fn seed_clock(&self) -> Result<(), SinkError> {
        if let Some(latest) = self.sink.latest_version().await? {
            info!(latest_version = %latest, "seeding version clock from storage");
            self.clock.seed(latest);
        }
        Ok(())
    }

    pub async fn flush(&self, now: DateTime<Utc>) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport::default();

        self.table.close_through(self.assigner.closed_horizon(now));

        let snapshots: Vec<Snapshot> = self
            .table
            .snapshot_due()
            .iter()
            .filter_map(|key| self.table.snapshot(key, &self.clock, now))
            .collect();

        for batch in snapshots.chunks(MAX_BATCH_ROWS) {
            match self.write_with_retry(batch).await {
                Ok(()) => {
                    self.acknowledge(batch);
                    report.written += batch.len();
                }
                Err(SinkError::Transient(e)) => {
                    warn!(
                        rows = batch.len(),
                        error = %e,
                        "snapshot batch not stored, keeping windows for the next flush"
                    );
                    report.deferred += batch.len();
                }
                Err(SinkError::Fatal(e)) if batch.len() == 1 => {
                    self.pause(&batch[0], &e);
                    report.paused += 1;
                }
                Err(SinkError::Fatal(e)) => {
                    warn!(
                        rows = batch.len(),
                        error = %e,
                        "snapshot batch rejected, writing rows one by one"
                    );
                    self.isolate(batch, &mut report).await;
                }
            }
        }

        report.evicted = self.table.evict_closed();

        let stats = self.table.stats();
        record_stats(&stats);
        metrics::counter!(FLUSH_TICKS).increment(1);
        metrics::counter!(SNAPSHOTS_WRITTEN).increment(report.written as u64);
        metrics::counter!(SNAPSHOTS_DEFERRED).increment(report.deferred as u64);
        metrics::counter!(WINDOWS_EVICTED).increment(report.evicted as u64);
        metrics::histogram!(FLUSH_DURATION).record(started.elapsed().as_millis() as f64);

        info!(
            windows = stats.windows,
            buffered_events = stats.buffered_events,
            written = report.written,
            deferred = report.deferred,
            evicted = report.evicted,
            "flush"
        );
        report
    }

    /// Flush once more before exit. Returns the number of windows whose latest
    /// state could not be stored.
    pub async fn final_flush(&self, now: DateTime<Utc>) -> usize {
        let report = self.flush(now).await;
        let lost = self.table.stats().dirty_windows;
        if lost > 0 {
            error!(
                windows = lost,
                deferred = report.deferred,
                "shutting down with windows that were not stored"
            );
        }
        lost
    }

    /// [`Flusher::final_flush`] bounded by `limit`. A flush still stuck on the
    /// sink when the limit passes is abandoned and every dirty window counts as
    /// lost.
    pub async fn final_flush_within(&self, now: DateTime<Utc>, limit: Duration) -> usize {
        let lost = match tokio::time::timeout(limit, self.final_flush(now)).await {
            Ok(lost) => lost,
            Err(_) => {
                let lost = self.table.stats().dirty_windows;
                error!(
                    windows = lost,
                    "final flush did not complete within {:?}", limit
                );
                lost
            }
        };
        if lost > 0 {
            metrics::counter!(STATE_LOST_ON_SHUTDOWN).increment(lost as u64);
        }
        lost
    }

    pub fn resume_paused(&self) -> usize {
        let resumed = self.table.resume_paused();
        if resumed > 0 {
            info!(keys = resumed, "resumed flushing for paused keys");
        }
        metrics::gauge!(KEYS_PAUSED).set(self.table.stats().paused_windows as f64);
        resumed
    }

    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: oneshot::Receiver<()>,
        liveness: HealthHandle,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        liveness.report_healthy();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("flusher received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush(Utc::now()).await;
                    liveness.report_healthy();
                }
            }
        }
    }

    async fn write_with_retry(&self, batch: &[Snapshot]) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            match self.sink.write(batch).await {
                Ok(()) => {
                    metrics::counter!(SINK_WRITE_ATTEMPTS, "outcome" => "success").increment(1);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    metrics::counter!(SINK_WRITE_ATTEMPTS, "outcome" => e.kind()).increment(1);
                    if !e.is_retriable() || !self.retry.should_retry(attempt) {
                        return Err(e);
                    }
                    let jitter = Duration::from_millis(rand::random::<u64>() % 50);
                    let backoff = self.retry.time_until_next_retry(attempt - 1) + jitter;
                    warn!(
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "sink write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn isolate(&self, batch: &[Snapshot], report: &mut FlushReport) {
        for snapshot in batch {
            match self.write_with_retry(std::slice::from_ref(snapshot)).await {
                Ok(()) => {
                    self.table.acknowledge(snapshot);
                    report.written += 1;
                }
                Err(SinkError::Transient(_)) => report.deferred += 1,
                Err(SinkError::Fatal(e)) => {
                    self.pause(snapshot, &e);
                    report.paused += 1;
                }
            }
        }
    }

    fn acknowledge(&self, batch: &[Snapshot]) {
        for snapshot in batch {
            self.table.acknowledge(snapshot);
        }
    }

    fn pause(&self, snapshot: &Snapshot, reason: &str) {
        error!(
            window = %snapshot.key,
            error = reason,
            "storage rejected snapshot, pausing flush for this key until resumed"
        );
        self.table.pause(&snapshot.key);
    }
}

fn record_stats(stats: &TableStats) {
    metrics::gauge!(ACTIVE_WINDOWS).set(stats.windows as f64);
    metrics::gauge!(DIRTY_WINDOWS).set(stats.dirty_windows as f64);
    metrics::gauge!(KEYS_PAUSED).set(stats.paused_windows as f64);
    metrics::gauge!(BUFFERED_EVENTS).set(stats.buffered_events as f64);
    metrics::gauge!(TRACKED_USERS).set(stats.tracked_users as f64);
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::event::{Status, TelemetryEvent};
    use crate::sink::MemorySink;
    use crate::snapshot::Version;
    use crate::window::WindowKey;

    /// A sink whose writes never complete, like a hung connection.
    struct StalledSink;

    #[async_trait]
    impl SnapshotSink for StalledSink {
        async fn write(&self, _snapshots: &[Snapshot]) -> Result<(), SinkError> {
            futures::future::pending().await
        }

        async fn latest_version(&self) -> Result<Option<Version>, SinkError> {
            Ok(None)
        }
    }

    fn at(m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, m, s).unwrap()
    }

    fn event(m: u32, s: u32, metric: f64) -> TelemetryEvent {
        TelemetryEvent {
            event_id: format!("e-{m}-{s}"),
            event_time: at(m, s),
            device_id: "d1".to_string(),
            user_id: None,
            metric_value: metric,
            status: Status::Ok,
            anomaly_score: 0.0,
        }
    }

    fn setup() -> (Arc<AccumulatorTable>, Arc<MemorySink>, Flusher) {
        let table = Arc::new(AccumulatorTable::new(0.7));
        let sink = Arc::new(MemorySink::new());
        let flusher = Flusher::new(
            table.clone(),
            sink.clone(),
            Arc::new(VersionClock::new()),
            TumblingWindowAssigner::new(Duration::from_secs(60), Duration::from_secs(15)),
            RetryPolicy::new(2, Duration::from_millis(1), Some(Duration::from_millis(5)), 3),
        );
        (table, sink, flusher)
    }

    fn add(table: &AccumulatorTable, m: u32, s: u32, metric: f64) {
        table
            .update(WindowKey::global(at(m, 0)), &event(m, s, metric), None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_flush_writes_dirty_windows_once() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 10.0);
        add(&table, 0, 40, 20.0);

        let report = flusher.flush(at(0, 45)).await;
        assert_eq!(report.written, 1);

        // Nothing changed: nothing to write
        let report = flusher.flush(at(0, 50)).await;
        assert_eq!(report, FlushReport::default());
        assert_eq!(sink.write_calls(), 1);

        let values = sink.values(&WindowKey::global(at(0, 0))).await.unwrap();
        assert_eq!(values.total_events, 2);
        assert_eq!(values.avg_metric, 15.0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_within_tick() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 1.0);
        sink.fail_next([SinkError::Transient("connection reset".to_string())])
            .await;

        let report = flusher.flush(at(0, 20)).await;

        assert_eq!(report.written, 1);
        assert_eq!(sink.write_calls(), 2);
        assert!(table.snapshot_due().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_window_dirty() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 1.0);
        sink.fail_next((0..3).map(|_| SinkError::Transient("down".to_string())))
            .await;

        let report = flusher.flush(at(0, 20)).await;
        assert_eq!(report.deferred, 1);
        assert!(sink.rows().await.is_empty());

        // More events arrive, the next tick stores all of them
        add(&table, 0, 30, 1.0);
        let report = flusher.flush(at(0, 35)).await;
        assert_eq!(report.written, 1);
        let values = sink.values(&WindowKey::global(at(0, 0))).await.unwrap();
        assert_eq!(values.total_events, 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_pauses_only_offending_key() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 1.0);
        add(&table, 1, 10, 1.0);
        let bad = WindowKey::global(at(0, 0));
        sink.reject_key(bad.clone()).await;

        let report = flusher.flush(at(1, 20)).await;

        assert_eq!(report.written, 1);
        assert_eq!(report.paused, 1);
        assert!(sink.get(&bad).await.is_none());
        assert!(sink.get(&WindowKey::global(at(1, 0))).await.is_some());

        // Paused and closed, but kept in memory
        let report = flusher.flush(at(2, 0)).await;
        assert_eq!(report.written, 0);
        assert!(table.contains(&bad));

        sink.accept_all().await;
        assert_eq!(flusher.resume_paused(), 1);
        let report = flusher.flush(at(2, 5)).await;
        assert_eq!(report.written, 1);
        assert_eq!(report.evicted, 1);
        assert!(!table.contains(&bad));
    }

    #[tokio::test]
    async fn test_closed_windows_are_evicted_after_final_write() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 1.0);

        // Window [00:00, 00:01) closes at 00:01:15
        let report = flusher.flush(at(1, 14)).await;
        assert_eq!((report.written, report.evicted), (1, 0));

        let report = flusher.flush(at(1, 15)).await;
        assert_eq!((report.written, report.evicted), (0, 1));
        assert!(table.is_empty());
        assert_eq!(sink.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_final_flush_reports_lost_windows() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 1.0);
        sink.fail_next((0..3).map(|_| SinkError::Transient("down".to_string())))
            .await;

        assert_eq!(flusher.final_flush(at(0, 20)).await, 1);
        assert_eq!(flusher.final_flush(at(0, 25)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_gives_up_at_the_limit() {
        let (table, _, flusher) = setup();
        let flusher = Flusher {
            sink: Arc::new(StalledSink),
            ..flusher
        };
        add(&table, 0, 10, 1.0);
        add(&table, 1, 10, 1.0);

        let started = tokio::time::Instant::now();
        let lost = flusher
            .final_flush_within(at(1, 20), Duration::from_secs(5))
            .await;

        assert_eq!(lost, 2);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_final_flush_within_limit_stores_everything() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 1.0);

        let lost = flusher
            .final_flush_within(at(0, 20), Duration::from_secs(5))
            .await;

        assert_eq!(lost, 0);
        assert_eq!(sink.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_many_keys_flushed_together_share_the_wall_clock_stamp() {
        let (table, sink, flusher) = setup();
        for device in 0..5_000 {
            table
                .update(
                    WindowKey::for_device(at(0, 0), format!("d{device}")),
                    &event(0, 10, 1.0),
                    None,
                )
                .unwrap();
        }

        for now in [at(0, 30), at(0, 35)] {
            let report = flusher.flush(now).await;
            assert_eq!(report.written, 5_000);
            let rows = sink.rows().await;
            assert!(rows.iter().all(|row| row.version == Version::from_datetime(now)));
            for row in &rows {
                table
                    .update(row.key.clone(), &event(0, 20, 1.0), None)
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_seed_clock_from_storage() {
        let (table, sink, flusher) = setup();
        add(&table, 0, 10, 1.0);
        flusher.flush(at(5, 0)).await;
        let stored = sink.latest_version().await.unwrap().unwrap();

        // A restarted process with a lagging clock
        let (table2, _, restarted) = setup();
        let restarted = Flusher { sink: sink.clone(), ..restarted };
        restarted.seed_clock().await.unwrap();
        add(&table2, 0, 20, 1.0);
        restarted.flush(at(0, 30)).await;

        let row = sink.get(&WindowKey::global(at(0, 0))).await.unwrap();
        assert!(row.version > stored);
        assert_eq!(row.values.total_events, 1);
    }
}
