use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use minute_aggregator::accumulator::{AccumulatorTable, SourceOffset};
use minute_aggregator::dead_letter::{DeadLetterRecord, DeadLetterRouter, MemoryDeadLetterSink};
use minute_aggregator::decoder::{EventDecoder, ReasonCode};
use minute_aggregator::flusher::Flusher;
use minute_aggregator::offset_tracker::OffsetTracker;
use minute_aggregator::pipeline::{Outcome, Pipeline, RawMessage};
use minute_aggregator::retry::RetryPolicy;
use minute_aggregator::sink::{MemorySink, SinkError};
use minute_aggregator::snapshot::VersionClock;
use minute_aggregator::window::{TumblingWindowAssigner, WindowKey};

const PARTITION: i32 = 0;

fn at(m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, m, s).unwrap()
}

fn assigner() -> TumblingWindowAssigner {
    TumblingWindowAssigner::new(Duration::from_secs(60), Duration::from_secs(15))
}

fn event(id: &str, time: DateTime<Utc>, metric: f64, status: &str, user: &str) -> Vec<u8> {
    let payload: Value = json!({
        "event_id": id,
        "event_time": time.to_rfc3339(),
        "device_id": "sensor-1",
        "user_id": user,
        "metric_value": metric,
        "status": status,
        "anomaly_score": 0.1,
    });
    serde_json::to_vec(&payload).unwrap()
}

/// One aggregator process. Dropping it loses all in-memory state, like a crash.
struct Aggregator {
    pipeline: Pipeline,
    flusher: Flusher,
    table: Arc<AccumulatorTable>,
    tracker: OffsetTracker,
    dead_letters: Arc<MemoryDeadLetterSink>,
}

impl Aggregator {
    async fn start(sink: Arc<MemorySink>) -> Self {
        let table = Arc::new(AccumulatorTable::new(0.7));
        let dead_letters = Arc::new(MemoryDeadLetterSink::new());
        let (router, _task) = DeadLetterRouter::spawn(dead_letters.clone(), 64);
        let pipeline = Pipeline::new(
            EventDecoder::new(Duration::from_secs(30)),
            assigner(),
            table.clone(),
            router,
            false,
        );
        let flusher = Flusher::new(
            table.clone(),
            sink,
            Arc::new(VersionClock::new()),
            assigner(),
            RetryPolicy::new(2, Duration::from_millis(1), Some(Duration::from_millis(5)), 3),
        );
        flusher.seed_clock().await.unwrap();

        Self {
            pipeline,
            flusher,
            table,
            tracker: OffsetTracker::new(),
            dead_letters,
        }
    }

    fn consume(&self, payload: &[u8], offset: i64, now: DateTime<Utc>) -> Outcome {
        let message = RawMessage::new(payload).with_source(SourceOffset::new(PARTITION, offset));
        let outcome = self.pipeline.process(message, now);
        self.tracker.mark_consumed(PARTITION, offset);
        outcome
    }

    /// What a commit at this point would store for the partition.
    fn commit(&self) -> Option<i64> {
        let offsets = self.tracker.committable_offsets(&self.table);
        self.tracker.mark_committed(&offsets);
        self.tracker.committed_offset(PARTITION)
    }

    async fn dead_lettered(&self, expected: usize) -> Vec<DeadLetterRecord> {
        for _ in 0..100 {
            let records = self.dead_letters.records().await;
            if records.len() >= expected {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.dead_letters.records().await
    }
}

fn minute(m: u32) -> WindowKey {
    WindowKey::global(at(m, 0))
}

#[tokio::test]
async fn test_three_events_in_one_minute() {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::start(sink.clone()).await;

    aggregator.consume(&event("e1", at(0, 10), 10.0, "ok", "u1"), 0, at(0, 11));
    aggregator.consume(&event("e2", at(0, 40), 20.0, "ok", "u2"), 1, at(0, 41));
    aggregator.consume(&event("e3", at(0, 59), 30.0, "anomaly", "u1"), 2, at(0, 59));

    let report = aggregator.flusher.flush(at(1, 0)).await;
    assert_eq!(report.written, 1);

    let values = sink.values(&minute(0)).await.unwrap();
    assert_eq!(values.total_events, 3);
    assert_eq!(values.avg_metric, 20.0);
    assert_eq!(values.unique_users, 2);
    assert_eq!(values.anomaly_events, 1);
}

#[tokio::test]
async fn test_late_event_within_grace_supersedes_stored_row() {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::start(sink.clone()).await;

    aggregator.consume(&event("e1", at(0, 10), 10.0, "ok", "u1"), 0, at(0, 11));
    aggregator.consume(&event("e2", at(0, 40), 20.0, "ok", "u1"), 1, at(0, 41));
    aggregator.flusher.flush(at(1, 0)).await;
    let first = sink.get(&minute(0)).await.unwrap();
    assert_eq!(first.values.total_events, 2);

    // The minute ended at 00:01:00, grace keeps it open until 00:01:15
    let outcome = aggregator.consume(&event("e3", at(0, 50), 30.0, "anomaly", "u2"), 2, at(1, 2));
    assert_eq!(outcome, Outcome::Aggregated(minute(0)));
    aggregator.flusher.flush(at(1, 5)).await;

    let second = sink.get(&minute(0)).await.unwrap();
    assert!(second.version > first.version);
    assert_eq!(second.values.total_events, 3);
    assert_eq!(second.values.avg_metric, 20.0);
    assert_eq!(second.values.unique_users, 2);
    assert_eq!(second.values.anomaly_events, 1);

    // Past grace the window is evicted and later events are rejected
    let report = aggregator.flusher.flush(at(1, 16)).await;
    assert_eq!(report.evicted, 1);
    let outcome = aggregator.consume(&event("e4", at(0, 55), 1.0, "ok", "u3"), 3, at(1, 20));
    assert_eq!(outcome, Outcome::DeadLettered(ReasonCode::WindowExpired));
    assert_eq!(sink.values(&minute(0)).await.unwrap().total_events, 3);
}

#[tokio::test]
async fn test_malformed_messages_do_not_disturb_aggregation() {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::start(sink.clone()).await;

    aggregator.consume(&event("e1", at(0, 10), 10.0, "ok", "u1"), 0, at(0, 11));
    let outcome = aggregator.consume(b"{\"event_id\": ", 1, at(0, 12));
    assert_eq!(outcome, Outcome::DeadLettered(ReasonCode::MalformedPayload));
    let outcome = aggregator.consume(
        &serde_json::to_vec(&json!({"event_id": "e2", "event_time": at(0, 13).to_rfc3339()}))
            .unwrap(),
        2,
        at(0, 13),
    );
    assert_eq!(outcome, Outcome::DeadLettered(ReasonCode::MissingField));
    aggregator.consume(&event("e3", at(0, 20), 30.0, "ok", "u2"), 3, at(0, 21));

    aggregator.flusher.flush(at(0, 30)).await;
    let values = sink.values(&minute(0)).await.unwrap();
    assert_eq!(values.total_events, 2);
    assert_eq!(values.avg_metric, 20.0);

    let records = aggregator.dead_lettered(2).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].reason_code, ReasonCode::MalformedPayload);
    assert_eq!(records[0].source_offset, Some(1));
    assert_eq!(records[1].reason_code, ReasonCode::MissingField);

    // Rejected messages do not hold back the commit, only the open window does
    assert_eq!(aggregator.commit(), Some(0));
}

#[tokio::test]
async fn test_future_event_is_dead_lettered() {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::start(sink.clone()).await;

    let outcome = aggregator.consume(&event("e1", at(5, 0), 10.0, "ok", "u1"), 0, at(0, 10));

    assert_eq!(outcome, Outcome::DeadLettered(ReasonCode::FutureSkew));
    assert!(aggregator.table.is_empty());
    let records = aggregator.dead_lettered(1).await;
    assert_eq!(records[0].reason_code, ReasonCode::FutureSkew);
}

#[tokio::test]
async fn test_transient_outage_loses_nothing() {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::start(sink.clone()).await;
    sink.fail_next((0..3).map(|_| SinkError::Transient("connection refused".to_string())))
        .await;

    aggregator.consume(&event("e1", at(0, 10), 10.0, "ok", "u1"), 0, at(0, 11));
    let report = aggregator.flusher.flush(at(0, 15)).await;
    assert_eq!(report.deferred, 1);
    assert!(sink.rows().await.is_empty());

    // Events keep arriving during the outage
    aggregator.consume(&event("e2", at(0, 20), 20.0, "ok", "u2"), 1, at(0, 21));
    let report = aggregator.flusher.flush(at(0, 25)).await;
    assert_eq!(report.written, 1);

    let values = sink.values(&minute(0)).await.unwrap();
    assert_eq!(values.total_events, 2);
    assert_eq!(values.unique_users, 2);
}

#[tokio::test]
async fn test_restart_rebuilds_open_windows_from_committed_offset() {
    let sink = Arc::new(MemorySink::new());
    let messages = [
        (0, event("a1", at(0, 10), 10.0, "ok", "u1")),
        (1, event("a2", at(0, 20), 20.0, "ok", "u2")),
        (2, event("a3", at(0, 30), 30.0, "error", "u3")),
        (3, event("b1", at(1, 20), 1.0, "ok", "u1")),
        (4, event("b2", at(1, 22), 2.0, "ok", "u1")),
        (5, event("b3", at(1, 28), 3.0, "ok", "u2")),
    ];

    let committed = {
        let aggregator = Aggregator::start(sink.clone()).await;
        for (offset, payload) in &messages[..3] {
            aggregator.consume(payload, *offset, at(0, 40));
        }
        // Minute 0 closes at 00:01:15, is written once more and evicted
        aggregator.flusher.flush(at(1, 20)).await;
        assert!(!aggregator.table.contains(&minute(0)));

        for (offset, payload) in &messages[3..5] {
            aggregator.consume(payload, *offset, at(1, 23));
        }
        aggregator.flusher.flush(at(1, 25)).await;
        assert_eq!(sink.values(&minute(1)).await.unwrap().total_events, 2);

        // Applied but never flushed before the crash
        aggregator.consume(&messages[5].1, messages[5].0, at(1, 30));

        // Minute 1 is stored but still open, so the commit stays at its first event
        aggregator.commit()
    };
    assert_eq!(committed, Some(3));
    let stored_before = sink.get(&minute(1)).await.unwrap();

    let restarted = Aggregator::start(sink.clone()).await;
    for (offset, payload) in messages.iter().filter(|(o, _)| *o >= 3) {
        restarted.consume(payload, *offset, at(1, 40));
    }
    restarted.flusher.flush(at(1, 45)).await;

    let rebuilt = sink.get(&minute(1)).await.unwrap();
    assert!(rebuilt.version > stored_before.version);
    assert_eq!(rebuilt.values.total_events, 3);
    assert_eq!(rebuilt.values.unique_users, 2);
    assert_eq!(sink.values(&minute(0)).await.unwrap().total_events, 3);
}

#[tokio::test]
async fn test_replaying_already_stored_windows_never_undercounts() {
    let sink = Arc::new(MemorySink::new());
    let messages = [
        (0, event("a1", at(0, 10), 10.0, "ok", "u1")),
        (1, event("a2", at(0, 50), 20.0, "ok", "u2")),
        (2, event("b1", at(1, 5), 1.0, "ok", "u1")),
    ];

    {
        let aggregator = Aggregator::start(sink.clone()).await;
        for (offset, payload) in &messages {
            aggregator.consume(payload, *offset, at(1, 6));
        }
        aggregator.flusher.flush(at(1, 10)).await;
    }

    // The commit was lost, so everything is replayed. Minute 0 is past grace by
    // now and keeps its stored totals, minute 1 is rebuilt in full.
    let restarted = Aggregator::start(sink.clone()).await;
    let outcomes: Vec<Outcome> = messages
        .iter()
        .map(|(offset, payload)| restarted.consume(payload, *offset, at(1, 20)))
        .collect();
    restarted.flusher.flush(at(1, 25)).await;

    assert_eq!(
        outcomes,
        vec![
            Outcome::DeadLettered(ReasonCode::WindowExpired),
            Outcome::DeadLettered(ReasonCode::WindowExpired),
            Outcome::Aggregated(minute(1)),
        ]
    );
    assert_eq!(sink.values(&minute(0)).await.unwrap().total_events, 2);
    assert_eq!(sink.values(&minute(1)).await.unwrap().total_events, 1);
}

#[tokio::test]
async fn test_final_flush_stores_everything_applied() {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::start(sink.clone()).await;

    aggregator.consume(&event("e1", at(0, 10), 10.0, "ok", "u1"), 0, at(0, 11));
    aggregator.consume(&event("e2", at(1, 10), 10.0, "ok", "u1"), 1, at(1, 11));

    let lost = aggregator.flusher.final_flush(at(1, 12)).await;

    assert_eq!(lost, 0);
    assert_eq!(sink.rows().await.len(), 2);
}
