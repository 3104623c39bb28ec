use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::sink::{SinkError, SnapshotSink};
use crate::snapshot::{AggregateValues, Snapshot, Version};
use crate::window::WindowKey;

/// In-process last-writer-wins store. Keeps the highest-version snapshot per key,
/// so it reads back exactly what a merge-on-read table would after `FINAL`.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<BTreeMap<WindowKey, Snapshot>>,
    scheduled_failures: Mutex<VecDeque<SinkError>>,
    rejected_keys: Mutex<Vec<WindowKey>>,
    writes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write calls, one per scheduled error, in order.
    pub async fn fail_next(&self, errors: impl IntoIterator<Item = SinkError>) {
        self.scheduled_failures.lock().await.extend(errors);
    }

    /// Reject, as a contract violation, every batch that contains `key`.
    pub async fn reject_key(&self, key: WindowKey) {
        self.rejected_keys.lock().await.push(key);
    }

    pub async fn accept_all(&self) {
        self.rejected_keys.lock().await.clear();
        self.scheduled_failures.lock().await.clear();
    }

    pub async fn get(&self, key: &WindowKey) -> Option<Snapshot> {
        self.rows.lock().await.get(key).cloned()
    }

    pub async fn values(&self, key: &WindowKey) -> Option<AggregateValues> {
        self.rows.lock().await.get(key).map(|s| s.values)
    }

    pub async fn rows(&self) -> Vec<Snapshot> {
        self.rows.lock().await.values().cloned().collect()
    }

    /// Write calls that reached the store, successful or not.
    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn write(&self, snapshots: &[Snapshot]) -> Result<(), SinkError> {
        self.writes.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.scheduled_failures.lock().await.pop_front() {
            return Err(error);
        }

        {
            let rejected = self.rejected_keys.lock().await;
            if let Some(bad) = snapshots.iter().find(|s| rejected.contains(&s.key)) {
                return Err(SinkError::Fatal(format!(
                    "row for {} does not match the table",
                    bad.key
                )));
            }
        }

        let mut rows = self.rows.lock().await;
        for snapshot in snapshots {
            match rows.get(&snapshot.key) {
                Some(stored) if stored.version > snapshot.version => {}
                _ => {
                    rows.insert(snapshot.key.clone(), snapshot.clone());
                }
            }
        }
        Ok(())
    }

    async fn latest_version(&self) -> Result<Option<Version>, SinkError> {
        Ok(self.rows.lock().await.values().map(|s| s.version).max())
    }
}
