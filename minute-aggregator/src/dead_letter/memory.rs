use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink};

/// Keeps dead-letter records in memory, in arrival order.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
    held: AtomicBool,
    released: Notify,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }

    /// Make appends wait until [`MemoryDeadLetterSink::release`], to simulate a slow destination.
    pub async fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub async fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        while self.held.load(Ordering::SeqCst) {
            self.released.notified().await;
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
