//! Dead-letter routing
//!
//! Rejected messages are handed to a bounded queue drained by a background task
//! that appends them to the dead-letter destination. Routing never blocks and
//! never fails the caller: when the queue is full or the destination rejects a
//! record, the record is dropped, logged and counted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::error::KafkaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::accumulator::SourceOffset;
use crate::decoder::{DecodeError, ReasonCode};
use crate::metrics_consts::{DEAD_LETTER_DROPPED, DEAD_LETTER_EVENTS, DEAD_LETTER_WRITTEN};

pub mod kafka;
pub mod memory;

pub use self::kafka::KafkaDeadLetterSink;
pub use self::memory::MemoryDeadLetterSink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The message value as received, lossily decoded as UTF-8
    pub raw_payload: String,
    pub reason_code: ReasonCode,
    pub detail: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_partition: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_offset: Option<i64>,
}

impl DeadLetterRecord {
    pub fn new(
        payload: Option<&[u8]>,
        error: &DecodeError,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            raw_payload: payload
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default(),
            reason_code: error.reason,
            detail: error.detail.clone(),
            received_at,
            message_key: None,
            source_partition: None,
            source_offset: None,
        }
    }

    pub fn with_key(mut self, key: Option<&[u8]>) -> Self {
        self.message_key = key.map(|k| String::from_utf8_lossy(k).into_owned());
        self
    }

    pub fn with_source(mut self, source: Option<SourceOffset>) -> Self {
        if let Some(source) = source {
            self.source_partition = Some(source.partition);
            self.source_offset = Some(source.offset);
        }
        self
    }
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to serialize dead-letter record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce dead-letter record: {0}")]
    Produce(#[from] KafkaError),
    #[error("dead-letter produce was canceled")]
    Canceled,
}

/// Append-only destination for rejected messages.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError>;
}

#[derive(Clone)]
pub struct DeadLetterRouter {
    sender: mpsc::Sender<DeadLetterRecord>,
}

impl DeadLetterRouter {
    /// Start the background writer. The returned handle completes once every
    /// router clone is dropped and the queue is drained.
    pub fn spawn(sink: Arc<dyn DeadLetterSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<DeadLetterRecord>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                match sink.append(&record).await {
                    Ok(()) => metrics::counter!(DEAD_LETTER_WRITTEN).increment(1),
                    Err(e) => {
                        error!(
                            reason = %record.reason_code,
                            error = %e,
                            "failed to write dead-letter record, dropping it"
                        );
                        metrics::counter!(DEAD_LETTER_DROPPED, "cause" => "write_failed")
                            .increment(1);
                    }
                }
            }
        });

        (Self { sender }, handle)
    }

    /// Hand `record` to the background writer. Returns false if it was dropped
    /// because the queue is full or the writer has stopped.
    pub fn route(&self, record: DeadLetterRecord) -> bool {
        metrics::counter!(DEAD_LETTER_EVENTS, "reason" => record.reason_code.as_str())
            .increment(1);

        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                warn!(
                    reason = %record.reason_code,
                    "dead-letter queue is full, dropping record"
                );
                metrics::counter!(DEAD_LETTER_DROPPED, "cause" => "queue_full").increment(1);
                false
            }
            Err(TrySendError::Closed(record)) => {
                warn!(
                    reason = %record.reason_code,
                    "dead-letter writer has stopped, dropping record"
                );
                metrics::counter!(DEAD_LETTER_DROPPED, "cause" => "closed").increment(1);
                false
            }
        }
    }
}
