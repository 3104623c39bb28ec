//! Durable storage for snapshots.
//!
//! Storage is last-writer-wins per window key: a reader always sees the snapshot
//! with the highest version. Rewriting a snapshot, or receiving writes out of
//! emission order, therefore never changes what is read back.

use async_trait::async_trait;
use thiserror::Error;

use crate::snapshot::{Snapshot, Version};

pub mod clickhouse;
pub mod memory;

pub use self::clickhouse::ClickHouseSink;
pub use self::memory::MemorySink;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Storage is temporarily unavailable. Safe to retry the same write.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// The write violates the storage contract (schema, types). Retrying will not help.
    #[error("fatal sink error: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Transient(_) => "transient",
            SinkError::Fatal(_) => "fatal",
        }
    }
}

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Upsert every snapshot in `snapshots`. Either the whole batch is stored or
    /// an error is returned; callers treat a failed batch as not stored at all.
    async fn write(&self, snapshots: &[Snapshot]) -> Result<(), SinkError>;

    /// Highest version already stored, if any. Used to seed the version clock.
    async fn latest_version(&self) -> Result<Option<Version>, SinkError>;
}
