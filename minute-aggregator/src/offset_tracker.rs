//! Offset Tracker - Tracks consumption progress per partition
//!
//! A message counts as consumed once its event has been applied to an
//! accumulator or routed to the dead-letter queue. Being consumed is not enough
//! to commit it: its contribution sits in an accumulator until the window is
//! closed, stored and evicted. The committable offset of a partition is
//! therefore the lower of the next offset to consume and the lowest offset still
//! held by any resident window.
//!
//! After a restart the consumer resumes at the committed offset. Every window
//! that was resident at the crash is rebuilt from its first event, so its next
//! snapshot supersedes the stored row with complete totals. Events of windows
//! that were already evicted are replayed too and dead-lettered as expired.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::debug;

use crate::accumulator::AccumulatorTable;

#[derive(Default)]
pub struct OffsetTracker {
    /// Next offset to consume per partition (highest consumed + 1)
    consumed: DashMap<i32, i64>,
    /// Last offset committed per partition
    committed: DashMap<i32, i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the message at `offset` has been fully handed off.
    /// Progress only moves forward.
    pub fn mark_consumed(&self, partition: i32, offset: i64) {
        let next_offset = offset + 1;
        self.consumed
            .entry(partition)
            .and_modify(|current| {
                if next_offset > *current {
                    *current = next_offset;
                }
            })
            .or_insert_with(|| {
                debug!(
                    partition = partition,
                    offset = next_offset,
                    "Initializing partition progress"
                );
                next_offset
            });
    }

    /// Offsets that are safe to commit and have advanced since the last commit.
    pub fn committable_offsets(&self, table: &AccumulatorTable) -> HashMap<i32, i64> {
        // Read consumption progress before the watermarks: an event counted as
        // consumed here has already been applied, so its offset is visible below
        let consumed: Vec<(i32, i64)> = self
            .consumed
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        let watermarks = table.low_watermarks();

        consumed
            .into_iter()
            .filter_map(|(partition, next_offset)| {
                let safe = watermarks
                    .get(&partition)
                    .map_or(next_offset, |held| next_offset.min(*held));
                let advanced = match self.committed.get(&partition) {
                    Some(committed) => safe > *committed,
                    None => true,
                };
                advanced.then_some((partition, safe))
            })
            .collect()
    }

    /// Record a successful commit.
    pub fn mark_committed(&self, offsets: &HashMap<i32, i64>) {
        for (partition, offset) in offsets {
            self.committed
                .entry(*partition)
                .and_modify(|current| *current = (*current).max(*offset))
                .or_insert(*offset);
        }
    }

    pub fn consumed_offset(&self, partition: i32) -> Option<i64> {
        self.consumed.get(&partition).map(|r| *r.value())
    }

    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.committed.get(&partition).map(|r| *r.value())
    }

    pub fn partition_count(&self) -> usize {
        self.consumed.len()
    }
}
