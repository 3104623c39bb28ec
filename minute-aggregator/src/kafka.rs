//! Source consumption
//!
//! A single receive loop reads from the telemetry topic and hands each message
//! to a worker chosen by partition, so messages of one partition are always
//! processed in log order by the same worker. Workers apply messages through the
//! [`Pipeline`] and record progress in the [`OffsetTracker`]; the receive loop
//! commits whatever the tracker deems safe on a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::accumulator::{AccumulatorTable, SourceOffset};
use crate::config::Config;
use crate::health::HealthHandle;
use crate::metrics_consts::{
    COMMITTED_OFFSET, CONSUMER_ERRORS, MESSAGES_RECEIVED, OFFSETS_COMMITTED,
};
use crate::offset_tracker::OffsetTracker;
use crate::pipeline::{Pipeline, RawMessage};

pub struct AggregatorContext;

impl ClientContext for AggregatorContext {}

impl ConsumerContext for AggregatorContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(
                "Successfully committed offsets for {} partitions",
                offsets.count()
            ),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

pub struct TelemetryConsumer {
    consumer: StreamConsumer<AggregatorContext>,
    topic: String,
    pipeline: Arc<Pipeline>,
    tracker: Arc<OffsetTracker>,
    table: Arc<AccumulatorTable>,
    worker_count: usize,
    worker_queue_depth: usize,
    commit_interval: Duration,
}

impl TelemetryConsumer {
    pub fn from_config(
        config: &Config,
        pipeline: Arc<Pipeline>,
        tracker: Arc<OffsetTracker>,
        table: Arc<AccumulatorTable>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer<AggregatorContext> = config
            .consumer_client_config()
            .create_with_context(AggregatorContext)?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

        info!(
            topic = %config.kafka_consumer_topic,
            group = %config.kafka_consumer_group,
            workers = config.worker_count,
            "subscribed to telemetry topic"
        );

        Ok(Self {
            consumer,
            topic: config.kafka_consumer_topic.clone(),
            pipeline,
            tracker,
            table,
            worker_count: config.worker_count.max(1),
            worker_queue_depth: config.worker_queue_depth.max(1),
            commit_interval: config.commit_interval(),
        })
    }

    /// Consume until `shutdown` fires, then drain the workers. Everything
    /// received before shutdown has been applied when this returns.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>, liveness: HealthHandle) {
        let (senders, workers) = self.spawn_workers();
        let mut commit_interval = tokio::time::interval(self.commit_interval);
        liveness.report_healthy();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping consumption");
                    break;
                }

                msg_result = timeout(Duration::from_secs(1), self.consumer.recv()) => {
                    // Detach right away, borrowed messages must not be held across awaits
                    let msg_result = msg_result.map(|received| received.map(|msg| msg.detach()));
                    match msg_result {
                        Ok(Ok(msg)) => {
                            metrics::counter!(MESSAGES_RECEIVED).increment(1);
                            let index = worker_index(msg.partition(), senders.len());
                            if senders[index].send(msg).await.is_err() {
                                error!(worker = index, "consumption worker has stopped");
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            error!("Error receiving message: {}", e);
                            metrics::counter!(CONSUMER_ERRORS, "kind" => "recv").increment(1);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        Err(_) => {
                            debug!("Consumer poll timeout");
                            liveness.report_healthy();
                        }
                    }
                }

                _ = commit_interval.tick() => {
                    self.commit(CommitMode::Async);
                    liveness.report_healthy();
                }
            }
        }

        // Closing the queues lets the workers finish what they already hold
        drop(senders);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("consumption worker failed: {}", e);
            }
        }
        info!("consumption stopped, all received messages applied");
    }

    /// Commit every offset that is safe and has advanced since the last commit.
    pub fn commit(&self, mode: CommitMode) {
        let offsets = self.tracker.committable_offsets(&self.table);
        if offsets.is_empty() {
            debug!("No safe offsets to commit");
            return;
        }

        let topic_partition_list = match self.partition_list(&offsets) {
            Ok(list) => list,
            Err(e) => {
                error!("Failed to build commit list: {}", e);
                return;
            }
        };

        match self.consumer.commit(&topic_partition_list, mode) {
            Ok(_) => {
                self.tracker.mark_committed(&offsets);
                metrics::counter!(OFFSETS_COMMITTED, "outcome" => "success").increment(1);
                for (partition, offset) in &offsets {
                    metrics::gauge!(COMMITTED_OFFSET, "partition" => partition.to_string())
                        .set(*offset as f64);
                }
            }
            Err(e) => {
                error!("Failed to commit safe offsets: {}", e);
                metrics::counter!(OFFSETS_COMMITTED, "outcome" => "failure").increment(1);
            }
        }
    }

    fn partition_list(&self, offsets: &HashMap<i32, i64>) -> KafkaResult<TopicPartitionList> {
        let mut topic_partition_list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            topic_partition_list.add_partition_offset(
                &self.topic,
                *partition,
                Offset::Offset(*offset),
            )?;
        }
        Ok(topic_partition_list)
    }

    fn spawn_workers(&self) -> (Vec<mpsc::Sender<OwnedMessage>>, Vec<JoinHandle<()>>) {
        (0..self.worker_count)
            .map(|id| {
                let (tx, rx) = mpsc::channel(self.worker_queue_depth);
                let handle = tokio::spawn(run_worker(
                    id,
                    rx,
                    self.pipeline.clone(),
                    self.tracker.clone(),
                ));
                (tx, handle)
            })
            .unzip()
    }
}

fn worker_index(partition: i32, worker_count: usize) -> usize {
    let workers = i64::try_from(worker_count).unwrap_or(i64::MAX).max(1);
    // rem_euclid of a positive divisor is non-negative and below worker_count
    usize::try_from(i64::from(partition).rem_euclid(workers)).unwrap_or(0)
}

async fn run_worker(
    id: usize,
    mut messages: mpsc::Receiver<OwnedMessage>,
    pipeline: Arc<Pipeline>,
    tracker: Arc<OffsetTracker>,
) {
    debug!(worker = id, "consumption worker started");
    while let Some(message) = messages.recv().await {
        let source = SourceOffset::new(message.partition(), message.offset());
        let raw = RawMessage {
            payload: message.payload(),
            key: message.key(),
            source: Some(source),
        };
        pipeline.process(raw, Utc::now());
        tracker.mark_consumed(source.partition, source.offset);
    }
    debug!(worker = id, "consumption worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_index_is_stable_per_partition() {
        assert_eq!(worker_index(0, 4), 0);
        assert_eq!(worker_index(5, 4), 1);
        assert_eq!(worker_index(5, 4), worker_index(9, 4));
        assert_eq!(worker_index(3, 1), 0);
    }

    #[test]
    fn test_worker_index_in_range() {
        for partition in -8..64 {
            assert!(worker_index(partition, 3) < 3);
        }
    }
}
