use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink};

/// Produces dead-letter records as JSON to a Kafka topic, keyed like the
/// source message so they land next to the device's other rejects.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &Config) -> Result<Self, KafkaError> {
        let client_config = config.producer_client_config();
        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(Some(&config.dead_letter_topic), Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    topic = %config.dead_letter_topic,
                    "connected to Kafka brokers for dead letters, found {} topics",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        Ok(Self {
            producer,
            topic: config.dead_letter_topic.clone(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(record)?;

        let kafka_record = FutureRecord {
            topic: &self.topic,
            key: record.message_key.as_deref(),
            payload: Some(&payload),
            timestamp: None,
            partition: None,
            headers: None,
        };

        let delivery = self
            .producer
            .send_result(kafka_record)
            .map_err(|(e, _)| DeadLetterError::Produce(e))?;

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(DeadLetterError::Produce(e)),
            Err(_) => Err(DeadLetterError::Canceled),
        }
    }
}
