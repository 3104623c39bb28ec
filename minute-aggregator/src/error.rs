use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failures while assembling the service. Runtime failures of individual
/// messages or writes are handled where they occur and never surface here.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to connect to storage")]
    StorageUnavailable(#[source] anyhow::Error),
}
