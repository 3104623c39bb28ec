use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "iot-minute-aggregation-v1")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "iot.telemetry.raw.v1")]
    pub kafka_consumer_topic: String,

    // We default to "earliest" so a fresh group replays whatever the topic still retains
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "lz4")]
    pub kafka_compression_codec: String,

    // Dead-letter destination
    #[envconfig(default = "iot.telemetry.dlq.v1")]
    pub dead_letter_topic: String,

    #[envconfig(default = "10000")]
    pub dead_letter_queue_capacity: usize,

    // Windowing
    #[envconfig(default = "60")]
    pub window_size_secs: u64,

    #[envconfig(default = "5")]
    pub flush_interval_secs: u64,

    #[envconfig(default = "15")]
    pub grace_period_secs: u64,

    #[envconfig(default = "30")]
    pub max_future_skew_secs: u64,

    #[envconfig(default = "0.7")]
    pub anomaly_score_threshold: f64,

    #[envconfig(default = "false")]
    pub aggregate_by_device: bool,

    // Consumption
    #[envconfig(default = "4")]
    pub worker_count: usize,

    #[envconfig(default = "1000")]
    pub worker_queue_depth: usize,

    #[envconfig(default = "5")]
    pub commit_interval_secs: u64,

    // Sink writes
    #[envconfig(default = "3")]
    pub sink_max_attempts: u32,

    #[envconfig(default = "200")]
    pub sink_retry_initial_ms: u64,

    #[envconfig(default = "2000")]
    pub sink_retry_max_ms: u64,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    // ClickHouse
    #[envconfig(default = "http://localhost:8123")]
    pub clickhouse_url: String,

    #[envconfig(default = "stream_analytics")]
    pub clickhouse_database: String,

    #[envconfig(default = "default")]
    pub clickhouse_user: String,

    #[envconfig(default = "")]
    pub clickhouse_password: String,

    #[envconfig(default = "iot_minute_agg")]
    pub agg_table: String,

    #[envconfig(default = "iot_device_minute_agg")]
    pub device_agg_table: String,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "false")]
    pub log_json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
    #[error("anomaly_score_threshold must be within [0, 1], got {0}")]
    ThresholdOutOfRange(f64),
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_secs == 0 {
            return Err(ConfigError::MustBePositive("window_size_secs"));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::MustBePositive("flush_interval_secs"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::MustBePositive("worker_count"));
        }
        if self.worker_queue_depth == 0 {
            return Err(ConfigError::MustBePositive("worker_queue_depth"));
        }
        if self.dead_letter_queue_capacity == 0 {
            return Err(ConfigError::MustBePositive("dead_letter_queue_capacity"));
        }
        if self.sink_max_attempts == 0 {
            return Err(ConfigError::MustBePositive("sink_max_attempts"));
        }
        if self.commit_interval_secs == 0 {
            return Err(ConfigError::MustBePositive("commit_interval_secs"));
        }
        if !(0.0..=1.0).contains(&self.anomaly_score_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(
                self.anomaly_score_threshold,
            ));
        }
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn max_future_skew(&self) -> Duration {
        Duration::from_secs(self.max_future_skew_secs)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Client config for the source consumer. Auto commit and auto offset store are
    /// both disabled: progress is committed explicitly, and only behind flushed data.
    pub fn consumer_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("group.id", &self.kafka_consumer_group)
            .set("statistics.interval.ms", "10000")
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.kafka_consumer_offset_reset)
            .set("session.timeout.ms", "10000")
            .set("max.poll.interval.ms", "300000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }

    /// Client config for the dead-letter producer.
    pub fn producer_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", self.kafka_compression_codec.to_owned());

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}
