use std::fmt;

use chrono::{DateTime, Utc};

/// Device status as reported by the producer. Known values are `ok`, `warn`,
/// `error` and `anomaly`; anything else is carried through as free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Warn,
    Error,
    Anomaly,
    /// The producer sent no status at all.
    Unknown,
    Other(String),
}

impl Status {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ok" => Status::Ok,
            "warn" | "warning" => Status::Warn,
            "error" => Status::Error,
            "anomaly" => Status::Anomaly,
            _ => Status::Other(raw.to_string()),
        }
    }

    pub fn is_anomalous(&self) -> bool {
        matches!(self, Status::Error | Status::Anomaly)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::Warn => write!(f, "warn"),
            Status::Error => write!(f, "error"),
            Status::Anomaly => write!(f, "anomaly"),
            Status::Unknown => write!(f, "unknown"),
            Status::Other(s) => write!(f, "{s}"),
        }
    }
}

/// One decoded telemetry record. Only the decoder constructs these, so every
/// instance has already passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    pub device_id: String,
    pub user_id: Option<String>,
    pub metric_value: f64,
    pub status: Status,
    pub anomaly_score: f64,
}

impl TelemetryEvent {
    /// The single anomaly predicate used by every aggregation path: an explicit
    /// anomalous status, or a score at or above the threshold.
    pub fn is_anomaly(&self, score_threshold: f64) -> bool {
        self.status.is_anomalous() || self.anomaly_score >= score_threshold
    }
}
