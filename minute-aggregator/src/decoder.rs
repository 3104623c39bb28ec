use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{Status, TelemetryEvent};

/// Why a message was rejected. Serialized in snake_case into dead-letter records
/// and used as the `reason` label on the dead-letter counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    MissingField,
    TypeMismatch,
    OutOfRange,
    MalformedPayload,
    FutureSkew,
    WindowExpired,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::MissingField => "missing_field",
            ReasonCode::TypeMismatch => "type_mismatch",
            ReasonCode::OutOfRange => "out_of_range",
            ReasonCode::MalformedPayload => "malformed_payload",
            ReasonCode::FutureSkew => "future_skew",
            ReasonCode::WindowExpired => "window_expired",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct DecodeError {
    pub reason: ReasonCode,
    pub detail: String,
}

impl DecodeError {
    pub fn new(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    fn missing(field: &str) -> Self {
        Self::new(ReasonCode::MissingField, format!("missing field `{field}`"))
    }

    fn mismatch(field: &str, expected: &str) -> Self {
        Self::new(
            ReasonCode::TypeMismatch,
            format!("field `{field}` must be {expected}"),
        )
    }
}

/// Turns raw payloads into validated [`TelemetryEvent`]s. Pure: the caller supplies
/// the processing time and decides what to do with failures.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    max_future_skew: chrono::Duration,
}

impl EventDecoder {
    pub fn new(max_future_skew: Duration) -> Self {
        Self {
            max_future_skew: chrono::Duration::from_std(max_future_skew)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn decode(
        &self,
        payload: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent, DecodeError> {
        let Some(payload) = payload.filter(|p| !p.is_empty()) else {
            return Err(DecodeError::new(
                ReasonCode::MalformedPayload,
                "empty payload",
            ));
        };

        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::new(ReasonCode::MalformedPayload, e.to_string()))?;

        let Value::Object(fields) = value else {
            return Err(DecodeError::new(
                ReasonCode::MalformedPayload,
                "payload is not a JSON object",
            ));
        };

        let event_id = required_str(&fields, "event_id")?.to_string();

        let raw_time = required_str(&fields, "event_time")?;
        let event_time = DateTime::parse_from_rfc3339(raw_time)
            .map_err(|e| {
                DecodeError::new(
                    ReasonCode::TypeMismatch,
                    format!("field `event_time` is not an RFC 3339 instant: {e}"),
                )
            })?
            .with_timezone(&Utc);

        let skew_limit = now.checked_add_signed(self.max_future_skew);
        if skew_limit.is_some_and(|limit| event_time > limit) {
            return Err(DecodeError::new(
                ReasonCode::FutureSkew,
                format!("event_time {event_time} is ahead of processing time {now}"),
            ));
        }

        let device_id = required_str(&fields, "device_id")?;
        if device_id.trim().is_empty() {
            return Err(DecodeError::new(
                ReasonCode::MissingField,
                "field `device_id` is empty",
            ));
        }

        let user_id = optional_str(&fields, "user_id")?
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        // Producers send the reading as `metric_value`, older ones only as `temperature`
        let metric_value = match optional_number(&fields, "metric_value")? {
            Some(v) => v,
            None => optional_number(&fields, "temperature")?
                .ok_or_else(|| DecodeError::missing("metric_value"))?,
        };
        if !metric_value.is_finite() {
            return Err(DecodeError::new(
                ReasonCode::OutOfRange,
                "field `metric_value` is not finite",
            ));
        }

        let status = optional_str(&fields, "status")?
            .map(Status::parse)
            .unwrap_or(Status::Unknown);

        let anomaly_score = optional_number(&fields, "anomaly_score")?.unwrap_or(0.0);
        if !anomaly_score.is_finite() || !(0.0..=1.0).contains(&anomaly_score) {
            return Err(DecodeError::new(
                ReasonCode::OutOfRange,
                format!("field `anomaly_score` must be within [0, 1], got {anomaly_score}"),
            ));
        }

        Ok(TelemetryEvent {
            event_id,
            event_time,
            device_id: device_id.to_string(),
            user_id,
            metric_value,
            status,
            anomaly_score,
        })
    }
}

fn required_str<'a>(fields: &'a Map<String, Value>, name: &str) -> Result<&'a str, DecodeError> {
    optional_str(fields, name)?.ok_or_else(|| DecodeError::missing(name))
}

fn optional_str<'a>(
    fields: &'a Map<String, Value>,
    name: &str,
) -> Result<Option<&'a str>, DecodeError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(DecodeError::mismatch(name, "a string")),
    }
}

fn optional_number(fields: &Map<String, Value>, name: &str) -> Result<Option<f64>, DecodeError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| {
            DecodeError::new(
                ReasonCode::OutOfRange,
                format!("field `{name}` is not representable"),
            )
        }),
        Some(_) => Err(DecodeError::mismatch(name, "a number")),
    }
}
