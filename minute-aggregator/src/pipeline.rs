use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::accumulator::{AccumulatorTable, SourceOffset, UpdateError};
use crate::config::Config;
use crate::dead_letter::{DeadLetterRecord, DeadLetterRouter};
use crate::decoder::{DecodeError, EventDecoder, ReasonCode};
use crate::metrics_consts::EVENTS_AGGREGATED;
use crate::window::{TumblingWindowAssigner, WindowKey};

/// One message as read from the source log.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMessage<'a> {
    pub payload: Option<&'a [u8]>,
    pub key: Option<&'a [u8]>,
    pub source: Option<SourceOffset>,
}

impl<'a> RawMessage<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: SourceOffset) -> Self {
        self.source = Some(source);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Aggregated(WindowKey),
    DeadLettered(ReasonCode),
}

/// Decode, assign and aggregate, or dead-letter. Shared by every consumption
/// worker; the accumulator table is the only state it touches.
pub struct Pipeline {
    decoder: EventDecoder,
    assigner: TumblingWindowAssigner,
    table: Arc<AccumulatorTable>,
    dead_letters: DeadLetterRouter,
    by_device: bool,
}

impl Pipeline {
    pub fn new(
        decoder: EventDecoder,
        assigner: TumblingWindowAssigner,
        table: Arc<AccumulatorTable>,
        dead_letters: DeadLetterRouter,
        by_device: bool,
    ) -> Self {
        Self {
            decoder,
            assigner,
            table,
            dead_letters,
            by_device,
        }
    }

    pub fn from_config(
        config: &Config,
        table: Arc<AccumulatorTable>,
        dead_letters: DeadLetterRouter,
    ) -> Self {
        Self::new(
            EventDecoder::new(config.max_future_skew()),
            TumblingWindowAssigner::new(config.window_size(), config.grace_period()),
            table,
            dead_letters,
            config.aggregate_by_device,
        )
    }

    pub fn process(&self, message: RawMessage<'_>, now: DateTime<Utc>) -> Outcome {
        match self.aggregate(&message, now) {
            Ok(key) => {
                metrics::counter!(EVENTS_AGGREGATED).increment(1);
                Outcome::Aggregated(key)
            }
            Err(error) => {
                debug!(reason = %error.reason, detail = %error.detail, "dead-lettering message");
                let reason = error.reason;
                let record = DeadLetterRecord::new(message.payload, &error, now)
                    .with_key(message.key)
                    .with_source(message.source);
                self.dead_letters.route(record);
                Outcome::DeadLettered(reason)
            }
        }
    }

    fn aggregate(
        &self,
        message: &RawMessage<'_>,
        now: DateTime<Utc>,
    ) -> Result<WindowKey, DecodeError> {
        let event = self.decoder.decode(message.payload, now)?;

        let window_start = self.assigner.assign(event.event_time).ok_or_else(|| {
            DecodeError::new(
                ReasonCode::OutOfRange,
                format!("event_time {} has no representable window", event.event_time),
            )
        })?;

        if self.assigner.is_closed(window_start, now) {
            return Err(expired(window_start));
        }

        let key = if self.by_device {
            WindowKey::for_device(window_start, event.device_id.clone())
        } else {
            WindowKey::global(window_start)
        };

        self.table
            .update(key.clone(), &event, message.source)
            .map_err(|UpdateError::WindowClosed(_)| expired(window_start))?;
        Ok(key)
    }
}

fn expired(window_start: DateTime<Utc>) -> DecodeError {
    DecodeError::new(
        ReasonCode::WindowExpired,
        format!("window {} is closed", window_start.to_rfc3339()),
    )
}
