use anyhow::{Context, Result};
use async_trait::async_trait;
use clickhouse::sql::Identifier;
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::Config;
use crate::sink::{SinkError, SnapshotSink};
use crate::snapshot::{Snapshot, Version};

// ClickHouse exception names that mean the row shape does not match the table
const CONTRACT_VIOLATIONS: &[&str] = &[
    "UNKNOWN_TABLE",
    "UNKNOWN_DATABASE",
    "NO_SUCH_COLUMN_IN_TABLE",
    "UNKNOWN_IDENTIFIER",
    "TYPE_MISMATCH",
    "CANNOT_PARSE",
    "ILLEGAL_TYPE_OF_ARGUMENT",
    "AUTHENTICATION_FAILED",
    "ACCESS_DENIED",
];

/// One row of the global minute table, `ReplacingMergeTree(updated_at)` ordered
/// by `window_start`.
#[derive(Row, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteAggRow {
    #[serde(with = "clickhouse::serde::time::datetime")]
    pub window_start: OffsetDateTime,
    pub total_events: u64,
    pub avg_metric: f64,
    pub unique_users: u64,
    pub anomaly_events: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub updated_at: OffsetDateTime,
}

/// One row of the per-device minute table, ordered by `(window_start, device_id)`.
#[derive(Row, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMinuteAggRow {
    #[serde(with = "clickhouse::serde::time::datetime")]
    pub window_start: OffsetDateTime,
    pub device_id: String,
    pub total_events: u64,
    pub avg_metric: f64,
    pub unique_users: u64,
    pub anomaly_events: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub updated_at: OffsetDateTime,
}

impl TryFrom<&Snapshot> for MinuteAggRow {
    type Error = SinkError;

    fn try_from(snapshot: &Snapshot) -> Result<Self, Self::Error> {
        Ok(Self {
            window_start: to_offset_datetime(snapshot.window_start().timestamp_millis())?,
            total_events: snapshot.values.total_events,
            avg_metric: round_avg(snapshot.values.avg_metric),
            unique_users: snapshot.values.unique_users,
            anomaly_events: snapshot.values.anomaly_events,
            updated_at: to_offset_datetime(snapshot.version.as_millis())?,
        })
    }
}

impl TryFrom<&Snapshot> for DeviceMinuteAggRow {
    type Error = SinkError;

    fn try_from(snapshot: &Snapshot) -> Result<Self, Self::Error> {
        let Some(device_id) = snapshot.key.device_id.clone() else {
            return Err(SinkError::Fatal(format!(
                "snapshot for {} has no device id",
                snapshot.key
            )));
        };
        Ok(Self {
            window_start: to_offset_datetime(snapshot.window_start().timestamp_millis())?,
            device_id,
            total_events: snapshot.values.total_events,
            avg_metric: round_avg(snapshot.values.avg_metric),
            unique_users: snapshot.values.unique_users,
            anomaly_events: snapshot.values.anomaly_events,
            updated_at: to_offset_datetime(snapshot.version.as_millis())?,
        })
    }
}

fn round_avg(avg: f64) -> f64 {
    (avg * 10_000.0).round() / 10_000.0
}

fn to_offset_datetime(millis: i64) -> Result<OffsetDateTime, SinkError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| SinkError::Fatal(format!("timestamp {millis}ms out of range: {e}")))
}

/// Sort a ClickHouse client error into the retry taxonomy: connectivity problems
/// and server-side hiccups are transient, anything that says the row does not fit
/// the table is fatal.
pub fn classify(error: clickhouse::error::Error) -> SinkError {
    use clickhouse::error::Error;

    match error {
        Error::Network(_) | Error::TimedOut => SinkError::Transient(error.to_string()),
        Error::BadResponse(message) => {
            if CONTRACT_VIOLATIONS
                .iter()
                .any(|marker| message.contains(marker))
            {
                SinkError::Fatal(message)
            } else {
                SinkError::Transient(message)
            }
        }
        other => SinkError::Fatal(other.to_string()),
    }
}

pub struct ClickHouseSink {
    client: Client,
    table: String,
    by_device: bool,
}

impl ClickHouseSink {
    pub async fn new(config: &Config) -> Result<Self> {
        let client = Client::default()
            .with_url(config.clickhouse_url.clone())
            .with_database(config.clickhouse_database.clone())
            .with_user(config.clickhouse_user.clone())
            .with_password(config.clickhouse_password.clone());

        // Verify connection
        client
            .query("SELECT 1")
            .execute()
            .await
            .context("Failed to connect to ClickHouse")?;

        let table = if config.aggregate_by_device {
            config.device_agg_table.clone()
        } else {
            config.agg_table.clone()
        };

        info!(
            url = %config.clickhouse_url,
            table = %table,
            "connected to ClickHouse"
        );

        Ok(Self::with_client(client, table, config.aggregate_by_device))
    }

    pub fn with_client(client: Client, table: String, by_device: bool) -> Self {
        Self {
            client,
            table,
            by_device,
        }
    }

    async fn insert_rows<R>(&self, rows: &[R]) -> Result<(), clickhouse::error::Error>
    where
        R: Row + Serialize,
    {
        let mut insert = self.client.insert::<R>(&self.table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await
    }
}

#[async_trait]
impl SnapshotSink for ClickHouseSink {
    async fn write(&self, snapshots: &[Snapshot]) -> Result<(), SinkError> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let result = if self.by_device {
            let rows = snapshots
                .iter()
                .map(DeviceMinuteAggRow::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            self.insert_rows(&rows).await
        } else {
            let rows = snapshots
                .iter()
                .map(MinuteAggRow::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            self.insert_rows(&rows).await
        };

        result.map_err(classify)?;
        debug!(table = %self.table, rows = snapshots.len(), "inserted snapshot rows");
        Ok(())
    }

    async fn latest_version(&self) -> Result<Option<Version>, SinkError> {
        let millis = self
            .client
            .query("SELECT toUnixTimestamp64Milli(max(updated_at)) FROM ?")
            .bind(Identifier(&self.table))
            .fetch_one::<i64>()
            .await
            .map_err(classify)?;

        // max() over an empty table yields the epoch
        Ok((millis > 0).then_some(Version::from_millis(millis)))
    }
}
