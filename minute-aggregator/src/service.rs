use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rdkafka::consumer::CommitMode;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::accumulator::AccumulatorTable;
use crate::config::Config;
use crate::dead_letter::{DeadLetterRouter, KafkaDeadLetterSink};
use crate::error::ServiceError;
use crate::flusher::Flusher;
use crate::health::HealthRegistry;
use crate::kafka::TelemetryConsumer;
use crate::offset_tracker::OffsetTracker;
use crate::pipeline::Pipeline;
use crate::retry::RetryPolicy;
use crate::sink::{ClickHouseSink, SnapshotSink};
use crate::snapshot::VersionClock;
use crate::window::TumblingWindowAssigner;

const CONSUMER_DEADLINE: Duration = Duration::from_secs(30);

/// The assembled aggregator: one consumer feeding the accumulator table and one
/// flusher draining it into storage.
pub struct AggregatorService {
    config: Config,
    consumer: TelemetryConsumer,
    flusher: Arc<Flusher>,
    dead_letter_task: JoinHandle<()>,
    liveness: HealthRegistry,
}

impl AggregatorService {
    pub async fn new(config: Config, liveness: HealthRegistry) -> Result<Self, ServiceError> {
        config.validate()?;

        let table = Arc::new(AccumulatorTable::new(config.anomaly_score_threshold));

        let sink: Arc<dyn SnapshotSink> = Arc::new(
            ClickHouseSink::new(&config)
                .await
                .map_err(ServiceError::StorageUnavailable)?,
        );
        let flusher = Arc::new(Flusher::new(
            table.clone(),
            sink,
            Arc::new(VersionClock::new()),
            TumblingWindowAssigner::new(config.window_size(), config.grace_period()),
            RetryPolicy::from_config(&config),
        ));
        // Versions fall back to wall-clock millis, which only loses ordering
        // against rows written by a host whose clock ran ahead of ours
        if let Err(e) = flusher.seed_clock().await {
            warn!(error = ?e, "could not read latest stored version, versions start from the local clock");
        }

        let dead_letter_sink = Arc::new(KafkaDeadLetterSink::new(&config)?);
        let (router, dead_letter_task) =
            DeadLetterRouter::spawn(dead_letter_sink, config.dead_letter_queue_capacity);

        let pipeline = Arc::new(Pipeline::from_config(&config, table.clone(), router));
        let tracker = Arc::new(OffsetTracker::new());
        let consumer = TelemetryConsumer::from_config(&config, pipeline, tracker, table)?;

        Ok(Self {
            config,
            consumer,
            flusher,
            dead_letter_task,
            liveness,
        })
    }

    pub fn flusher(&self) -> Arc<Flusher> {
        self.flusher.clone()
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Run until `signal` completes, then shut down in order:
    ///
    /// 1. stop consuming and apply everything already received,
    /// 2. stop the periodic flusher and flush once more within the shutdown timeout,
    /// 3. commit the offsets that are now safe,
    /// 4. drain the dead-letter queue.
    pub async fn run_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            config,
            consumer,
            flusher,
            dead_letter_task,
            liveness,
        } = self;
        let shutdown_timeout = config.shutdown_timeout();

        let (flush_shutdown_tx, flush_shutdown_rx) = oneshot::channel();
        let flush_liveness = liveness.register("flusher", config.flush_interval() * 6);
        let flusher_task = tokio::spawn(flusher.clone().run(
            config.flush_interval(),
            flush_shutdown_rx,
            flush_liveness,
        ));

        {
            let (consume_shutdown_tx, consume_shutdown_rx) = oneshot::channel();
            let consume_liveness = liveness.register("consumer", CONSUMER_DEADLINE);
            let consuming = consumer.run(consume_shutdown_rx, consume_liveness);
            tokio::pin!(consuming);

            info!("minute aggregator running");

            let requested = async move {
                signal.await;
                info!("Shutdown requested, draining consumption");
                if consume_shutdown_tx.send(()).is_err() {
                    warn!("consumer already stopped");
                }
            };

            let stopped_early = tokio::select! {
                _ = &mut consuming => true,
                _ = requested => false,
            };
            if stopped_early {
                warn!("consumption stopped before shutdown was requested");
            } else {
                consuming.await;
            }
        }

        if flush_shutdown_tx.send(()).is_err() {
            warn!("flusher already stopped");
        }
        if let Err(e) = flusher_task.await {
            error!("flusher task failed: {e:#}");
        }

        let lost = flusher
            .final_flush_within(Utc::now(), shutdown_timeout)
            .await;

        consumer.commit(CommitMode::Sync);

        // The consumer owns the last dead-letter senders, dropping it closes the queue
        drop(consumer);
        match timeout(shutdown_timeout, dead_letter_task).await {
            Ok(Ok(())) => info!("dead-letter queue drained"),
            Ok(Err(e)) => error!("dead-letter task failed: {e:#}"),
            Err(_) => error!(
                "Dead-letter queue did not drain within {:?}",
                shutdown_timeout
            ),
        }

        info!(lost_windows = lost, "minute aggregator stopped");
        Ok(())
    }
}

/// Completes on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e:#}");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e:#}");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
