use anyhow::{Context, Result};
use axum::Router;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use minute_aggregator::config::Config;
use minute_aggregator::health::HealthRegistry;
use minute_aggregator::server::{self, serve, setup_metrics_recorder, AppState};
use minute_aggregator::service::AggregatorService;

fn setup_tracing(json: bool) {
    let log_layer = if json {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(bind: String, router: Router) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve http endpoints on {bind}: {e:#}");
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    setup_tracing(config.log_json);
    info!("Starting minute aggregator");

    let liveness = HealthRegistry::new("liveness");
    let service = AggregatorService::new(config.clone(), liveness.clone())
        .await
        .context("Failed to create minute aggregator. Check the Kafka and ClickHouse connections.")?;

    let metrics = setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let router = server::router(
        AppState {
            liveness,
            flusher: service.flusher(),
        },
        Some(metrics),
    );
    let server_handle = start_server(config.bind_address(), router);
    info!("Serving http endpoints on {}", config.bind_address());

    // Blocks until shutdown
    service.run().await?;

    server_handle.abort();

    Ok(())
}
