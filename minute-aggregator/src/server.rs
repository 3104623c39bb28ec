use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::ready;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::flusher::Flusher;
use crate::health::{HealthRegistry, HealthStatus};
use crate::metrics_consts::{HTTP_REQUESTS, HTTP_REQUEST_DURATION};

#[derive(Clone)]
pub struct AppState {
    pub liveness: HealthRegistry,
    pub flusher: Arc<Flusher>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ResumeResponse {
    pub resumed: usize,
}

pub async fn index() -> &'static str {
    "minute aggregator"
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

/// Resume flushing for every key paused after storage rejected it.
pub async fn resume_flush(State(state): State<AppState>) -> Json<ResumeResponse> {
    Json(ResumeResponse {
        resumed: state.flusher.resume_paused(),
    })
}

pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness))
        .route("/_resume_flush", post(resume_flush))
        .with_state(state);

    match metrics {
        Some(handle) => router
            .route("/metrics", get(move || ready(handle.render())))
            .layer(axum::middleware::from_fn(track_metrics)),
        None => router,
    }
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0,
        500.0, 1000.0, 5000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Counts and times requests per route and status.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let route = route_label(&req);
    let start = Instant::now();

    let response = next.run(req).await;

    let labels = [
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}

// Unrouted paths share one label so scanners cannot add series
fn route_label(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_owned(), |path| path.as_str().to_owned())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::accumulator::AccumulatorTable;
    use crate::event::{Status, TelemetryEvent};
    use crate::retry::RetryPolicy;
    use crate::sink::MemorySink;
    use crate::snapshot::VersionClock;
    use crate::window::{TumblingWindowAssigner, WindowKey};

    #[tokio::test]
    async fn test_resume_flush_handler() {
        let table = Arc::new(AccumulatorTable::new(0.7));
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = TelemetryEvent {
            event_id: "e1".to_string(),
            event_time: start,
            device_id: "d1".to_string(),
            user_id: None,
            metric_value: 1.0,
            status: Status::Ok,
            anomaly_score: 0.0,
        };
        table
            .update(WindowKey::global(start), &event, None)
            .unwrap();
        table.pause(&WindowKey::global(start));

        let flusher = Arc::new(Flusher::new(
            table.clone(),
            Arc::new(MemorySink::new()),
            Arc::new(VersionClock::new()),
            TumblingWindowAssigner::new(Duration::from_secs(60), Duration::from_secs(15)),
            RetryPolicy::default(),
        ));
        let state = AppState {
            liveness: HealthRegistry::new("liveness"),
            flusher,
        };

        let Json(first) = resume_flush(State(state.clone())).await;
        assert_eq!(first, ResumeResponse { resumed: 1 });

        let Json(second) = resume_flush(State(state)).await;
        assert_eq!(second, ResumeResponse { resumed: 0 });
        assert_eq!(table.snapshot_due(), vec![WindowKey::global(start)]);
    }

    #[test]
    fn test_unrouted_requests_share_a_label() {
        let req = Request::builder()
            .uri("/wp-admin/setup.php?page=1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(route_label(&req), "unmatched");
    }
}
