//! Health and metrics HTTP surface.
//!
//! Only started when `http_port` is configured. Binds to localhost.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bus::BusClient;
use crate::metrics::{HealthChecker, HealthReport, HealthStatus, MetricsCollector, MetricsSnapshot};
use crate::supervisor::{Supervisor, TaskStats};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub metrics: Arc<MetricsCollector>,
    pub checker: HealthChecker,
    pub supervisor: Supervisor,
    pub bus: BusClient,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/metrics/json", get(json_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub skill: String,
    pub connected: bool,
    #[serde(flatten)]
    pub report: HealthReport,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    pub supervisor: TaskStats,
}

/// GET /health - 503 when unhealthy.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.checker.check(&state.metrics.snapshot());
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (
        status,
        Json(HealthResponse {
            skill: state.metrics.skill_name().to_string(),
            connected: state.bus.is_connected(),
            report,
        }),
    )
}

/// GET /metrics - Prometheus text exposition.
async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

/// GET /metrics/json
async fn json_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(MetricsResponse {
        snapshot: state.metrics.snapshot(),
        supervisor: state.supervisor.stats(),
    })
}
