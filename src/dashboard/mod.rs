use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::interchange::StatusSnapshot;

#[derive(Clone)]
pub struct DashboardState {
    pub status: watch::Receiver<StatusSnapshot>,
}

impl DashboardState {
    pub fn new(status: watch::Receiver<StatusSnapshot>) -> Self {
        Self { status }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    state: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/healthz", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the read-only status API until `shutdown` is cancelled.
pub async fn run_dashboard(
    addr: SocketAddr,
    state: DashboardState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting dashboard server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.status.borrow().clone();
    Json(snapshot)
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.status.borrow().clone();
    let body = HealthResponse {
        healthy: snapshot.running,
        state: snapshot.state.to_string(),
    };
    let status = if snapshot.running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
