//! Operator diagnostics endpoints.
//!
//! - `GET /health` - Liveness probe (is the session actor running?)
//! - `GET /ready` - Readiness probe (has the local participant joined?)
//! - `GET /diagnostics` - JSON [`DiagnosticSnapshot`]
//! - `POST /diagnostics/sweep` - Run a reconnect sweep, returns the [`SweepReport`]
//!
//! Note: The `/metrics` endpoint is mounted separately by the binary from the
//! Prometheus handle.
//!
//! [`DiagnosticSnapshot`]: crate::sweeper::DiagnosticSnapshot
//! [`SweepReport`]: crate::sweeper::SweepReport

use crate::actors::SessionHandle;
use crate::errors::SessionError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared state for the diagnostics router.
#[derive(Debug, Clone)]
pub struct DiagnosticsState {
    session: SessionHandle,
}

impl DiagnosticsState {
    #[must_use]
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }
}

/// Create the diagnostics router.
pub fn diagnostics_router(state: Arc<DiagnosticsState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/diagnostics", get(snapshot_handler))
        .route("/diagnostics/sweep", post(sweep_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn liveness_handler(State(state): State<Arc<DiagnosticsState>>) -> StatusCode {
    if state.session.is_cancelled() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn readiness_handler(State(state): State<Arc<DiagnosticsState>>) -> StatusCode {
    match state.session.diagnostics().await {
        Ok(snapshot) if snapshot.peer_ready => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn snapshot_handler(State(state): State<Arc<DiagnosticsState>>) -> Response {
    match state.session.diagnostics().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => unavailable(&e),
    }
}

async fn sweep_handler(State(state): State<Arc<DiagnosticsState>>) -> Response {
    match state.session.run_sweep().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => unavailable(&e),
    }
}

fn unavailable(error: &SessionError) -> Response {
    warn!(target: "session.actor", error = %error, "Diagnostics request failed");
    (StatusCode::SERVICE_UNAVAILABLE, error.client_message()).into_response()
}
