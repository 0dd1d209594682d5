//! Admin listener (§10): `/internal/healthz` and `/internal/metrics`, bound
//! to a separate address from the public client-facing listener so neither
//! endpoint is ever reachable on the public port.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/internal/healthz", get(healthz))
        .route("/internal/metrics", get(metrics))
        .with_state(app)
}

async fn healthz(State(app): State<Arc<AppState>>) -> StatusCode {
    if app.store_ready.load(Ordering::Relaxed) && app.directory_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(app): State<Arc<AppState>>) -> String {
    app.metrics.render(app.local_sessions.len(), app.in_flight_requests())
}
