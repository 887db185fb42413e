//! Read-only status endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::service::{RelayService, RelayStatus};

/// Router serving `GET /health` and `GET /status`
pub fn status_router(service: Arc<RelayService>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn get_status(State(service): State<Arc<RelayService>>) -> Json<RelayStatus> {
    Json(service.status().await)
}
