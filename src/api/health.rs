//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::relay::SessionSummary;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Session occupancy response
#[derive(Serialize)]
pub struct SessionsResponse {
    pub active: usize,
    pub limit: usize,
    pub sessions: Vec<SessionSummary>,
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Current sessions against the configured limit
async fn sessions(State(state): State<Arc<ApiState>>) -> Json<SessionsResponse> {
    let sessions = state.relay.sessions().await;
    Json(SessionsResponse {
        active: sessions.len(),
        limit: state.relay.options().max_sessions,
        sessions,
    })
}

/// Build health routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/sessions", get(sessions))
        .with_state(state)
}
