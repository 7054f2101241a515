use axum::{Json, extract::State};
use std::sync::Arc;

use crate::models::HealthResponse;
use crate::state::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backends = state.upstream.pool().status();
    let status = if backends.iter().any(|b| b.healthy) {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        timestamp: chrono::Utc::now().to_rfc3339(),
        backends,
    })
}
