use axum::{Json, extract::State, http::HeaderMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::handlers::{ApiError, api_key};
use crate::keys::fingerprint;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::models::{GenerateReply, GenerateRequest};
use crate::state::AppState;

// Dropping this future (client disconnect) also drops any pending backoff
pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateReply>, ApiError> {
    REQUEST_TOTAL.inc();

    let key = api_key(&headers)?;
    if payload.model.trim().is_empty() {
        return Err(ApiError::BadRequest("model cannot be empty".to_string()));
    }
    if payload.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt cannot be empty".to_string()));
    }

    let start_time = Instant::now();
    let upstream = &state.upstream;
    let outcome = state
        .governor
        .execute(&key, |_attempt| upstream.generate(&payload))
        .await;
    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());

    let governed = outcome?;
    info!(
        key = %fingerprint(&key),
        attempts = governed.attempts,
        minute_remaining = governed.usage.minute_remaining,
        "generate completed"
    );

    Ok(Json(GenerateReply {
        model: governed.value.model,
        response: governed.value.response,
        attempts: governed.attempts,
        usage: governed.usage,
    }))
}
