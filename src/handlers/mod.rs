mod error;
mod generate;
mod health;
mod metrics;
mod usage;

use axum::{
    Router,
    http::HeaderMap,
    routing::{get, post},
};
use std::sync::Arc;

use crate::keys::DEFAULT_KEY;
use crate::state::AppState;

pub use error::ApiError;
pub use generate::generate_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use usage::usage_handler;

pub const API_KEY_HEADER: &str = "x-api-key";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/usage", get(usage_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// Quota key for a request; callers without a key share the default one
pub(crate) fn api_key(headers: &HeaderMap) -> Result<String, ApiError> {
    let Some(value) = headers.get(API_KEY_HEADER) else {
        return Ok(DEFAULT_KEY.to_string());
    };

    let key = value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{} must be visible ASCII", API_KEY_HEADER)))?
        .trim();
    if key.is_empty() {
        return Err(ApiError::BadRequest(format!("{} must not be empty", API_KEY_HEADER)));
    }
    Ok(key.to_string())
}
