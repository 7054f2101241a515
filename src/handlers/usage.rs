use axum::{Json, extract::State, http::HeaderMap};
use std::sync::Arc;

use crate::handlers::{ApiError, api_key};
use crate::rate_limit::UsageSnapshot;
use crate::state::AppState;

pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UsageSnapshot>, ApiError> {
    let key = api_key(&headers)?;
    Ok(Json(state.governor.usage(&key)))
}
