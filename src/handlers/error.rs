use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::GovernorError;
use crate::rate_limit::ceil_secs;

// Everything a handler can fail with
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Governor(GovernorError),
}

impl From<GovernorError> for ApiError {
    fn from(err: GovernorError) -> Self {
        ApiError::Governor(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::BadRequest(message) => {
                let body = json!({ "error": message, "kind": "invalid_request" });
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
            ApiError::Governor(err) => err,
        };

        let kind = err.kind();
        match &err {
            GovernorError::QuotaExceeded {
                retry_after, usage, ..
            } => {
                let secs = ceil_secs(*retry_after);
                let body = json!({
                    "error": "too many requests",
                    "kind": kind,
                    "retry_after": secs,
                    "usage": usage,
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            GovernorError::RetriesExhausted { retries, usage, .. } => {
                let body = json!({
                    "error": format!("upstream unavailable, retried {} times", retries),
                    "kind": kind,
                    "retries": retries,
                    "usage": usage,
                });
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
            GovernorError::NonRetryable { usage, .. } => {
                let body = json!({ "error": err.to_string(), "kind": kind, "usage": usage });
                (StatusCode::BAD_GATEWAY, Json(body)).into_response()
            }
            GovernorError::Cancelled { .. } => {
                let body = json!({ "error": err.to_string(), "kind": kind });
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
            GovernorError::InvalidKey => {
                let body = json!({ "error": err.to_string(), "kind": kind });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
        }
    }
}
