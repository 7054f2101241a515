use std::time::Duration;
use thiserror::Error;

use crate::rate_limit::{RejectReason, UsageSnapshot, ceil_secs};

/// Failure reported by a wrapped upstream call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    // Timeouts, connection failures, 5xx, upstream 429
    #[error("transient upstream failure: {0}")]
    Transient(String),
    // Bad request, auth failure, undecodable body
    #[error("upstream rejected the request: {0}")]
    NonRetryable(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

/// Terminal outcome of a governed call, one variant per thing a client
/// needs to render differently.
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("{}: retry after {}s", .reason.as_str(), retry_after_secs(.retry_after))]
    QuotaExceeded {
        reason: RejectReason,
        retry_after: Duration,
        usage: UsageSnapshot,
    },

    #[error("{error}")]
    NonRetryable {
        error: UpstreamError,
        usage: UsageSnapshot,
    },

    #[error("upstream unavailable, retried {retries} times: {last_error}")]
    RetriesExhausted {
        retries: u32,
        last_error: UpstreamError,
        usage: UsageSnapshot,
    },

    #[error("request cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("api key must not be empty")]
    InvalidKey,
}

// Rounded up, matching the Retry-After header
fn retry_after_secs(retry_after: &Duration) -> u64 {
    ceil_secs(*retry_after)
}

impl GovernorError {
    pub fn kind(&self) -> &'static str {
        match self {
            GovernorError::QuotaExceeded { reason, .. } => reason.as_str(),
            GovernorError::NonRetryable { .. } => "upstream_rejected",
            GovernorError::RetriesExhausted { .. } => "retries_exhausted",
            GovernorError::Cancelled { .. } => "cancelled",
            GovernorError::InvalidKey => "invalid_key",
        }
    }

    pub fn usage(&self) -> Option<&UsageSnapshot> {
        match self {
            GovernorError::QuotaExceeded { usage, .. }
            | GovernorError::NonRetryable { usage, .. }
            | GovernorError::RetriesExhausted { usage, .. } => Some(usage),
            GovernorError::Cancelled { .. } | GovernorError::InvalidKey => None,
        }
    }
}
