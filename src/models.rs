use serde::{Deserialize, Serialize};

use crate::rate_limit::UsageSnapshot;

// Generate request, accepted from clients and forwarded upstream as-is
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
}

// Upstream response format
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GenerateResponse {
    pub model: String,
    pub response: String,
}

// What the gateway returns on success
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerateReply {
    pub model: String,
    pub response: String,
    pub attempts: u32,
    pub usage: UsageSnapshot,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
}

#[derive(Debug, Serialize, Clone)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub backends: Vec<BackendStatus>,
}
