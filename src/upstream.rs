use reqwest::StatusCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;
use crate::models::{BackendStatus, GenerateRequest, GenerateResponse};

// Single backend server
#[derive(Debug)]
pub struct Backend {
    pub url: String,
    healthy: AtomicBool,
}

impl Backend {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("at least one backend is required")]
pub struct NoBackends;

// Round-robin pool of backends
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    current: AtomicUsize,
}

impl BackendPool {
    // Parse comma-separated hosts, e.g. "localhost:11434, localhost:11435"
    pub fn new(backends_str: &str) -> Result<Self, NoBackends> {
        let backends: Vec<Arc<Backend>> = backends_str
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|url| {
                let full_url = if url.starts_with("http://") || url.starts_with("https://") {
                    url.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}", url.trim_end_matches('/'))
                };
                Arc::new(Backend::new(full_url))
            })
            .collect();

        if backends.is_empty() {
            return Err(NoBackends);
        }

        info!(count = backends.len(), "backend pool initialized");
        for backend in &backends {
            info!(url = %backend.url, "backend registered");
        }

        Ok(Self {
            backends,
            current: AtomicUsize::new(0),
        })
    }

    // Next healthy backend (round-robin); plain rotation when none is healthy
    pub fn next_backend(&self) -> Arc<Backend> {
        let len = self.backends.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;

        let backend = (0..len)
            .map(|i| &self.backends[(start + i) % len])
            .find(|backend| backend.is_healthy())
            .unwrap_or(&self.backends[start]);
        Arc::clone(backend)
    }

    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus {
                url: b.url.clone(),
                healthy: b.is_healthy(),
            })
            .collect()
    }
}

/// Client for the hosted LLM, one call per governed attempt.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    pool: Arc<BackendPool>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(client: reqwest::Client, pool: Arc<BackendPool>, timeout: Duration) -> Self {
        Self {
            client,
            pool,
            timeout,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, UpstreamError> {
        let backend = self.pool.next_backend();
        debug!(url = %backend.url, "forwarding generate request");

        let res = self
            .client
            .post(format!("{}/api/generate", backend.url))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    backend.set_healthy(false);
                    warn!(url = %backend.url, "backend unreachable, marked unhealthy");
                }
                classify_send_error(&e)
            })?;

        // Any HTTP answer means the backend is reachable again
        if !backend.is_healthy() {
            backend.set_healthy(true);
            info!(url = %backend.url, "backend answered, marked healthy");
        }

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        res.json::<GenerateResponse>().await.map_err(|e| {
            if e.is_decode() {
                UpstreamError::NonRetryable(format!("parse error: {}", e))
            } else {
                UpstreamError::Transient(format!("body read failed: {}", e))
            }
        })
    }
}

// 429 and 5xx are worth another try; every other failure status is final
pub fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
    let message = if body.is_empty() {
        format!("status {}", status)
    } else {
        format!("status {}: {}", status, body)
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        UpstreamError::Transient(message)
    } else {
        UpstreamError::NonRetryable(message)
    }
}

fn classify_send_error(e: &reqwest::Error) -> UpstreamError {
    if e.is_builder() {
        UpstreamError::NonRetryable(format!("invalid request: {}", e))
    } else {
        UpstreamError::Transient(format!("request failed: {}", e))
    }
}

// Checks every backend and restores the ones that answer
pub async fn health_checker(
    pool: Arc<BackendPool>,
    client: reqwest::Client,
    check_interval: Duration,
) {
    let mut ticker = interval(check_interval);
    info!(interval = ?check_interval, "health checker started");

    loop {
        ticker.tick().await;

        for backend in pool.all_backends() {
            let url = format!("{}/api/tags", backend.url);
            let was_healthy = backend.is_healthy();

            let reply = client.get(&url).timeout(Duration::from_secs(5)).send().await;
            let is_healthy = match reply {
                Ok(res) => res.status().is_success(),
                Err(_) => false,
            };
            backend.set_healthy(is_healthy);

            if was_healthy != is_healthy {
                if is_healthy {
                    info!(url = %backend.url, "backend is now healthy");
                } else {
                    warn!(url = %backend.url, "backend is now unhealthy");
                }
            }
        }
    }
}
