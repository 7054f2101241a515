use clap::Parser;
use std::time::Duration;

// CLI argument structure (every flag can also come from the environment)
#[derive(Parser, Debug, Clone)]
#[command(name = "quota-gateway")]
#[command(about = "Quota-gated proxy for hosted LLM backends")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Backend servers (comma-separated)
    // Example: "localhost:11434,localhost:11435"
    #[arg(short, long, env = "BACKENDS", default_value = "localhost:11434")]
    pub backends: String,

    // Requests admitted per key per minute
    #[arg(long, env = "RPM_LIMIT", default_value_t = 10)]
    pub rpm_limit: u32,

    // Requests admitted per key per day
    #[arg(long, env = "RPD_LIMIT", default_value_t = 250)]
    pub rpd_limit: u32,

    // Retries after the first failed upstream attempt
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    // First backoff delay, doubled on every retry
    #[arg(long, env = "BASE_BACKOFF_SECONDS", default_value_t = 1.0)]
    pub base_backoff_seconds: f64,

    // Ceiling for a single backoff delay
    #[arg(long, env = "MAX_BACKOFF_SECONDS", default_value_t = 30.0)]
    pub max_backoff_seconds: f64,

    // Longest wait for the minute window to free a slot; 0 rejects at once
    #[arg(long, env = "MAX_ADMISSION_WAIT_SECONDS", default_value_t = 0.0)]
    pub max_admission_wait_seconds: f64,

    // Upstream request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 60)]
    pub request_timeout: u64,

    // Health check interval in seconds
    #[arg(
        long,
        env = "HEALTH_INTERVAL",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub health_interval: u64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a finite, non-negative number of seconds (got {value})")]
    InvalidSeconds { name: &'static str, value: f64 },
}

/// Quota and retry settings consumed by [`crate::governor::Governor`].
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    pub rpm_limit: u32,
    pub rpd_limit: u32,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_admission_wait: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rpm_limit: 10,
            rpd_limit: 250,
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_admission_wait: Duration::ZERO,
        }
    }
}

impl Args {
    pub fn governor_config(&self) -> Result<GovernorConfig, ConfigError> {
        Ok(GovernorConfig {
            rpm_limit: self.rpm_limit,
            rpd_limit: self.rpd_limit,
            max_retries: self.max_retries,
            base_backoff: seconds("base_backoff_seconds", self.base_backoff_seconds)?,
            max_backoff: seconds("max_backoff_seconds", self.max_backoff_seconds)?,
            max_admission_wait: seconds(
                "max_admission_wait_seconds",
                self.max_admission_wait_seconds,
            )?,
        })
    }
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidSeconds { name, value })
}
