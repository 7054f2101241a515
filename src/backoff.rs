// Exponential backoff for upstream retries
//
// Delays are computed once, up front:
// base * 2^0, base * 2^1, ... capped at max_delay

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        let delays = (0..max_retries)
            .map(|attempt| {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max_delay)
            })
            .collect();

        Self { delays }
    }

    /// Delay to wait before retry number `retry` (zero-indexed), if any remain.
    pub fn delay(&self, retry: usize) -> Option<Duration> {
        self.delays.get(retry).copied()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }
}

/// Suspends the calling task between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

// Tokio timer, yields to other tasks while waiting
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
