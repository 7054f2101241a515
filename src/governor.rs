//! Quota-gated request governor.
//!
//! Every call goes through one admission (a check-and-increment against the
//! key's minute and day windows). Admitted calls are retried on transient
//! upstream failure following a precomputed [`BackoffSchedule`]; retries do
//! not consume extra quota.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffSchedule, Sleeper, TokioSleeper};
use crate::clock::{Clock, SystemClock};
use crate::config::GovernorConfig;
use crate::error::{GovernorError, UpstreamError};
use crate::keys::fingerprint;
use crate::metrics::{
    ADMITTED_TOTAL, REJECTED_TOTAL, RETRIES_EXHAUSTED_TOTAL, TRACKED_KEYS, UPSTREAM_RETRIES_TOTAL,
};
use crate::rate_limit::{AdmitResult, Limits, RejectReason, UsageSnapshot, UsageStore};

/// Successful result of [`Governor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Governed<T> {
    pub value: T,
    // Snapshot taken at admission
    pub usage: UsageSnapshot,
    // 1 + number of retries
    pub attempts: u32,
}

pub struct Governor {
    config: GovernorConfig,
    store: UsageStore,
    backoff: BackoffSchedule,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self::with_runtime(config, Arc::new(SystemClock), Arc::new(TokioSleeper))
    }

    /// Build with an explicit clock and sleeper (deterministic tests).
    pub fn with_runtime(
        config: GovernorConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let backoff =
            BackoffSchedule::new(config.base_backoff, config.max_backoff, config.max_retries);
        Self {
            config,
            store: UsageStore::new(),
            backoff,
            clock,
            sleeper,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn backoff(&self) -> &BackoffSchedule {
        &self.backoff
    }

    fn limits(&self) -> Limits {
        Limits {
            rpm: self.config.rpm_limit,
            rpd: self.config.rpd_limit,
        }
    }

    /// Check quota for `key` and reserve one request if it fits.
    pub fn admit(&self, key: &str) -> AdmitResult {
        let result = self.store.admit(key, self.limits(), self.clock.now());
        TRACKED_KEYS.set(self.store.len() as f64);

        match &result {
            AdmitResult::Admitted { usage } => {
                ADMITTED_TOTAL.inc();
                debug!(
                    key = %fingerprint(key),
                    minute_used = usage.minute_used,
                    day_used = usage.day_used,
                    "request admitted"
                );
            }
            AdmitResult::Rejected {
                reason,
                retry_after,
                ..
            } => {
                REJECTED_TOTAL.with_label_values(&[reason.as_str()]).inc();
                info!(
                    key = %fingerprint(key),
                    reason = reason.as_str(),
                    retry_after_secs = retry_after.as_secs(),
                    "request rejected"
                );
            }
        }
        result
    }

    /// [`Governor::admit`] as a `Result`, refusing empty keys.
    pub fn try_admit(&self, key: &str) -> Result<UsageSnapshot, GovernorError> {
        if key.is_empty() {
            return Err(GovernorError::InvalidKey);
        }
        match self.admit(key) {
            AdmitResult::Admitted { usage } => Ok(usage),
            AdmitResult::Rejected {
                reason,
                retry_after,
                usage,
            } => Err(GovernorError::QuotaExceeded {
                reason,
                retry_after,
                usage,
            }),
        }
    }

    pub fn usage(&self, key: &str) -> UsageSnapshot {
        let usage = self.store.usage(key, self.limits(), self.clock.now());
        TRACKED_KEYS.set(self.store.len() as f64);
        usage
    }

    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<Governed<T>, GovernorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.execute_with_cancel(key, operation, std::future::pending::<()>())
            .await
    }

    /// Admit, then run `operation` with retries until it succeeds, fails
    /// permanently, runs out of retries, or `cancel` resolves.
    ///
    /// Admission goes through [`Governor::wait_for_admission`] with the
    /// configured `max_admission_wait` (zero rejects right away).
    /// `operation` receives the 1-based attempt number.
    pub async fn execute_with_cancel<T, F, Fut, C>(
        &self,
        key: &str,
        mut operation: F,
        cancel: C,
    ) -> Result<Governed<T>, GovernorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let max_wait = self.config.max_admission_wait;
        let usage = tokio::select! {
            biased;
            _ = &mut cancel => return Err(GovernorError::Cancelled { attempts: 0 }),
            admitted = self.wait_for_admission(key, max_wait) => admitted?,
        };

        let mut attempts: u32 = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = &mut cancel => return Err(GovernorError::Cancelled { attempts }),
                outcome = async { operation(attempts + 1).await } => outcome,
            };
            attempts += 1;

            let error = match outcome {
                Ok(value) => {
                    return Ok(Governed {
                        value,
                        usage,
                        attempts,
                    });
                }
                Err(error) if !error.is_transient() => {
                    warn!(
                        key = %fingerprint(key),
                        attempts,
                        %error,
                        "upstream failed, not retrying"
                    );
                    return Err(GovernorError::NonRetryable { error, usage });
                }
                Err(error) => error,
            };

            let retries = attempts - 1;
            let Some(delay) = self.backoff.delay(retries as usize) else {
                RETRIES_EXHAUSTED_TOTAL.inc();
                warn!(
                    key = %fingerprint(key),
                    retries,
                    error = %error,
                    "upstream retries exhausted"
                );
                return Err(GovernorError::RetriesExhausted {
                    retries,
                    last_error: error,
                    usage,
                });
            };

            UPSTREAM_RETRIES_TOTAL.inc();
            warn!(
                key = %fingerprint(key),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "transient upstream failure, backing off"
            );

            tokio::select! {
                biased;
                _ = &mut cancel => {
                    info!(key = %fingerprint(key), attempts, "cancelled during backoff");
                    return Err(GovernorError::Cancelled { attempts });
                }
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }

    /// Admit, waiting out a minute-window rejection when it clears within
    /// `max_wait`. Day-window rejections are never waited on.
    pub async fn wait_for_admission(
        &self,
        key: &str,
        max_wait: Duration,
    ) -> Result<UsageSnapshot, GovernorError> {
        match self.try_admit(key) {
            Err(GovernorError::QuotaExceeded {
                reason: RejectReason::MinuteQuotaExceeded,
                retry_after,
                ..
            }) if retry_after <= max_wait => {
                info!(
                    key = %fingerprint(key),
                    wait_ms = retry_after.as_millis() as u64,
                    "minute quota reached, waiting for window"
                );
                self.sleeper.sleep(retry_after).await;
                self.try_admit(key)
            }
            other => other,
        }
    }

    // Explicit reset hooks; nothing on the request path calls these
    pub fn reset(&self) {
        self.store.clear();
        TRACKED_KEYS.set(0.0);
    }

    pub fn reset_key(&self, key: &str) -> bool {
        let removed = self.store.remove(key);
        TRACKED_KEYS.set(self.store.len() as f64);
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::testing::{RecordingSleeper, StalledSleeper};
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(rpm: u32, rpd: u32) -> GovernorConfig {
        GovernorConfig {
            rpm_limit: rpm,
            rpd_limit: rpd,
            ..GovernorConfig::default()
        }
    }

    fn build(config: GovernorConfig) -> (Governor, Arc<ManualClock>, Arc<RecordingSleeper>) {
        let clock = Arc::new(ManualClock::new());
        let sleeper = Arc::new(RecordingSleeper::default());
        let governor = Governor::with_runtime(config, clock.clone(), sleeper.clone());
        (governor, clock, sleeper)
    }

    #[test]
    fn minute_limit_rejects_next_request() {
        let (governor, clock, _) = build(config(10, 250));
        for _ in 0..10 {
            assert!(governor.admit("alice").is_admitted());
        }

        clock.advance(Duration::from_secs(15));
        match governor.admit("alice") {
            AdmitResult::Rejected {
                reason,
                retry_after,
                usage,
            } => {
                assert_eq!(reason, RejectReason::MinuteQuotaExceeded);
                assert!(retry_after <= Duration::from_secs(60));
                assert_eq!(retry_after, Duration::from_secs(45));
                assert_eq!(usage.minute_used, 10);
            }
            other => panic!("expected minute rejection, got {other:?}"),
        }
    }

    #[test]
    fn minute_window_expiry_keeps_day_count() {
        let (governor, clock, _) = build(config(10, 250));
        for _ in 0..10 {
            governor.admit("alice");
        }
        assert!(!governor.admit("alice").is_admitted());

        clock.advance(Duration::from_secs(60));
        assert_eq!(governor.usage("alice").minute_used, 0);

        let result = governor.admit("alice");
        assert!(result.is_admitted());
        assert_eq!(result.usage().minute_used, 1);
        assert_eq!(result.usage().day_used, 11);
    }

    #[test]
    fn day_limit_rejects_with_fresh_minute_window() {
        let (governor, clock, _) = build(config(10, 25));
        for _ in 0..25 {
            if !governor.admit("alice").is_admitted() {
                clock.advance(Duration::from_secs(60));
                assert!(governor.admit("alice").is_admitted());
            }
        }
        clock.advance(Duration::from_secs(60));
        assert_eq!(governor.usage("alice").minute_used, 0);

        match governor.admit("alice") {
            AdmitResult::Rejected {
                reason,
                retry_after,
                usage,
            } => {
                assert_eq!(reason, RejectReason::DayQuotaExceeded);
                assert_eq!(usage.day_used, 25);
                assert!(retry_after < Duration::from_secs(24 * 60 * 60));
                assert!(retry_after > Duration::from_secs(23 * 60 * 60));
            }
            other => panic!("expected day rejection, got {other:?}"),
        }

        clock.advance(Duration::from_secs(24 * 60 * 60));
        assert!(governor.admit("alice").is_admitted());
    }

    #[test]
    fn zero_limits_always_reject() {
        let (governor, _, _) = build(config(0, 250));
        assert!(matches!(
            governor.admit("alice"),
            AdmitResult::Rejected {
                reason: RejectReason::MinuteQuotaExceeded,
                ..
            }
        ));

        let (governor, _, _) = build(config(10, 0));
        assert!(matches!(
            governor.admit("alice"),
            AdmitResult::Rejected {
                reason: RejectReason::DayQuotaExceeded,
                ..
            }
        ));
    }

    #[test]
    fn concurrent_admissions_never_exceed_limit() {
        let (governor, _, _) = build(config(10, 250));
        let admitted = AtomicU32::new(0);

        std::thread::scope(|scope| {
            for _ in 0..64 {
                scope.spawn(|| {
                    if governor.admit("shared").is_admitted() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 10);
        assert_eq!(governor.usage("shared").minute_used, 10);
    }

    #[test]
    fn unseen_key_reports_full_quota() {
        let (governor, _, _) = build(GovernorConfig::default());
        let usage = governor.usage("nobody");
        assert_eq!(usage.minute_used, 0);
        assert_eq!(usage.day_used, 0);
        assert_eq!(usage.minute_remaining, 10);
        assert_eq!(usage.day_remaining, 250);
        assert_eq!(usage.minute_limit, 10);
        assert_eq!(usage.day_limit, 250);
    }

    #[test]
    fn empty_key_is_invalid() {
        let (governor, _, _) = build(GovernorConfig::default());
        assert!(matches!(governor.try_admit(""), Err(GovernorError::InvalidKey)));
        assert_eq!(governor.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn transient_twice_then_success() {
        let (governor, _, sleeper) = build(GovernorConfig::default());
        let calls = AtomicU32::new(0);

        let result = governor
            .execute("alice", |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(UpstreamError::Transient("503".into()))
                    } else {
                        Ok("answer")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, "answer");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        // One admission regardless of retries
        assert_eq!(governor.usage("alice").minute_used, 1);
    }

    #[tokio::test]
    async fn always_transient_exhausts_retries() {
        let (governor, _, sleeper) = build(GovernorConfig::default());
        let calls = AtomicU32::new(0);

        let err = governor
            .execute("alice", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(UpstreamError::Transient("timeout".into())) }
            })
            .await
            .unwrap_err();

        match err {
            GovernorError::RetriesExhausted {
                retries,
                last_error,
                usage,
            } => {
                assert_eq!(retries, 3);
                assert_eq!(last_error, UpstreamError::Transient("timeout".into()));
                assert_eq!(usage.minute_used, 1);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            sleeper.slept(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn non_retryable_fails_after_one_attempt() {
        let (governor, _, sleeper) = build(GovernorConfig::default());
        let calls = AtomicU32::new(0);

        let err = governor
            .execute("alice", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(UpstreamError::NonRetryable("401".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GovernorError::NonRetryable { .. }));
        assert_eq!(err.kind(), "upstream_rejected");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn rejected_call_never_runs_operation() {
        let (governor, _, _) = build(config(1, 250));
        governor.admit("alice");
        let calls = AtomicU32::new(0);

        let err = governor
            .execute("alice", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, UpstreamError>(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "minute_quota_exceeded");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let (governor, _, _) = build(GovernorConfig {
            max_retries: 0,
            ..GovernorConfig::default()
        });

        let err = governor
            .execute("alice", |_| async {
                Err::<(), _>(UpstreamError::Transient("502".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GovernorError::RetriesExhausted { retries: 0, .. }));
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_retrying() {
        let clock = Arc::new(ManualClock::new());
        let governor = Governor::with_runtime(
            GovernorConfig::default(),
            clock,
            Arc::new(StalledSleeper),
        );
        let calls = AtomicU32::new(0);
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let run = governor.execute_with_cancel(
            "alice",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(UpstreamError::Transient("503".into())) }
            },
            async move {
                let _ = cancel_rx.await;
            },
        );

        let (result, _) = tokio::join!(run, async move {
            tokio::task::yield_now().await;
            let _ = cancel_tx.send(());
        });

        assert!(matches!(result, Err(GovernorError::Cancelled { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let (governor, _, _) = build(GovernorConfig::default());
        let calls = AtomicU32::new(0);

        let result = governor
            .execute_with_cancel(
                "alice",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, UpstreamError>(()) }
                },
                std::future::ready(()),
            )
            .await;

        assert!(matches!(result, Err(GovernorError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(governor.usage("alice").minute_used, 0);
    }

    // Advances the manual clock instead of sleeping
    struct ClockSleeper {
        clock: Arc<ManualClock>,
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for ClockSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
            self.clock.advance(duration);
        }
    }

    #[tokio::test]
    async fn wait_for_admission_waits_out_minute_window() {
        let clock = Arc::new(ManualClock::new());
        let sleeper = Arc::new(ClockSleeper {
            clock: clock.clone(),
            slept: Mutex::new(Vec::new()),
        });
        let governor = Governor::with_runtime(config(2, 250), clock.clone(), sleeper.clone());
        governor.admit("alice");
        governor.admit("alice");
        clock.advance(Duration::from_secs(20));

        let usage = governor
            .wait_for_admission("alice", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(usage.minute_used, 1);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_secs(40)]);
    }

    #[tokio::test]
    async fn wait_for_admission_gives_up_on_long_waits() {
        let (governor, _, sleeper) = build(config(1, 250));
        governor.admit("alice");

        let err = governor
            .wait_for_admission("alice", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "minute_quota_exceeded");
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn wait_for_admission_never_waits_on_day_quota() {
        let (governor, _, sleeper) = build(config(10, 1));
        governor.admit("alice");

        let err = governor
            .wait_for_admission("alice", Duration::from_secs(24 * 60 * 60))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "day_quota_exceeded");
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn backoff_on_one_key_does_not_block_another() {
        let governor = Governor::with_runtime(
            GovernorConfig::default(),
            Arc::new(ManualClock::new()),
            Arc::new(StalledSleeper),
        );
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let stuck = governor.execute_with_cancel(
            "a",
            |_| async { Err::<(), _>(UpstreamError::Transient("503".into())) },
            async move {
                let _ = cancel_rx.await;
            },
        );
        tokio::pin!(stuck);

        // Drive key "a" into its backoff sleep; it must still be pending
        let parked = tokio::time::timeout(Duration::from_millis(20), &mut stuck).await;
        assert!(parked.is_err());

        assert!(governor.admit("b").is_admitted());
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            governor.execute("b", |_| async { Ok::<_, UpstreamError>("done") }),
        )
        .await
        .expect("key b finished while key a was backing off")
        .unwrap();
        assert_eq!(other.value, "done");
        assert_eq!(governor.usage("b").minute_used, 2);

        cancel_tx.send(()).unwrap();
        assert!(matches!(
            stuck.await,
            Err(GovernorError::Cancelled { attempts: 1 })
        ));
    }

    #[tokio::test]
    async fn execute_waits_for_admission_when_configured() {
        let clock = Arc::new(ManualClock::new());
        let sleeper = Arc::new(ClockSleeper {
            clock: clock.clone(),
            slept: Mutex::new(Vec::new()),
        });
        let governor = Governor::with_runtime(
            GovernorConfig {
                rpm_limit: 1,
                max_admission_wait: Duration::from_secs(60),
                ..GovernorConfig::default()
            },
            clock.clone(),
            sleeper.clone(),
        );
        governor.admit("alice");
        clock.advance(Duration::from_secs(45));

        let result = governor
            .execute("alice", |_| async { Ok::<_, UpstreamError>("late") })
            .await
            .unwrap();

        assert_eq!(result.value, "late");
        assert_eq!(result.usage.minute_used, 1);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_secs(15)]);
    }

    #[test]
    fn reset_hooks_forget_usage() {
        let (governor, _, _) = build(config(1, 250));
        governor.admit("alice");
        governor.admit("bob");
        assert!(!governor.admit("alice").is_admitted());

        assert!(governor.reset_key("alice"));
        assert!(governor.admit("alice").is_admitted());

        governor.reset();
        assert_eq!(governor.tracked_keys(), 0);
    }
}
