use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
pub const DAY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

// Usage record - tracks admitted requests per API key
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub minute_window_start: Instant,
    pub minute_count: u32,
    pub day_window_start: Instant,
    pub day_count: u32,
}

impl UsageRecord {
    pub fn new(now: Instant) -> Self {
        Self {
            minute_window_start: now,
            minute_count: 0,
            day_window_start: now,
            day_count: 0,
        }
    }

    // Expired windows restart at `now`; no background timer does this
    fn roll_windows(&mut self, now: Instant) {
        if now.duration_since(self.minute_window_start) >= MINUTE_WINDOW {
            self.minute_window_start = now;
            self.minute_count = 0;
        }
        if now.duration_since(self.day_window_start) >= DAY_WINDOW {
            self.day_window_start = now;
            self.day_count = 0;
        }
    }

    fn minute_resets_in(&self, now: Instant) -> Duration {
        MINUTE_WINDOW.saturating_sub(now.duration_since(self.minute_window_start))
    }

    fn day_resets_in(&self, now: Instant) -> Duration {
        DAY_WINDOW.saturating_sub(now.duration_since(self.day_window_start))
    }

    fn snapshot(&self, limits: Limits, now: Instant) -> UsageSnapshot {
        UsageSnapshot {
            minute_used: self.minute_count,
            minute_limit: limits.rpm,
            minute_remaining: limits.rpm.saturating_sub(self.minute_count),
            day_used: self.day_count,
            day_limit: limits.rpd,
            day_remaining: limits.rpd.saturating_sub(self.day_count),
            minute_resets_in_secs: ceil_secs(self.minute_resets_in(now)),
            day_resets_in_secs: ceil_secs(self.day_resets_in(now)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub rpm: u32,
    pub rpd: u32,
}

/// Point-in-time view of one key's quota, safe to hand to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub minute_used: u32,
    pub minute_limit: u32,
    pub minute_remaining: u32,
    pub day_used: u32,
    pub day_limit: u32,
    pub day_remaining: u32,
    pub minute_resets_in_secs: u64,
    pub day_resets_in_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MinuteQuotaExceeded,
    DayQuotaExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MinuteQuotaExceeded => "minute_quota_exceeded",
            RejectReason::DayQuotaExceeded => "day_quota_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitResult {
    Admitted {
        usage: UsageSnapshot,
    },
    Rejected {
        reason: RejectReason,
        retry_after: Duration,
        usage: UsageSnapshot,
    },
}

impl AdmitResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmitResult::Admitted { .. })
    }

    pub fn usage(&self) -> &UsageSnapshot {
        match self {
            AdmitResult::Admitted { usage } | AdmitResult::Rejected { usage, .. } => usage,
        }
    }
}

/// Key -> record map.
///
/// `DashMap::entry` holds the shard write lock while the returned guard
/// lives, so check-and-increment for one key is a single critical section.
/// Guards are never held across an `.await`.
#[derive(Debug, Default)]
pub struct UsageStore {
    records: DashMap<String, UsageRecord>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, key: &str, limits: Limits, now: Instant) -> AdmitResult {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| UsageRecord::new(now));

        record.roll_windows(now);

        // Minute quota is checked first; a key at both limits reports the minute one
        if record.minute_count >= limits.rpm {
            return AdmitResult::Rejected {
                reason: RejectReason::MinuteQuotaExceeded,
                retry_after: record.minute_resets_in(now),
                usage: record.snapshot(limits, now),
            };
        }
        if record.day_count >= limits.rpd {
            return AdmitResult::Rejected {
                reason: RejectReason::DayQuotaExceeded,
                retry_after: record.day_resets_in(now),
                usage: record.snapshot(limits, now),
            };
        }

        record.minute_count += 1;
        record.day_count += 1;
        AdmitResult::Admitted {
            usage: record.snapshot(limits, now),
        }
    }

    pub fn usage(&self, key: &str, limits: Limits, now: Instant) -> UsageSnapshot {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| UsageRecord::new(now));

        record.roll_windows(now);
        record.snapshot(limits, now)
    }

    pub fn get(&self, key: &str) -> Option<UsageRecord> {
        self.records.get(key).map(|record| record.value().clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// Whole seconds, rounded up, for Retry-After style fields
pub fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
