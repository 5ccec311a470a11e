//! Per-user, per-tier request admission
//!
//! Three fixed windows (minute, hour, day) bucketed by calendar boundary plus a
//! 10-second sliding burst log, all kept in the shared `CacheStore`. The
//! limiter fails open: any lookup or store error admits the request.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use crate::{
    db::CacheStore,
    error::AppResult,
    services::quality_cache::namespaces,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Enterprise,
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("Unknown tier: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    /// Requests allowed inside the sliding burst window
    pub burst: u32,
}

impl TierLimits {
    fn for_window(&self, window: RateWindow) -> u32 {
        match window {
            RateWindow::Minute => self.per_minute,
            RateWindow::Hour => self.per_hour,
            RateWindow::Day => self.per_day,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    pub const ALL: [RateWindow; 3] = [RateWindow::Minute, RateWindow::Hour, RateWindow::Day];

    fn span(&self) -> ChronoDuration {
        match self {
            RateWindow::Minute => ChronoDuration::minutes(1),
            RateWindow::Hour => ChronoDuration::hours(1),
            RateWindow::Day => ChronoDuration::days(1),
        }
    }

    /// Calendar bucket containing `now`, e.g. `2025-01-31-23-59` for a minute
    pub fn bucket_key(&self, now: DateTime<Utc>) -> String {
        let format = match self {
            RateWindow::Minute => "%Y-%m-%d-%H-%M",
            RateWindow::Hour => "%Y-%m-%d-%H",
            RateWindow::Day => "%Y-%m-%d",
        };
        now.format(format).to_string()
    }

    /// Start of the next bucket
    pub fn reset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = now.duration_trunc(self.span()).unwrap_or(now);
        start + self.span()
    }
}

impl Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RateWindow::Minute => "minute",
            RateWindow::Hour => "hour",
            RateWindow::Day => "day",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// False when no limit applied (fail-open or unlimited development user)
    pub enforced: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitStatus {
    fn unenforced(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            enforced: false,
            limit: 0,
            remaining: 0,
            reset_time: RateWindow::Minute.reset_at(now),
            retry_after: None,
        }
    }
}

/// Resolves a user's service tier
#[async_trait::async_trait]
pub trait TierDirectory: Send + Sync {
    /// `Ok(None)` for unknown users
    async fn tier_for(&self, user_id: &str) -> AppResult<Option<Tier>>;
}

/// Tier directory built from configuration (`alice:premium,bob:enterprise`)
#[derive(Debug, Clone, Default)]
pub struct StaticTierDirectory {
    tiers: HashMap<String, Tier>,
}

impl StaticTierDirectory {
    pub fn new(tiers: HashMap<String, Tier>) -> Self {
        Self { tiers }
    }

    /// Parses `user:tier` pairs; malformed entries are skipped with a warning
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut tiers = HashMap::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((user, tier)) => match tier.parse::<Tier>() {
                    Ok(tier) => {
                        tiers.insert(user.trim().to_string(), tier);
                    }
                    Err(e) => tracing::warn!(entry, error = %e, "Skipping user tier entry"),
                },
                None => tracing::warn!(entry, "Skipping malformed user tier entry"),
            }
        }
        Self { tiers }
    }
}

#[async_trait::async_trait]
impl TierDirectory for StaticTierDirectory {
    async fn tier_for(&self, user_id: &str) -> AppResult<Option<Tier>> {
        Ok(self.tiers.get(user_id).copied())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterSettings {
    /// In production unknown users get the free tier; otherwise they pass unchecked
    pub production: bool,
    pub free: TierLimits,
    pub premium: TierLimits,
    pub enterprise: TierLimits,
    pub burst_window: ChronoDuration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            production: false,
            free: TierLimits {
                per_minute: 10,
                per_hour: 100,
                per_day: 500,
                burst: 5,
            },
            premium: TierLimits {
                per_minute: 60,
                per_hour: 1_000,
                per_day: 10_000,
                burst: 15,
            },
            enterprise: TierLimits {
                per_minute: 300,
                per_hour: 10_000,
                per_day: 100_000,
                burst: 50,
            },
            burst_window: ChronoDuration::seconds(10),
        }
    }
}

impl RateLimiterSettings {
    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Free => self.free,
            Tier::Premium => self.premium,
            Tier::Enterprise => self.enterprise,
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    directory: Arc<dyn TierDirectory>,
    settings: RateLimiterSettings,
}

fn counter_key(user_id: &str, endpoint: &str, window: RateWindow, now: DateTime<Utc>) -> String {
    format!("{}:{}:{}:{}", user_id, endpoint, window, window.bucket_key(now))
}

fn burst_key(user_id: &str, endpoint: &str) -> String {
    format!("{}:{}", user_id, endpoint)
}

/// Whole seconds from `now` until `until`, at least 1
fn seconds_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CacheStore>,
        directory: Arc<dyn TierDirectory>,
        settings: RateLimiterSettings,
    ) -> Self {
        Self {
            store,
            directory,
            settings,
        }
    }

    pub async fn check_limit(&self, user_id: &str, endpoint: &str) -> RateLimitStatus {
        self.check_limit_at(user_id, endpoint, Utc::now()).await
    }

    /// Admission check against an explicit clock
    pub async fn check_limit_at(&self, user_id: &str, endpoint: &str, now: DateTime<Utc>) -> RateLimitStatus {
        let limits = match self.resolve_limits(user_id).await {
            Ok(Some(limits)) => limits,
            Ok(None) => return RateLimitStatus::unenforced(now),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Tier lookup failed, failing open");
                return RateLimitStatus::unenforced(now);
            }
        };

        match self.evaluate(user_id, endpoint, limits, now).await {
            Ok(status) => {
                if !status.allowed {
                    tracing::info!(
                        user_id,
                        endpoint,
                        retry_after = status.retry_after,
                        "Rate limit exceeded"
                    );
                }
                status
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Rate limit check failed, failing open");
                RateLimitStatus::unenforced(now)
            }
        }
    }

    pub async fn record_request(&self, user_id: &str, endpoint: &str) {
        self.record_request_at(user_id, endpoint, Utc::now()).await
    }

    /// Counts one request in every window and the burst log. Never fails.
    pub async fn record_request_at(&self, user_id: &str, endpoint: &str, now: DateTime<Utc>) {
        match self.resolve_limits(user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Tier lookup failed, request not recorded");
                return;
            }
        }

        for window in RateWindow::ALL {
            let ttl = seconds_until(now, window.reset_at(now)) + 1;
            let key = counter_key(user_id, endpoint, window, now);
            if let Err(e) = self.store.increment(namespaces::RATE_LIMIT, &key, ttl).await {
                tracing::warn!(user_id, %window, error = %e, "Failed to record request");
            }
        }

        if let Err(e) = self.push_burst(user_id, endpoint, now).await {
            tracing::warn!(user_id, error = %e, "Failed to record burst timestamp");
        }
    }

    /// Administrative reset of the current buckets and burst log
    pub async fn reset(&self, user_id: &str, endpoint: &str) -> AppResult<()> {
        self.reset_at(user_id, endpoint, Utc::now()).await
    }

    pub async fn reset_at(&self, user_id: &str, endpoint: &str, now: DateTime<Utc>) -> AppResult<()> {
        for window in RateWindow::ALL {
            self.store
                .delete(namespaces::RATE_LIMIT, &counter_key(user_id, endpoint, window, now))
                .await?;
        }
        self.store
            .delete(namespaces::BURST, &burst_key(user_id, endpoint))
            .await?;
        tracing::info!(user_id, endpoint, "Rate limit counters reset");
        Ok(())
    }

    /// `None` means the user is not limited at all
    async fn resolve_limits(&self, user_id: &str) -> AppResult<Option<TierLimits>> {
        match self.directory.tier_for(user_id).await? {
            Some(tier) => Ok(Some(self.settings.limits_for(tier))),
            None if self.settings.production => Ok(Some(self.settings.limits_for(Tier::Free))),
            None => Ok(None),
        }
    }

    async fn evaluate(
        &self,
        user_id: &str,
        endpoint: &str,
        limits: TierLimits,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitStatus> {
        // (limit, remaining, reset) of the window with the least headroom
        let mut tightest: Option<(u32, u32, DateTime<Utc>)> = None;
        let mut blocked_until: Option<DateTime<Utc>> = None;

        for window in RateWindow::ALL {
            let limit = limits.for_window(window);
            let count = self
                .read_counter(&counter_key(user_id, endpoint, window, now))
                .await?;
            let remaining = limit.saturating_sub(count);
            let reset = window.reset_at(now);

            if count >= limit {
                blocked_until = Some(blocked_until.map_or(reset, |b| b.max(reset)));
            }
            if tightest.map_or(true, |(_, r, _)| remaining < r) {
                tightest = Some((limit, remaining, reset));
            }
        }

        let (limit, remaining, reset_time) =
            tightest.unwrap_or((0, 0, RateWindow::Minute.reset_at(now)));
        let mut retry_after = blocked_until.map(|until| seconds_until(now, until));

        let burst = self.read_burst(user_id, endpoint, now).await?;
        if burst.len() as u64 >= limits.burst as u64 {
            let oldest = burst
                .first()
                .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(*ms))
                .unwrap_or(now);
            let burst_retry = seconds_until(now, oldest + self.settings.burst_window);
            retry_after = Some(retry_after.map_or(burst_retry, |r| r.max(burst_retry)));
        }

        Ok(RateLimitStatus {
            allowed: retry_after.is_none(),
            enforced: true,
            limit,
            remaining,
            reset_time,
            retry_after,
        })
    }

    async fn read_counter(&self, key: &str) -> AppResult<u32> {
        let raw = self.store.get(namespaces::RATE_LIMIT, key).await?;
        Ok(raw
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|count| count.min(u32::MAX as u64) as u32)
            .unwrap_or(0))
    }

    /// Burst timestamps (epoch millis) inside the window, oldest first
    async fn read_burst(&self, user_id: &str, endpoint: &str, now: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let raw = self
            .store
            .get(namespaces::BURST, &burst_key(user_id, endpoint))
            .await?;
        let mut timestamps: Vec<i64> = match raw {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => Vec::new(),
        };

        let window_start = (now - self.settings.burst_window).timestamp_millis();
        let now_ms = now.timestamp_millis();
        timestamps.retain(|ts| *ts > window_start && *ts <= now_ms);
        timestamps.sort_unstable();
        Ok(timestamps)
    }

    async fn push_burst(&self, user_id: &str, endpoint: &str, now: DateTime<Utc>) -> AppResult<()> {
        let mut timestamps = self.read_burst(user_id, endpoint, now).await?;
        timestamps.push(now.timestamp_millis());

        let ttl = self.settings.burst_window.num_seconds().max(1) as u64 + 1;
        self.store
            .set(
                namespaces::BURST,
                &burst_key(user_id, endpoint),
                serde_json::to_string(&timestamps)?,
                ttl,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::AppError;
    use chrono::TimeZone;

    struct FailingDirectory;

    #[async_trait::async_trait]
    impl TierDirectory for FailingDirectory {
        async fn tier_for(&self, _: &str) -> AppResult<Option<Tier>> {
            Err(AppError::Internal("profile service down".into()))
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, s).unwrap()
    }

    fn limiter_with(limits: TierLimits, production: bool) -> RateLimiter {
        let directory = StaticTierDirectory::from_entries(&["alice:free", "bob:premium"]);
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Arc::new(directory),
            RateLimiterSettings {
                production,
                free: limits,
                ..RateLimiterSettings::default()
            },
        )
    }

    #[test]
    fn test_bucket_keys_follow_calendar_boundaries() {
        let now = at(23, 59, 42);
        assert_eq!(RateWindow::Minute.bucket_key(now), "2025-03-14-23-59");
        assert_eq!(RateWindow::Hour.bucket_key(now), "2025-03-14-23");
        assert_eq!(RateWindow::Day.bucket_key(now), "2025-03-14");
        assert_eq!(RateWindow::Minute.reset_at(now), Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap());
        assert_eq!(RateWindow::Hour.reset_at(at(10, 15, 0)), at(11, 0, 0));
    }

    #[test]
    fn test_static_directory_parsing() {
        let directory = StaticTierDirectory::from_entries(&["a:premium", "broken", "b:gold", " c : Enterprise "]);
        assert_eq!(directory.tiers.get("a"), Some(&Tier::Premium));
        assert_eq!(directory.tiers.get("c"), Some(&Tier::Enterprise));
        assert_eq!(directory.tiers.len(), 2);
    }

    #[tokio::test]
    async fn test_minute_limit_blocks_eleventh_request_until_boundary() {
        let limiter = limiter_with(
            TierLimits {
                per_minute: 10,
                per_hour: 1_000,
                per_day: 10_000,
                burst: 1_000,
            },
            true,
        );

        for second in 0..10 {
            let now = at(12, 30, second * 5);
            assert!(limiter.check_limit_at("alice", "recs", now).await.allowed);
            limiter.record_request_at("alice", "recs", now).await;
        }

        let status = limiter.check_limit_at("alice", "recs", at(12, 30, 55)).await;
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.limit, 10);
        assert_eq!(status.retry_after, Some(5));

        let next_minute = limiter.check_limit_at("alice", "recs", at(12, 31, 0)).await;
        assert!(next_minute.allowed);
        assert_eq!(next_minute.remaining, 10);
    }

    #[tokio::test]
    async fn test_burst_limit_vetoes_even_when_windows_allow() {
        let limiter = limiter_with(
            TierLimits {
                per_minute: 100,
                per_hour: 1_000,
                per_day: 10_000,
                burst: 15,
            },
            true,
        );

        let start = at(9, 0, 0);
        for i in 0..15 {
            limiter
                .record_request_at("alice", "recs", start + ChronoDuration::milliseconds(i * 300))
                .await;
        }

        let now = start + ChronoDuration::seconds(6);
        let status = limiter.check_limit_at("alice", "recs", now).await;
        assert!(!status.allowed);
        assert!(status.remaining > 0);
        assert_eq!(status.retry_after, Some(4));

        // the oldest timestamps have left the sliding window
        let later = start + ChronoDuration::milliseconds(10_500);
        assert!(limiter.check_limit_at("alice", "recs", later).await.allowed);
    }

    #[tokio::test]
    async fn test_most_restrictive_window_reported() {
        let limiter = limiter_with(
            TierLimits {
                per_minute: 50,
                per_hour: 3,
                per_day: 100,
                burst: 100,
            },
            true,
        );
        let now = at(8, 0, 0);
        limiter.record_request_at("alice", "recs", now).await;

        let status = limiter.check_limit_at("alice", "recs", now).await;
        assert!(status.allowed);
        assert_eq!(status.limit, 3);
        assert_eq!(status.remaining, 2);
        assert_eq!(status.reset_time, at(9, 0, 0));
    }

    #[tokio::test]
    async fn test_unknown_user_in_development_is_unlimited() {
        let limiter = limiter_with(RateLimiterSettings::default().free, false);
        let status = limiter.check_limit("stranger", "recs").await;
        assert!(status.allowed);
        assert!(!status.enforced);
    }

    #[tokio::test]
    async fn test_unknown_user_in_production_gets_free_tier() {
        let limiter = limiter_with(
            TierLimits {
                per_minute: 1,
                per_hour: 10,
                per_day: 10,
                burst: 10,
            },
            true,
        );
        let now = at(7, 0, 0);
        limiter.record_request_at("stranger", "recs", now).await;
        let status = limiter.check_limit_at("stranger", "recs", now).await;
        assert!(status.enforced);
        assert!(!status.allowed);
    }

    #[tokio::test]
    async fn test_directory_failure_fails_open() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FailingDirectory),
            RateLimiterSettings {
                production: true,
                ..RateLimiterSettings::default()
            },
        );
        let status = limiter.check_limit("alice", "recs").await;
        assert!(status.allowed);
        assert!(!status.enforced);
        // recording must not panic or propagate
        limiter.record_request("alice", "recs").await;
    }

    #[tokio::test]
    async fn test_reset_clears_current_counters() {
        let limiter = limiter_with(
            TierLimits {
                per_minute: 1,
                per_hour: 10,
                per_day: 10,
                burst: 10,
            },
            true,
        );
        let now = at(16, 20, 0);
        limiter.record_request_at("alice", "recs", now).await;
        assert!(!limiter.check_limit_at("alice", "recs", now).await.allowed);

        limiter.reset_at("alice", "recs", now).await.unwrap();
        assert!(limiter.check_limit_at("alice", "recs", now).await.allowed);
    }

    #[test]
    fn test_seconds_until_rounds_up() {
        let now = at(0, 0, 0);
        assert_eq!(seconds_until(now, now + ChronoDuration::milliseconds(1_200)), 2);
        assert_eq!(seconds_until(now, now), 1);
    }
}
