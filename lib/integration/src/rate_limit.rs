//! Rate limiting for integration requests.
//!
//! Respects external API constraints by limiting request rates per key. Keys
//! are opaque; the manager uses `"{integration_id}"` or
//! `"{integration_id}:{user_id}"`.

use crate::clock::{Clock, saturating_add, saturating_sub, system_clock};
use crate::store::{self, DEFAULT_MAX_ATTEMPTS, MemoryStore, StateStore};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Windowing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    /// Counter that resets at the end of every window.
    #[default]
    Fixed,
    /// Weighted blend of the previous and current window.
    Sliding,
    /// Continuously refilling bucket.
    TokenBucket,
}

/// Rate limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration in milliseconds.
    pub window_ms: u64,
    /// Windowing strategy.
    #[serde(default)]
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    /// Creates a new rate limit configuration.
    #[must_use]
    pub fn new(max_requests: u32, window_ms: u64, strategy: RateLimitStrategy) -> Self {
        Self {
            max_requests,
            window_ms,
            strategy,
        }
    }

    /// Fixed-window limit of `max_requests` per minute.
    #[must_use]
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, 60_000, RateLimitStrategy::Fixed)
    }

    /// Fixed-window limit of `max_requests` per hour.
    #[must_use]
    pub fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, 3_600_000, RateLimitStrategy::Fixed)
    }

    /// Returns the window as a duration, capped at [`TimeDelta::MAX`].
    #[must_use]
    pub fn window(&self) -> TimeDelta {
        i64::try_from(self.window_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Runtime state for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    /// Requests admitted in the current window.
    pub count: u32,
    /// End of the current window.
    pub reset_at: DateTime<Utc>,
    /// Banked tokens (token bucket).
    #[serde(default)]
    pub tokens: Option<f64>,
    /// Requests admitted in the window before the current one (sliding).
    #[serde(default)]
    pub previous_count: u32,
    /// Time tokens were last credited (token bucket).
    #[serde(default)]
    pub last_refill: Option<DateTime<Utc>>,
}

impl RateLimitEntry {
    fn fresh(config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            reset_at: saturating_add(now, config.window()),
            tokens: Some(f64::from(config.max_requests.saturating_sub(1))),
            previous_count: 0,
            last_refill: Some(now),
        }
    }
}

/// A rate limiter for integration requests.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn StateStore<RateLimitEntry>>,
    scope: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a rate limiter with its own in-memory state.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), "rate_limit/")
    }

    /// Creates a rate limiter over a (possibly shared) store.
    ///
    /// Every key is stored under `scope`, and [`reset_all`](Self::reset_all)
    /// only clears keys under it.
    #[must_use]
    pub fn with_store(
        config: RateLimitConfig,
        store: Arc<dyn StateStore<RateLimitEntry>>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            config,
            store,
            scope: scope.into(),
            clock: system_clock(),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the current configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{key}", self.scope)
    }

    /// Checks if a request is allowed for the given key and records it if so.
    ///
    /// If the state store is unavailable the request is admitted.
    pub async fn check_limit(&self, key: &str) -> bool {
        if self.config.max_requests == 0 || self.config.window_ms == 0 {
            return self.config.max_requests > 0;
        }

        let now = self.clock.now();
        let config = &self.config;
        let result = store::update(
            self.store.as_ref(),
            &self.store_key(key),
            DEFAULT_MAX_ATTEMPTS,
            |entry| admit(config, entry, now),
        )
        .await;

        match result {
            Ok(allowed) => {
                debug!(key, allowed, strategy = ?config.strategy, "rate limit check");
                allowed
            }
            Err(report) => {
                warn!(key, error = %report, "rate limit state unavailable, admitting request");
                true
            }
        }
    }

    /// Returns how many requests the key could make right now.
    pub async fn get_remaining_requests(&self, key: &str) -> u32 {
        let max = self.config.max_requests;
        let entry = match self.store.get(&self.store_key(key)).await {
            Ok(Some(versioned)) => versioned.value,
            Ok(None) => return max,
            Err(report) => {
                warn!(key, error = %report, "rate limit state unavailable");
                return max;
            }
        };

        let now = self.clock.now();
        match self.config.strategy {
            RateLimitStrategy::Fixed => {
                if now >= entry.reset_at {
                    max
                } else {
                    max.saturating_sub(entry.count)
                }
            }
            RateLimitStrategy::Sliding => match roll_sliding(&self.config, entry, now) {
                Some(entry) => {
                    let effective = sliding_effective(&self.config, &entry, now);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let used = effective.ceil().max(0.0) as u32;
                    max.saturating_sub(used)
                }
                None => max,
            },
            RateLimitStrategy::TokenBucket => {
                if now >= entry.reset_at {
                    max
                } else {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let tokens = refill(&self.config, &entry, now).floor().max(0.0) as u32;
                    tokens
                }
            }
        }
    }

    /// Returns when the key's current window ends, if it has state.
    pub async fn get_reset_time(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.store.get(&self.store_key(key)).await {
            Ok(entry) => entry.map(|e| e.value.reset_at),
            Err(report) => {
                warn!(key, error = %report, "rate limit state unavailable");
                None
            }
        }
    }

    /// Resets the rate limit for a key.
    pub async fn reset(&self, key: &str) {
        if let Err(report) = self.store.remove(&self.store_key(key)).await {
            warn!(key, error = %report, "failed to reset rate limit state");
        }
    }

    /// Resets every key of this limiter.
    pub async fn reset_all(&self) {
        if let Err(report) = self.store.clear_prefix(&self.scope).await {
            warn!(scope = %self.scope, error = %report, "failed to clear rate limit state");
        }
    }
}

/// Decides admission and produces the entry to store.
fn admit(
    config: &RateLimitConfig,
    entry: Option<RateLimitEntry>,
    now: DateTime<Utc>,
) -> (RateLimitEntry, bool) {
    let Some(mut entry) = entry else {
        return (RateLimitEntry::fresh(config, now), true);
    };

    match config.strategy {
        RateLimitStrategy::Fixed => {
            if now >= entry.reset_at {
                return (RateLimitEntry::fresh(config, now), true);
            }
            if entry.count < config.max_requests {
                entry.count += 1;
                return (entry, true);
            }
            (entry, false)
        }
        RateLimitStrategy::Sliding => {
            let Some(mut entry) = roll_sliding(config, entry, now) else {
                return (RateLimitEntry::fresh(config, now), true);
            };
            if sliding_effective(config, &entry, now) < f64::from(config.max_requests) {
                entry.count += 1;
                return (entry, true);
            }
            (entry, false)
        }
        RateLimitStrategy::TokenBucket => {
            if now >= entry.reset_at {
                return (RateLimitEntry::fresh(config, now), true);
            }
            let tokens = refill(config, &entry, now);
            entry.last_refill = Some(now);
            if tokens >= 1.0 {
                entry.tokens = Some(tokens - 1.0);
                entry.count = entry.count.saturating_add(1);
                entry.reset_at = saturating_add(now, config.window());
                return (entry, true);
            }
            entry.tokens = Some(tokens);
            (entry, false)
        }
    }
}

/// Moves a sliding entry into the window containing `now`.
///
/// Returns `None` when at least one whole window passed without requests,
/// in which case nothing carries over.
fn roll_sliding(
    config: &RateLimitConfig,
    mut entry: RateLimitEntry,
    now: DateTime<Utc>,
) -> Option<RateLimitEntry> {
    if now < entry.reset_at {
        return Some(entry);
    }
    let next_reset = saturating_add(entry.reset_at, config.window());
    if now >= next_reset {
        return None;
    }
    entry.previous_count = entry.count;
    entry.count = 0;
    entry.reset_at = next_reset;
    Some(entry)
}

/// Previous window weighted by how much of it still overlaps the sliding
/// window, plus the current window's count.
#[allow(clippy::cast_precision_loss)]
fn sliding_effective(config: &RateLimitConfig, entry: &RateLimitEntry, now: DateTime<Utc>) -> f64 {
    let window_start = saturating_sub(entry.reset_at, config.window());
    let elapsed = (now - window_start).num_milliseconds().max(0) as f64;
    let progress = (elapsed / config.window_ms as f64).min(1.0);
    f64::from(entry.previous_count) * (1.0 - progress) + f64::from(entry.count)
}

/// Tokens available at `now`, capped at `max_requests`.
#[allow(clippy::cast_precision_loss)]
fn refill(config: &RateLimitConfig, entry: &RateLimitEntry, now: DateTime<Utc>) -> f64 {
    let max = f64::from(config.max_requests);
    let since = entry
        .last_refill
        .unwrap_or_else(|| saturating_sub(entry.reset_at, config.window()));
    let elapsed = (now - since).num_milliseconds().max(0) as f64;
    let credited = elapsed * max / config.window_ms as f64;
    (entry.tokens.unwrap_or(0.0) + credited).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::new(config).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[tokio::test]
    async fn fixed_window_blocks_fourth_request_until_window_passes() {
        let (limiter, clock) = limiter(RateLimitConfig::new(3, 1000, RateLimitStrategy::Fixed));

        for _ in 0..3 {
            assert!(limiter.check_limit("test").await);
        }
        assert!(!limiter.check_limit("test").await);
        assert_eq!(limiter.get_remaining_requests("test").await, 0);

        clock.advance(Duration::milliseconds(999));
        assert!(!limiter.check_limit("test").await);

        clock.advance(Duration::milliseconds(1));
        assert!(limiter.check_limit("test").await);
        assert_eq!(limiter.get_remaining_requests("test").await, 2);
    }

    #[tokio::test]
    async fn remaining_requests_counts_down() {
        let (limiter, _clock) = limiter(RateLimitConfig::per_minute(10));

        assert_eq!(limiter.get_remaining_requests("test").await, 10);
        for i in 0..10 {
            assert!(limiter.check_limit("test").await);
            assert_eq!(limiter.get_remaining_requests("test").await, 10 - i - 1);
        }
    }

    #[tokio::test]
    async fn per_key_isolation() {
        let (limiter, _clock) = limiter(RateLimitConfig::per_minute(2));

        assert!(limiter.check_limit("gmail:alice").await);
        assert!(limiter.check_limit("gmail:alice").await);
        assert!(!limiter.check_limit("gmail:alice").await);

        assert!(limiter.check_limit("gmail:bob").await);
        assert_eq!(limiter.get_remaining_requests("gmail:bob").await, 1);
    }

    #[tokio::test]
    async fn reset_clears_key() {
        let (limiter, _clock) = limiter(RateLimitConfig::per_minute(1));

        assert!(limiter.check_limit("a").await);
        assert!(limiter.check_limit("b").await);
        assert!(!limiter.check_limit("a").await);

        limiter.reset("a").await;
        assert!(limiter.check_limit("a").await);
        assert!(!limiter.check_limit("b").await);

        limiter.reset_all().await;
        assert!(limiter.get_reset_time("a").await.is_none());
        assert!(limiter.check_limit("b").await);
    }

    #[tokio::test]
    async fn reset_time_is_end_of_window() {
        let (limiter, clock) = limiter(RateLimitConfig::new(5, 1000, RateLimitStrategy::Fixed));
        let start = clock.now();

        assert!(limiter.get_reset_time("k").await.is_none());
        limiter.check_limit("k").await;
        assert_eq!(
            limiter.get_reset_time("k").await,
            Some(start + Duration::milliseconds(1000))
        );
    }

    #[tokio::test]
    async fn token_bucket_refills_one_token_per_interval() {
        let (limiter, clock) =
            limiter(RateLimitConfig::new(4, 1000, RateLimitStrategy::TokenBucket));

        for _ in 0..4 {
            assert!(limiter.check_limit("bucket").await);
        }
        assert!(!limiter.check_limit("bucket").await);

        clock.advance(Duration::milliseconds(250));
        assert!(limiter.check_limit("bucket").await);
        assert!(!limiter.check_limit("bucket").await);
    }

    #[tokio::test]
    async fn token_bucket_never_banks_more_than_max() {
        let (limiter, clock) =
            limiter(RateLimitConfig::new(3, 1000, RateLimitStrategy::TokenBucket));

        assert!(limiter.check_limit("bucket").await);
        clock.advance(Duration::milliseconds(900));
        assert_eq!(limiter.get_remaining_requests("bucket").await, 3);

        for _ in 0..3 {
            assert!(limiter.check_limit("bucket").await);
        }
        assert!(!limiter.check_limit("bucket").await);
    }

    #[tokio::test]
    async fn sliding_window_carries_previous_window() {
        let (limiter, clock) = limiter(RateLimitConfig::new(10, 1000, RateLimitStrategy::Sliding));

        for _ in 0..10 {
            assert!(limiter.check_limit("slide").await);
        }
        assert!(!limiter.check_limit("slide").await);

        // Start of the next window: the previous window still weighs fully.
        clock.advance(Duration::milliseconds(1000));
        assert!(!limiter.check_limit("slide").await);

        // Halfway through, half of the previous window has slid out.
        clock.advance(Duration::milliseconds(500));
        let mut admitted = 0;
        for _ in 0..20 {
            if limiter.check_limit("slide").await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn sliding_window_never_exceeds_max_at_window_start() {
        let (limiter, clock) = limiter(RateLimitConfig::new(4, 1000, RateLimitStrategy::Sliding));

        assert!(limiter.check_limit("slide").await);
        clock.advance(Duration::milliseconds(1));
        let mut admitted = 1;
        for _ in 0..20 {
            if limiter.check_limit("slide").await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 4);
    }

    #[tokio::test]
    async fn sliding_window_forgets_after_idle_window() {
        let (limiter, clock) = limiter(RateLimitConfig::new(2, 1000, RateLimitStrategy::Sliding));

        assert!(limiter.check_limit("slide").await);
        assert!(limiter.check_limit("slide").await);
        clock.advance(Duration::milliseconds(2500));

        assert_eq!(limiter.get_remaining_requests("slide").await, 2);
        assert!(limiter.check_limit("slide").await);
        assert!(limiter.check_limit("slide").await);
        assert!(!limiter.check_limit("slide").await);
    }

    #[tokio::test]
    async fn zero_max_requests_denies_everything() {
        let (limiter, _clock) = limiter(RateLimitConfig::new(0, 1000, RateLimitStrategy::Fixed));
        assert!(!limiter.check_limit("k").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_max() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_minute(10)));

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check_limit("shared").await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("task") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn unbounded_window_does_not_overflow() {
        for strategy in [
            RateLimitStrategy::Fixed,
            RateLimitStrategy::Sliding,
            RateLimitStrategy::TokenBucket,
        ] {
            let (limiter, _) = limiter(RateLimitConfig::new(2, u64::MAX, strategy));

            assert!(limiter.check_limit("k").await, "{strategy:?}");
            assert!(limiter.check_limit("k").await, "{strategy:?}");
            assert!(!limiter.check_limit("k").await, "{strategy:?}");
            assert_eq!(limiter.get_remaining_requests("k").await, 0, "{strategy:?}");
            assert_eq!(
                limiter.get_reset_time("k").await,
                Some(DateTime::<Utc>::MAX_UTC),
                "{strategy:?}"
            );
        }
        assert_eq!(
            RateLimitConfig::new(1, u64::MAX, RateLimitStrategy::Fixed).window(),
            TimeDelta::MAX
        );
    }

    #[test]
    fn strategy_serde_names() {
        let json = serde_json::to_string(&RateLimitStrategy::TokenBucket).expect("serialize");
        assert_eq!(json, "\"token-bucket\"");
        let parsed: RateLimitStrategy = serde_json::from_str("\"sliding\"").expect("deserialize");
        assert_eq!(parsed, RateLimitStrategy::Sliding);
    }

    #[test]
    fn config_presets() {
        let per_minute = RateLimitConfig::per_minute(100);
        assert_eq!(per_minute.max_requests, 100);
        assert_eq!(per_minute.window_ms, 60_000);
        assert_eq!(per_minute.strategy, RateLimitStrategy::Fixed);

        assert_eq!(RateLimitConfig::per_hour(1000).window_ms, 3_600_000);
    }
}
