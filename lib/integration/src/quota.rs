//! Long-horizon usage quotas.
//!
//! Quotas cap total usage per day, per month or per user, independently of
//! short-window rate limiting. Usage resets automatically once its reset time
//! passes. All boundaries are computed in UTC.

use crate::clock::{Clock, saturating_add, system_clock};
use crate::error::StoreError;
use crate::store::{self, DEFAULT_MAX_ATTEMPTS, MemoryStore, StateStore};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Quota ceilings. Unset ceilings do not apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum usage per UTC day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<u64>,
    /// Maximum usage per UTC calendar month.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<u64>,
    /// Maximum usage per user, checked when a user id is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_user: Option<u64>,
}

impl QuotaConfig {
    /// Daily ceiling only.
    #[must_use]
    pub fn daily(limit: u64) -> Self {
        Self {
            daily: Some(limit),
            ..Self::default()
        }
    }

    /// Monthly ceiling only.
    #[must_use]
    pub fn monthly(limit: u64) -> Self {
        Self {
            monthly: Some(limit),
            ..Self::default()
        }
    }

    /// Adds a per-user ceiling.
    #[must_use]
    pub fn with_per_user(mut self, limit: u64) -> Self {
        self.per_user = Some(limit);
        self
    }

    /// The tightest ceiling that applies.
    fn limit_for(&self, has_user: bool) -> Option<u64> {
        [
            self.daily,
            self.monthly,
            if has_user { self.per_user } else { None },
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// When usage started at `now` resets.
    fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.daily.is_none() && self.monthly.is_some() {
            first_of_next_month(now)
        } else {
            next_midnight(now)
        }
    }
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .succ_opt()
        .map_or_else(
            || saturating_add(now, Duration::days(1)),
            |d| d.and_time(NaiveTime::MIN).and_utc(),
        )
}

fn first_of_next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map_or_else(|| next_midnight(now), |d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Usage accounting for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationUsage {
    /// Integration the usage belongs to.
    pub integration_id: String,
    /// User the usage belongs to, if tracked per user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Number of recorded requests.
    pub request_count: u64,
    /// Quota units consumed.
    pub quota_used: u64,
    /// Units left under the tightest ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_remaining: Option<u64>,
    /// When usage resets.
    pub reset_at: DateTime<Utc>,
    /// Last recorded request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Quota accounting for one integration.
#[derive(Clone)]
pub struct QuotaManager {
    config: QuotaConfig,
    store: Arc<dyn StateStore<IntegrationUsage>>,
    scope: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager")
            .field("config", &self.config)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl QuotaManager {
    /// Creates a quota manager with its own in-memory state.
    #[must_use]
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), "quota/")
    }

    /// Creates a quota manager over a (possibly shared) store, keeping its
    /// keys under `scope`.
    #[must_use]
    pub fn with_store(
        config: QuotaConfig,
        store: Arc<dyn StateStore<IntegrationUsage>>,
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

    /// Returns the quota configuration.
    #[must_use]
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn store_key(&self, integration_id: &str, user_id: Option<&str>) -> String {
        match user_id {
            Some(user) => format!("{}{integration_id}:{user}", self.scope),
            None => format!("{}{integration_id}", self.scope),
        }
    }

    fn empty_usage(
        &self,
        integration_id: &str,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> IntegrationUsage {
        IntegrationUsage {
            integration_id: integration_id.to_string(),
            user_id: user_id.map(str::to_string),
            request_count: 0,
            quota_used: 0,
            quota_remaining: self.config.limit_for(user_id.is_some()),
            reset_at: self.config.next_reset(now),
            last_request_at: None,
        }
    }

    /// Returns current usage, treating expired usage as reset.
    pub async fn get_usage(&self, integration_id: &str, user_id: Option<&str>) -> IntegrationUsage {
        let now = self.clock.now();
        match self.store.get(&self.store_key(integration_id, user_id)).await {
            Ok(Some(versioned)) if now < versioned.value.reset_at => versioned.value,
            Ok(_) => self.empty_usage(integration_id, user_id, now),
            Err(report) => {
                warn!(integration_id, error = %report, "quota state unavailable");
                self.empty_usage(integration_id, user_id, now)
            }
        }
    }

    /// Returns false once any applicable ceiling is reached.
    pub async fn check_quota(&self, integration_id: &str, user_id: Option<&str>) -> bool {
        let usage = self.get_usage(integration_id, user_id).await;
        let allowed = within_quota(&self.config, usage.quota_used, user_id.is_some());
        debug!(integration_id, user_id, used = usage.quota_used, allowed, "quota check");
        allowed
    }

    /// Records `amount` units of usage.
    pub async fn increment_usage(&self, integration_id: &str, user_id: Option<&str>, amount: u64) {
        let key = self.store_key(integration_id, user_id);
        let result = self.record(&key, integration_id, user_id, amount, false).await;
        if let Err(report) = result {
            warn!(integration_id, error = %report, "failed to record quota usage");
        }
    }

    /// Checks the quota and records `amount` units in one atomic step.
    ///
    /// Unlike `check_quota` followed by `increment_usage`, concurrent callers
    /// cannot both pass the check for the last unit. Admits when the state
    /// store is unavailable.
    pub async fn try_consume(&self, integration_id: &str, user_id: Option<&str>, amount: u64) -> bool {
        let key = self.store_key(integration_id, user_id);
        match self.record(&key, integration_id, user_id, amount, true).await {
            Ok(consumed) => consumed,
            Err(report) => {
                warn!(integration_id, error = %report, "quota state unavailable, admitting request");
                true
            }
        }
    }

    async fn record(
        &self,
        key: &str,
        integration_id: &str,
        user_id: Option<&str>,
        amount: u64,
        only_within_quota: bool,
    ) -> Result<bool, Report<StoreError>> {
        let now = self.clock.now();
        let has_user = user_id.is_some();
        store::update(self.store.as_ref(), key, DEFAULT_MAX_ATTEMPTS, |current| {
            let mut usage = match current {
                Some(usage) if now < usage.reset_at => usage,
                _ => self.empty_usage(integration_id, user_id, now),
            };
            if only_within_quota && !within_quota(&self.config, usage.quota_used, has_user) {
                return (usage, false);
            }
            usage.request_count += 1;
            usage.quota_used = usage.quota_used.saturating_add(amount);
            usage.last_request_at = Some(now);
            usage.quota_remaining = self
                .config
                .limit_for(has_user)
                .map(|limit| limit.saturating_sub(usage.quota_used));
            (usage, true)
        })
        .await
    }

    /// Units left under the tightest applicable ceiling, `None` if unlimited.
    pub async fn get_remaining_quota(
        &self,
        integration_id: &str,
        user_id: Option<&str>,
    ) -> Option<u64> {
        let limit = self.config.limit_for(user_id.is_some())?;
        let usage = self.get_usage(integration_id, user_id).await;
        Some(limit.saturating_sub(usage.quota_used))
    }

    /// Percentage of the tightest applicable ceiling already used.
    #[allow(clippy::cast_precision_loss)]
    pub async fn get_quota_percentage(
        &self,
        integration_id: &str,
        user_id: Option<&str>,
    ) -> Option<f64> {
        let limit = self.config.limit_for(user_id.is_some())?;
        if limit == 0 {
            return Some(100.0);
        }
        let usage = self.get_usage(integration_id, user_id).await;
        Some(usage.quota_used as f64 / limit as f64 * 100.0)
    }

    /// Clears usage for one key.
    pub async fn reset(&self, integration_id: &str, user_id: Option<&str>) {
        if let Err(report) = self.store.remove(&self.store_key(integration_id, user_id)).await {
            warn!(integration_id, error = %report, "failed to reset quota usage");
        }
    }

    /// Clears all usage tracked by this manager.
    pub async fn reset_all(&self) {
        if let Err(report) = self.store.clear_prefix(&self.scope).await {
            warn!(scope = %self.scope, error = %report, "failed to clear quota usage");
        }
    }
}

fn within_quota(config: &QuotaConfig, used: u64, has_user: bool) -> bool {
    let under = |ceiling: Option<u64>| ceiling.is_none_or(|limit| used < limit);
    under(config.daily) && under(config.monthly) && (!has_user || under(config.per_user))
}
