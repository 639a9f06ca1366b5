//! Integration registry and admission facade.
//!
//! The manager owns one rate limiter, quota manager and connector per
//! registered integration and routes admission checks, usage reports,
//! credential refreshes and health checks to them. Denials and failures are
//! published on the event bus rather than returned as errors.

use crate::clock::{Clock, system_clock};
use crate::config::IntegrationConfig;
use crate::connector::{Connector, WebhookDelivery, build_connector};
use crate::credential::IntegrationCredentials;
use crate::error::IntegrationError;
use crate::event::{EventBus, IntegrationEvent, IntegrationEventType};
use crate::quota::{IntegrationUsage, QuotaManager};
use crate::rate_limit::{RateLimitEntry, RateLimiter};
use crate::store::{MemoryStore, StateStore};
use crate::tester::{ConnectionTestResult, ConnectionTester, retry_linear};
use futures::future::join_all;
use rootcause::prelude::ResultExt;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use switchboard_core::{ListenerId, Result};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

/// Everything the manager keeps for one integration.
struct Registration {
    config: IntegrationConfig,
    rate_limiter: Option<RateLimiter>,
    quota: Option<QuotaManager>,
    connector: Option<Arc<dyn Connector>>,
}

/// Builder for [`IntegrationManager`].
#[derive(Default)]
pub struct IntegrationManagerBuilder {
    clock: Option<Arc<dyn Clock>>,
    http: Option<reqwest::Client>,
    tester: Option<ConnectionTester>,
    rate_limit_store: Option<Arc<dyn StateStore<RateLimitEntry>>>,
    quota_store: Option<Arc<dyn StateStore<IntegrationUsage>>>,
}

impl IntegrationManagerBuilder {
    /// Sets the clock shared by every limiter, quota and adapter.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the HTTP client used by connectors.
    #[must_use]
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Sets the connection tester.
    #[must_use]
    pub fn tester(mut self, tester: ConnectionTester) -> Self {
        self.tester = Some(tester);
        self
    }

    /// Sets the backend for rate limit state.
    #[must_use]
    pub fn rate_limit_store(mut self, store: Arc<dyn StateStore<RateLimitEntry>>) -> Self {
        self.rate_limit_store = Some(store);
        self
    }

    /// Sets the backend for quota usage.
    #[must_use]
    pub fn quota_store(mut self, store: Arc<dyn StateStore<IntegrationUsage>>) -> Self {
        self.quota_store = Some(store);
        self
    }

    /// Builds the manager, defaulting to the system clock and in-memory stores.
    #[must_use]
    pub fn build(self) -> IntegrationManager {
        let http = self.http.unwrap_or_default();
        let tester = self
            .tester
            .unwrap_or_else(|| ConnectionTester::new(http.clone()));
        IntegrationManager {
            integrations: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            clock: self.clock.unwrap_or_else(system_clock),
            http,
            tester,
            rate_limit_store: self
                .rate_limit_store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            quota_store: self
                .quota_store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
        }
    }
}

/// Registry of integrations and their traffic controls.
pub struct IntegrationManager {
    integrations: RwLock<HashMap<String, Arc<Registration>>>,
    // One refresh in flight per integration.
    refresh_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    tester: ConnectionTester,
    rate_limit_store: Arc<dyn StateStore<RateLimitEntry>>,
    quota_store: Arc<dyn StateStore<IntegrationUsage>>,
}

impl fmt::Debug for IntegrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self
            .integrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("IntegrationManager")
            .field("integrations", &ids)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Default for IntegrationManager {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn usage_key(integration_id: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user) => format!("{integration_id}:{user}"),
        None => integration_id.to_string(),
    }
}

// Ids are length-prefixed so that no integration's scope is a string prefix
// of another's (`a` vs `a/x`).
fn rate_limit_scope(integration_id: &str) -> String {
    format!("rate_limit/{}:{integration_id}/", integration_id.len())
}

fn quota_scope(integration_id: &str) -> String {
    format!("quota/{}:{integration_id}/", integration_id.len())
}

impl IntegrationManager {
    /// Starts building a manager.
    #[must_use]
    pub fn builder() -> IntegrationManagerBuilder {
        IntegrationManagerBuilder::default()
    }

    fn lookup(&self, integration_id: &str) -> Option<Arc<Registration>> {
        self.integrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(integration_id)
            .cloned()
    }

    fn refresh_lock(&self, integration_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(integration_id.to_string()).or_default())
    }

    fn connector_for(
        &self,
        config: &IntegrationConfig,
    ) -> Result<Option<Arc<dyn Connector>>, IntegrationError> {
        build_connector(
            config,
            self.http.clone(),
            self.tester.clone(),
            Arc::clone(&self.clock),
        )
        .context(IntegrationError::InvalidConfig {
            id: config.id.clone(),
        })
    }

    async fn clear_state(&self, integration_id: &str) {
        if let Err(report) = self
            .rate_limit_store
            .clear_prefix(&rate_limit_scope(integration_id))
            .await
        {
            warn!(integration_id, error = %report, "failed to clear rate limit state");
        }
        if let Err(report) = self
            .quota_store
            .clear_prefix(&quota_scope(integration_id))
            .await
        {
            warn!(integration_id, error = %report, "failed to clear quota state");
        }
    }

    /// Registers an integration, replacing any previous registration and its
    /// rate limit and quota state.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::InvalidConfig` if the integration's
    /// connector rejects the configuration.
    #[instrument(skip_all, fields(integration_id = %config.id, name = %config.name))]
    pub async fn register_integration(
        &self,
        config: IntegrationConfig,
    ) -> Result<(), IntegrationError> {
        let connector = self.connector_for(&config)?;
        let rate_limiter = config.rate_limit.clone().map(|rate_limit| {
            RateLimiter::with_store(
                rate_limit,
                Arc::clone(&self.rate_limit_store),
                rate_limit_scope(&config.id),
            )
            .with_clock(Arc::clone(&self.clock))
        });
        let quota = config.quota.clone().map(|quota| {
            QuotaManager::with_store(
                quota,
                Arc::clone(&self.quota_store),
                quota_scope(&config.id),
            )
            .with_clock(Arc::clone(&self.clock))
        });

        self.clear_state(&config.id).await;

        let id = config.id.clone();
        let registration = Registration {
            config,
            rate_limiter,
            quota,
            connector,
        };
        self.integrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(registration));
        info!("integration registered");
        Ok(())
    }

    /// Removes an integration and all of its state. Returns whether it was
    /// registered.
    #[instrument(skip(self))]
    pub async fn unregister_integration(&self, integration_id: &str) -> bool {
        let removed = self
            .integrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(integration_id)
            .is_some();
        self.refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(integration_id);
        self.clear_state(integration_id).await;
        if removed {
            info!("integration unregistered");
        }
        removed
    }

    /// Replaces an integration's credentials and rebuilds its connector.
    ///
    /// Rate limit and quota state are kept.
    ///
    /// # Errors
    ///
    /// Returns `IntegrationError::NotFound` for unknown ids, or
    /// `IntegrationError::InvalidConfig` if the connector cannot be rebuilt.
    pub fn update_credentials(
        &self,
        integration_id: &str,
        credentials: IntegrationCredentials,
    ) -> Result<(), IntegrationError> {
        self.replace_credentials(integration_id, credentials, None)
            .map(|_| ())
    }

    /// Swaps in a registration carrying `credentials`. With `expected`, the
    /// swap only happens while that registration is still current and the
    /// return value says whether it did.
    fn replace_credentials(
        &self,
        integration_id: &str,
        credentials: IntegrationCredentials,
        expected: Option<&Arc<Registration>>,
    ) -> Result<bool, IntegrationError> {
        let not_found = || IntegrationError::NotFound {
            id: integration_id.to_string(),
        };
        loop {
            let current = self.lookup(integration_id).ok_or_else(not_found)?;
            if expected.is_some_and(|expected| !Arc::ptr_eq(expected, &current)) {
                return Ok(false);
            }

            let config = current.config.clone().with_credentials(credentials.clone());
            let connector = self.connector_for(&config)?;

            let mut integrations = self
                .integrations
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = integrations.get_mut(integration_id).ok_or_else(not_found)?;
            if !Arc::ptr_eq(slot, &current) {
                continue;
            }
            *slot = Arc::new(Registration {
                config,
                rate_limiter: current.rate_limiter.clone(),
                quota: current.quota.clone(),
                connector,
            });
            debug!(integration_id, "credentials updated");
            return Ok(true);
        }
    }

    /// Returns an integration's configuration.
    #[must_use]
    pub fn get_integration(&self, integration_id: &str) -> Option<IntegrationConfig> {
        self.lookup(integration_id)
            .map(|registration| registration.config.clone())
    }

    /// Returns the connector serving an integration, if its name has one.
    #[must_use]
    pub fn get_connector(&self, integration_id: &str) -> Option<Arc<dyn Connector>> {
        self.lookup(integration_id)?.connector.clone()
    }

    /// Returns every registered configuration, ordered by id.
    #[must_use]
    pub fn list_integrations(&self) -> Vec<IntegrationConfig> {
        let mut configs: Vec<IntegrationConfig> = self
            .integrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|registration| registration.config.clone())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    /// Admits or denies one request against the integration's rate limit.
    ///
    /// Unknown integrations and integrations without a rate limit are always
    /// admitted. A denial emits a `rate_limit` event.
    pub async fn check_rate_limit(&self, integration_id: &str, user_id: Option<&str>) -> bool {
        let Some(limiter) = self
            .lookup(integration_id)
            .and_then(|registration| registration.rate_limiter.clone())
        else {
            return true;
        };

        let key = usage_key(integration_id, user_id);
        if limiter.check_limit(&key).await {
            return true;
        }

        warn!(integration_id, key = %key, "rate limit exceeded");
        let config = limiter.config();
        self.emit(
            &self
                .event(integration_id, IntegrationEventType::RateLimit)
                .with_data(json!({
                    "key": key,
                    "user_id": user_id,
                    "max_requests": config.max_requests,
                    "window_ms": config.window_ms,
                }))
                .with_error("rate limit exceeded"),
        );
        false
    }

    /// Returns whether the integration is under its quota.
    ///
    /// Unknown integrations and integrations without a quota always pass. A
    /// denial emits a `quota_exceeded` event.
    pub async fn check_quota(&self, integration_id: &str, user_id: Option<&str>) -> bool {
        let Some(quota) = self
            .lookup(integration_id)
            .and_then(|registration| registration.quota.clone())
        else {
            return true;
        };

        if quota.check_quota(integration_id, user_id).await {
            return true;
        }

        let usage = quota.get_usage(integration_id, user_id).await;
        warn!(integration_id, quota_used = usage.quota_used, "quota exceeded");
        self.emit(
            &self
                .event(integration_id, IntegrationEventType::QuotaExceeded)
                .with_data(json!({
                    "key": usage_key(integration_id, user_id),
                    "user_id": user_id,
                    "quota_used": usage.quota_used,
                    "reset_at": usage.reset_at,
                }))
                .with_error("quota exceeded"),
        );
        false
    }

    /// Records usage against the integration's quota.
    pub async fn increment_usage(&self, integration_id: &str, user_id: Option<&str>, amount: u64) {
        match self
            .lookup(integration_id)
            .and_then(|registration| registration.quota.clone())
        {
            Some(quota) => quota.increment_usage(integration_id, user_id, amount).await,
            None => debug!(integration_id, "no quota configured, usage not recorded"),
        }
    }

    /// Units left under the integration's quota, `None` when unlimited.
    pub async fn get_remaining_quota(
        &self,
        integration_id: &str,
        user_id: Option<&str>,
    ) -> Option<u64> {
        let quota = self.lookup(integration_id)?.quota.clone()?;
        quota.get_remaining_quota(integration_id, user_id).await
    }

    /// Requests left in the current rate limit window, `None` when unlimited.
    pub async fn get_remaining_requests(
        &self,
        integration_id: &str,
        user_id: Option<&str>,
    ) -> Option<u32> {
        let limiter = self.lookup(integration_id)?.rate_limiter.clone()?;
        Some(
            limiter
                .get_remaining_requests(&usage_key(integration_id, user_id))
                .await,
        )
    }

    /// Asks the integration's connector for fresh credentials and stores them.
    ///
    /// At most one refresh per integration talks to the provider at a time.
    /// A caller that waited on another refresh which stored new credentials
    /// returns true without refreshing again. Credentials replaced by
    /// [`update_credentials`](Self::update_credentials) while a refresh is in
    /// flight win over the refreshed ones.
    ///
    /// Returns true only when new credentials are in place. Failures emit an
    /// `error` event.
    #[instrument(skip(self))]
    pub async fn refresh_credentials(&self, integration_id: &str) -> bool {
        let Some(seen) = self.lookup(integration_id) else {
            debug!("not registered, nothing to refresh");
            return false;
        };
        let lock = self.refresh_lock(integration_id);
        let _guard = lock.lock().await;

        let Some(current) = self.lookup(integration_id) else {
            debug!("unregistered while waiting to refresh");
            return false;
        };
        if !Arc::ptr_eq(&seen, &current) {
            debug!("credentials replaced while waiting to refresh");
            return true;
        }
        let Some(connector) = current.connector.clone() else {
            debug!("no connector, nothing to refresh");
            return false;
        };

        let outcome = match connector.refresh_credentials().await {
            Ok(None) => return false,
            Ok(Some(credentials)) => {
                self.replace_credentials(integration_id, credentials, Some(&current))
            }
            Err(report) => Err(report.context(IntegrationError::CredentialRefresh {
                id: integration_id.to_string(),
            })),
        };

        match outcome {
            Ok(true) => {
                info!("credentials refreshed");
                true
            }
            Ok(false) => {
                debug!("credentials changed during refresh, result discarded");
                false
            }
            Err(report) => {
                warn!(error = %report, "credential refresh failed");
                self.emit(
                    &self
                        .event(integration_id, IntegrationEventType::Error)
                        .with_data(json!({ "operation": "refresh_credentials" }))
                        .with_error(report.to_string()),
                );
                false
            }
        }
    }

    /// Posts `data` through the integration's webhook connector, to `url` or
    /// the configured webhook URL.
    ///
    /// Unknown, disabled and non-webhook integrations fail without sending.
    /// A failed delivery emits an `error` event.
    #[instrument(skip(self, data))]
    pub async fn trigger_webhook(
        &self,
        integration_id: &str,
        data: &JsonValue,
        url: Option<&str>,
    ) -> WebhookDelivery {
        let id = integration_id.to_string();
        let Some(registration) = self.lookup(integration_id) else {
            return WebhookDelivery::failed(IntegrationError::NotFound { id });
        };
        if !registration.config.enabled {
            return WebhookDelivery::failed(IntegrationError::Disabled { id });
        }
        let Some(webhook) = registration
            .connector
            .as_deref()
            .and_then(|connector| connector.as_webhook())
        else {
            return WebhookDelivery::failed(IntegrationError::NotAWebhook { id });
        };

        let delivery = webhook.trigger_webhook(data, url).await;
        if !delivery.success {
            let mut event = self
                .event(integration_id, IntegrationEventType::Error)
                .with_data(json!({ "operation": "trigger_webhook", "status": delivery.status }));
            if let Some(error) = &delivery.error {
                event = event.with_error(error.clone());
            }
            self.emit(&event);
        }
        delivery
    }

    /// Health-checks one integration.
    ///
    /// Uses the integration's connector when it has one, otherwise a GET to
    /// its base URL. Failed checks emit an `error` event.
    pub async fn test_connection(&self, integration_id: &str) -> ConnectionTestResult {
        self.test_connection_with_retry(integration_id, 1, Duration::ZERO)
            .await
    }

    /// Health-checks one integration up to `max_retries` times, sleeping
    /// `retry_delay * n` after the `n`th failure.
    ///
    /// Only the final failure emits an `error` event.
    pub async fn test_connection_with_retry(
        &self,
        integration_id: &str,
        max_retries: u32,
        retry_delay: Duration,
    ) -> ConnectionTestResult {
        let Some(registration) = self.lookup(integration_id) else {
            let error = IntegrationError::NotFound {
                id: integration_id.to_string(),
            };
            return ConnectionTestResult::failed("Integration not found", error.to_string());
        };
        if !registration.config.enabled {
            let error = IntegrationError::Disabled {
                id: integration_id.to_string(),
            };
            return ConnectionTestResult::failed("Integration is disabled", error.to_string());
        }

        let registration = &*registration;
        let result =
            retry_linear(max_retries, retry_delay, move || self.check(registration)).await;

        if !result.success {
            let mut event = self
                .event(integration_id, IntegrationEventType::Error)
                .with_data(json!({ "operation": "test_connection", "message": result.message }));
            if let Some(error) = &result.error {
                event = event.with_error(error.clone());
            }
            self.emit(&event);
        }
        result
    }

    async fn check(&self, registration: &Registration) -> ConnectionTestResult {
        match &registration.connector {
            Some(connector) => connector.test_connection().await,
            None => self.tester.test_connection(&registration.config, None).await,
        }
    }

    /// Health-checks every enabled integration concurrently, keyed by id.
    pub async fn test_all_connections(&self) -> HashMap<String, ConnectionTestResult> {
        let ids: Vec<String> = self
            .list_integrations()
            .into_iter()
            .filter(|config| config.enabled)
            .map(|config| config.id)
            .collect();

        let tests = ids.into_iter().map(|id| async move {
            let result = self.test_connection(&id).await;
            (id, result)
        });
        join_all(tests).await.into_iter().collect()
    }

    /// Subscribes to events for one integration id, or to every event with
    /// [`WILDCARD`](crate::event::WILDCARD).
    pub fn add_event_listener<F>(&self, channel: &str, listener: F) -> ListenerId
    where
        F: Fn(&IntegrationEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(channel, listener)
    }

    /// Removes a listener. Returns whether it was subscribed to `channel`.
    pub fn remove_event_listener(&self, channel: &str, listener_id: ListenerId) -> bool {
        self.events.unsubscribe(channel, listener_id)
    }

    /// Delivers an event to its integration's listeners and then to wildcard
    /// listeners.
    pub fn emit(&self, event: &IntegrationEvent) {
        let delivered = self.events.emit(event);
        debug!(
            integration_id = %event.integration_id,
            event_type = %event.event_type,
            delivered,
            "event emitted"
        );
    }

    fn event(&self, integration_id: &str, event_type: IntegrationEventType) -> IntegrationEvent {
        IntegrationEvent::new(integration_id, event_type, self.clock.now())
    }
}
