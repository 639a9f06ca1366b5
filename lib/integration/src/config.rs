//! Integration configuration.

use crate::credential::{CredentialType, IntegrationCredentials};
use crate::quota::QuotaConfig;
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Category of third-party service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    Email,
    Calendar,
    Messaging,
    Automation,
    Crm,
    Social,
    Communication,
}

/// Registration record for one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Caller-chosen identifier, unique within a manager.
    pub id: String,
    /// Service name; selects the connector (e.g. "gmail", "zapier").
    pub name: String,
    /// Service category.
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    /// How the integration authenticates.
    pub auth_type: CredentialType,
    /// Disabled integrations stay registered but are skipped by health checks.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Current credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<IntegrationCredentials>,
    /// Short-window request limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    /// Long-horizon usage ceilings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaConfig>,
    /// API base URL, used as the default health-check endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Outbound webhook URL for webhook-driven services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Free-form settings.
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

fn default_enabled() -> bool {
    true
}

impl IntegrationConfig {
    /// Creates an enabled integration with no credentials or limits.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        integration_type: IntegrationType,
        auth_type: CredentialType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            integration_type,
            auth_type,
            enabled: true,
            credentials: None,
            rate_limit: None,
            quota: None,
            base_url: None,
            webhook_url: None,
            metadata: Map::new(),
        }
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: IntegrationCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Sets the quota.
    #[must_use]
    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the webhook URL.
    #[must_use]
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns a string metadata value.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(JsonValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitStrategy;

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{
            "id": "zap-1",
            "name": "Zapier",
            "type": "automation",
            "auth_type": "api_key",
            "webhook_url": "https://hooks.zapier.com/hooks/catch/1/abc",
            "rate_limit": {"max_requests": 10, "window_ms": 1000, "strategy": "token-bucket"}
        }"#;

        let config: IntegrationConfig = serde_json::from_str(json).expect("deserialize");

        assert!(config.enabled);
        assert_eq!(config.integration_type, IntegrationType::Automation);
        assert!(config.credentials.is_none());
        assert!(config.metadata.is_empty());
        let rate_limit = config.rate_limit.expect("rate limit");
        assert_eq!(rate_limit.strategy, RateLimitStrategy::TokenBucket);
    }

    #[test]
    fn debug_does_not_leak_credentials() {
        let config = IntegrationConfig::new("b", "custom", IntegrationType::Crm, CredentialType::Basic)
            .with_credentials(IntegrationCredentials::basic("ops", "hunter2"));
        let debug = format!("{config:?}");
        assert!(debug.contains("ops"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn builder_sets_fields() {
        let config = IntegrationConfig::new(
            "wa",
            "whatsapp",
            IntegrationType::Messaging,
            CredentialType::Bearer,
        )
        .with_metadata("phone_number_id", serde_json::json!("1234"))
        .enabled(false);

        assert!(!config.enabled);
        assert_eq!(config.metadata_str("phone_number_id"), Some("1234"));
    }
}
