//! Connector trait and the built-in connectors.
//!
//! A connector knows how to health-check one kind of service and, where the
//! service supports it, how to refresh its credentials. The manager picks a
//! connector by integration name with [`build_connector`].

use crate::auth::{OAuth2Adapter, OAuth2Config};
use crate::clock::Clock;
use crate::config::IntegrationConfig;
use crate::credential::IntegrationCredentials;
use crate::error::{AuthError, ConfigError, NetworkError};
use crate::tester::{ConnectionTestResult, ConnectionTester};
use async_trait::async_trait;
use rootcause::prelude::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Metadata key overriding a connector's health-check URL.
pub const TEST_ENDPOINT_KEY: &str = "test_endpoint";
/// Metadata key overriding an OAuth connector's token URL.
pub const TOKEN_URL_KEY: &str = "token_url";
/// Metadata key holding the WhatsApp Business phone-number id.
pub const PHONE_NUMBER_ID_KEY: &str = "phone_number_id";

/// Default Graph API root for WhatsApp.
pub const WHATSAPP_GRAPH_API: &str = "https://graph.facebook.com/v18.0";

/// Trait for integration connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the connector name (e.g. "gmail").
    fn name(&self) -> &str;

    /// Checks that the service is reachable with the current credentials.
    async fn test_connection(&self) -> ConnectionTestResult;

    /// Obtains fresh credentials from the service.
    ///
    /// Returns `Ok(None)` when the connector has nothing to refresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh was attempted and failed.
    async fn refresh_credentials(
        &self,
    ) -> Result<Option<IntegrationCredentials>, Report<AuthError>>;

    /// Returns this connector as a webhook sender, if it is one.
    fn as_webhook(&self) -> Option<&WebhookConnector> {
        None
    }
}

/// OAuth provider endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OAuthProvider {
    pub name: &'static str,
    pub test_endpoint: &'static str,
    pub token_url: &'static str,
}

pub const GMAIL: OAuthProvider = OAuthProvider {
    name: "gmail",
    test_endpoint: "https://gmail.googleapis.com/gmail/v1/users/me/profile",
    token_url: "https://oauth2.googleapis.com/token",
};

pub const OUTLOOK: OAuthProvider = OAuthProvider {
    name: "outlook",
    test_endpoint: "https://graph.microsoft.com/v1.0/me",
    token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
};

pub const LINKEDIN: OAuthProvider = OAuthProvider {
    name: "linkedin",
    test_endpoint: "https://api.linkedin.com/v2/userinfo",
    token_url: "https://www.linkedin.com/oauth/v2/accessToken",
};

/// Connector for OAuth-authenticated profile APIs (Gmail, Outlook, LinkedIn).
#[derive(Debug, Clone)]
pub struct OAuthConnector {
    provider: &'static str,
    config: IntegrationConfig,
    test_endpoint: String,
    token_url: String,
    http: reqwest::Client,
    tester: ConnectionTester,
    clock: Arc<dyn Clock>,
}

impl OAuthConnector {
    /// Creates a connector for `provider`, honoring endpoint overrides in the
    /// integration metadata.
    #[must_use]
    pub fn new(
        provider: OAuthProvider,
        config: IntegrationConfig,
        http: reqwest::Client,
        tester: ConnectionTester,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let test_endpoint = config
            .metadata_str(TEST_ENDPOINT_KEY)
            .unwrap_or(provider.test_endpoint)
            .to_string();
        let token_url = config
            .metadata_str(TOKEN_URL_KEY)
            .unwrap_or(provider.token_url)
            .to_string();
        Self {
            provider: provider.name,
            config,
            test_endpoint,
            token_url,
            http,
            tester,
            clock,
        }
    }

    /// Returns the health-check URL.
    #[must_use]
    pub fn test_endpoint(&self) -> &str {
        &self.test_endpoint
    }

    /// Returns the token URL used for refresh.
    #[must_use]
    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl Connector for OAuthConnector {
    fn name(&self) -> &str {
        self.provider
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        self.tester
            .test_connection(&self.config, Some(&self.test_endpoint))
            .await
    }

    #[instrument(skip(self), fields(provider = self.provider, integration_id = %self.config.id))]
    async fn refresh_credentials(
        &self,
    ) -> Result<Option<IntegrationCredentials>, Report<AuthError>> {
        let Some(IntegrationCredentials::Oauth2 {
            refresh_token,
            scope,
            client_id,
            client_secret,
            metadata,
            ..
        }) = &self.config.credentials
        else {
            return Ok(None);
        };
        let Some(refresh_token) = refresh_token else {
            return Err(AuthError::MissingRefreshToken.into());
        };

        let adapter = OAuth2Adapter::new(
            OAuth2Config {
                client_id: client_id.clone().unwrap_or_default(),
                client_secret: client_secret.clone().unwrap_or_default(),
                authorization_url: String::new(),
                token_url: self.token_url.clone(),
                redirect_uri: String::new(),
                scopes: scope.clone(),
                state: None,
                revoke_url: None,
            },
            self.http.clone(),
        )
        .with_clock(Arc::clone(&self.clock));

        let mut refreshed = adapter
            .refresh_access_token(refresh_token)
            .await
            .context(AuthError::RefreshFailed {
                provider: self.provider.to_string(),
            })?;

        if let IntegrationCredentials::Oauth2 {
            metadata: fresh, ..
        } = &mut refreshed
        {
            for (key, value) in metadata {
                fresh.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        debug!("credentials refreshed");
        Ok(Some(refreshed))
    }
}

/// Result of one webhook POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookDelivery {
    pub(crate) fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            status: None,
            error: Some(error.to_string()),
        }
    }
}

/// Connector for automation platforms driven by inbound webhooks (Zapier, Make).
#[derive(Debug, Clone)]
pub struct WebhookConnector {
    name: String,
    webhook_url: Option<String>,
    http: reqwest::Client,
    tester: ConnectionTester,
    clock: Arc<dyn Clock>,
}

impl WebhookConnector {
    /// Creates a connector posting to the integration's webhook URL.
    #[must_use]
    pub fn new(
        config: &IntegrationConfig,
        http: reqwest::Client,
        tester: ConnectionTester,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: config.name.to_lowercase(),
            webhook_url: config.webhook_url.clone(),
            http,
            tester,
            clock,
        }
    }

    /// POSTs `data` as JSON to `url`, or to the configured webhook URL.
    #[instrument(skip(self, data), fields(connector = %self.name))]
    pub async fn trigger_webhook(&self, data: &JsonValue, url: Option<&str>) -> WebhookDelivery {
        let Some(url) = url.or(self.webhook_url.as_deref()) else {
            return WebhookDelivery::failed(ConfigError::MissingWebhookUrl);
        };

        let sent = self
            .http
            .post(url)
            .json(data)
            .timeout(self.tester.timeout())
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => WebhookDelivery {
                success: true,
                status: Some(response.status().as_u16()),
                error: None,
            },
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let error = NetworkError::RequestFailed { status, body };
                warn!(status, "webhook rejected");
                WebhookDelivery {
                    success: false,
                    status: Some(status),
                    error: Some(error.to_string()),
                }
            }
            Err(e) => {
                let error = NetworkError::from(e);
                warn!(error = %error, "webhook delivery failed");
                WebhookDelivery::failed(error)
            }
        }
    }

    /// Sends each payload in order to the configured URL, continuing past
    /// failures.
    pub async fn trigger_many(&self, payloads: &[JsonValue]) -> Vec<WebhookDelivery> {
        let mut deliveries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            deliveries.push(self.trigger_webhook(payload, None).await);
        }
        deliveries
    }
}

#[async_trait]
impl Connector for WebhookConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        let ping = json!({
            "test": true,
            "source": "switchboard",
            "timestamp": self.clock.now().to_rfc3339(),
        });
        let delivery = self.trigger_webhook(&ping, None).await;
        match (delivery.success, delivery.error) {
            (true, _) => ConnectionTestResult::ok("Webhook accepted test payload"),
            (false, error) => ConnectionTestResult::failed(
                "Webhook test failed",
                error.unwrap_or_default(),
            ),
        }
    }

    async fn refresh_credentials(
        &self,
    ) -> Result<Option<IntegrationCredentials>, Report<AuthError>> {
        Ok(None)
    }

    fn as_webhook(&self) -> Option<&WebhookConnector> {
        Some(self)
    }
}

/// Connector for the WhatsApp Business Cloud API.
#[derive(Debug, Clone)]
pub struct WhatsAppConnector {
    config: IntegrationConfig,
    phone_number_id: String,
    tester: ConnectionTester,
}

impl WhatsAppConnector {
    /// Creates the connector.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingPhoneNumberId` if the integration
    /// metadata has no `phone_number_id`.
    pub fn new(
        config: IntegrationConfig,
        tester: ConnectionTester,
    ) -> Result<Self, Report<ConfigError>> {
        let phone_number_id = config
            .metadata_str(PHONE_NUMBER_ID_KEY)
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigError::MissingPhoneNumberId)?
            .to_string();
        Ok(Self {
            config,
            phone_number_id,
            tester,
        })
    }

    /// Returns the phone-number resource URL used for health checks.
    #[must_use]
    pub fn phone_number_url(&self) -> String {
        let root = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(WHATSAPP_GRAPH_API)
            .trim_end_matches('/');
        format!("{root}/{}", self.phone_number_id)
    }
}

#[async_trait]
impl Connector for WhatsAppConnector {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        let url = self.phone_number_url();
        self.tester.test_connection(&self.config, Some(&url)).await
    }

    async fn refresh_credentials(
        &self,
    ) -> Result<Option<IntegrationCredentials>, Report<AuthError>> {
        Ok(None)
    }
}

/// Picks the connector for an integration by name, case-insensitively.
///
/// Returns `Ok(None)` for names without a built-in connector.
///
/// # Errors
///
/// Returns an error if the connector rejects the configuration.
pub fn build_connector(
    config: &IntegrationConfig,
    http: reqwest::Client,
    tester: ConnectionTester,
    clock: Arc<dyn Clock>,
) -> Result<Option<Arc<dyn Connector>>, Report<ConfigError>> {
    let connector: Arc<dyn Connector> = match config.name.to_lowercase().as_str() {
        "gmail" => Arc::new(OAuthConnector::new(GMAIL, config.clone(), http, tester, clock)),
        "outlook" => Arc::new(OAuthConnector::new(
            OUTLOOK,
            config.clone(),
            http,
            tester,
            clock,
        )),
        "linkedin" => Arc::new(OAuthConnector::new(
            LINKEDIN,
            config.clone(),
            http,
            tester,
            clock,
        )),
        "zapier" | "make" => Arc::new(WebhookConnector::new(config, http, tester, clock)),
        "whatsapp" => Arc::new(WhatsAppConnector::new(config.clone(), tester)?),
        other => {
            debug!(name = other, "no connector for integration");
            return Ok(None);
        }
    };
    Ok(Some(connector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::IntegrationType;
    use crate::credential::{CredentialMetadata, CredentialType};
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parts() -> (reqwest::Client, ConnectionTester, Arc<dyn Clock>) {
        let http = reqwest::Client::new();
        (
            http.clone(),
            ConnectionTester::new(http),
            Arc::new(ManualClock::default()),
        )
    }

    fn build(config: &IntegrationConfig) -> Result<Option<Arc<dyn Connector>>, Report<ConfigError>> {
        let (http, tester, clock) = parts();
        build_connector(config, http, tester, clock)
    }

    fn oauth_credentials(refresh_token: Option<&str>) -> IntegrationCredentials {
        let mut metadata = CredentialMetadata::new();
        metadata.insert("account".to_string(), json!("sales@example.com"));
        IntegrationCredentials::Oauth2 {
            access_token: "at-old".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: None,
            scope: vec!["mail.read".to_string()],
            client_id: Some("cid".to_string()),
            client_secret: Some("csecret".to_string()),
            metadata,
        }
    }

    fn webhook_connector(url: Option<String>) -> WebhookConnector {
        let mut config =
            IntegrationConfig::new("z", "Zapier", IntegrationType::Automation, CredentialType::ApiKey);
        config.webhook_url = url;
        let (http, tester, clock) = parts();
        WebhookConnector::new(&config, http, tester, clock)
    }

    #[test]
    fn dispatches_by_name_case_insensitively() {
        for (name, expected) in [
            ("Gmail", "gmail"),
            ("OUTLOOK", "outlook"),
            ("linkedin", "linkedin"),
            ("Zapier", "zapier"),
            ("make", "make"),
        ] {
            let config =
                IntegrationConfig::new("i", name, IntegrationType::Email, CredentialType::Oauth2);
            let connector = build(&config).expect("build").expect("connector");
            assert_eq!(connector.name(), expected);
            assert_eq!(
                connector.as_webhook().is_some(),
                matches!(expected, "zapier" | "make")
            );
        }
    }

    #[test]
    fn unknown_name_has_no_connector() {
        let config =
            IntegrationConfig::new("i", "hubspot", IntegrationType::Crm, CredentialType::ApiKey);
        assert!(build(&config).expect("build").is_none());
    }

    #[test]
    fn whatsapp_requires_phone_number_id() {
        let config = IntegrationConfig::new(
            "wa",
            "WhatsApp",
            IntegrationType::Messaging,
            CredentialType::Bearer,
        );
        let err = build(&config).err().expect("missing phone number id");
        assert!(err.to_string().contains("phone number id"));

        let config = config.with_metadata(PHONE_NUMBER_ID_KEY, json!("555"));
        let connector = build(&config).expect("build").expect("connector");
        assert_eq!(connector.name(), "whatsapp");
    }

    #[test]
    fn oauth_endpoints_are_overridable() {
        let config =
            IntegrationConfig::new("g", "gmail", IntegrationType::Email, CredentialType::Oauth2)
                .with_metadata(TOKEN_URL_KEY, json!("http://localhost/token"));
        let (http, tester, clock) = parts();
        let connector = OAuthConnector::new(GMAIL, config, http, tester, clock);

        assert_eq!(connector.token_url(), "http://localhost/token");
        assert_eq!(connector.test_endpoint(), GMAIL.test_endpoint);
    }

    #[tokio::test]
    async fn oauth_health_check_uses_profile_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .and(header("Authorization", "Bearer at-old"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config =
            IntegrationConfig::new("o", "outlook", IntegrationType::Email, CredentialType::Oauth2)
                .with_credentials(oauth_credentials(None))
                .with_metadata(TEST_ENDPOINT_KEY, json!(format!("{}/v1.0/me", server.uri())));
        let connector = build(&config).expect("build").expect("connector");

        assert!(connector.test_connection().await.success);
    }

    #[tokio::test]
    async fn oauth_refresh_posts_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .and(body_string_contains("client_id=cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-new",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let config =
            IntegrationConfig::new("g", "gmail", IntegrationType::Email, CredentialType::Oauth2)
                .with_credentials(oauth_credentials(Some("rt-1")))
                .with_metadata(TOKEN_URL_KEY, json!(format!("{}/token", server.uri())));
        let connector = build(&config).expect("build").expect("connector");

        let refreshed = connector
            .refresh_credentials()
            .await
            .expect("refresh")
            .expect("new credentials");
        assert_eq!(refreshed.access_token(), Some("at-new"));
        assert_eq!(refreshed.refresh_token(), Some("rt-1"));
        assert_eq!(refreshed.metadata_str("account"), Some("sales@example.com"));
        assert!(refreshed.expires_at().is_some());
    }

    #[tokio::test]
    async fn oauth_refresh_failure_names_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let config =
            IntegrationConfig::new("l", "linkedin", IntegrationType::Social, CredentialType::Oauth2)
                .with_credentials(oauth_credentials(Some("rt-1")))
                .with_metadata(TOKEN_URL_KEY, json!(format!("{}/token", server.uri())));
        let connector = build(&config).expect("build").expect("connector");

        let err = connector.refresh_credentials().await.expect_err("401");
        assert!(err.to_string().contains("linkedin"));
    }

    #[tokio::test]
    async fn oauth_refresh_without_refresh_token_fails() {
        let config =
            IntegrationConfig::new("g", "gmail", IntegrationType::Email, CredentialType::Oauth2)
                .with_credentials(oauth_credentials(None));
        let connector = build(&config).expect("build").expect("connector");

        let err = connector.refresh_credentials().await.expect_err("no token");
        assert!(err.to_string().contains("no refresh token"));
    }

    #[tokio::test]
    async fn oauth_refresh_without_oauth_credentials_is_noop() {
        let config =
            IntegrationConfig::new("g", "gmail", IntegrationType::Email, CredentialType::ApiKey)
                .with_credentials(IntegrationCredentials::api_key("k"));
        let connector = build(&config).expect("build").expect("connector");
        assert!(connector.refresh_credentials().await.expect("refresh").is_none());
    }

    #[tokio::test]
    async fn webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({"lead": "ada"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let connector = webhook_connector(Some(format!("{}/hook", server.uri())));
        let delivery = connector.trigger_webhook(&json!({"lead": "ada"}), None).await;

        assert!(delivery.success);
        assert_eq!(delivery.status, Some(200));
    }

    #[tokio::test]
    async fn webhook_without_url_fails() {
        let connector = webhook_connector(None);
        let delivery = connector.trigger_webhook(&json!({}), None).await;

        assert!(!delivery.success);
        assert_eq!(
            delivery.error.as_deref(),
            Some("webhook URL is not configured")
        );
        assert!(!connector.test_connection().await.success);
    }

    #[tokio::test]
    async fn trigger_many_continues_past_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"n": 2})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let connector = webhook_connector(Some(server.uri()));
        let deliveries = connector
            .trigger_many(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
            .await;

        let outcomes: Vec<bool> = deliveries.iter().map(|d| d.success).collect();
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!(deliveries[1].status, Some(500));
    }

    #[tokio::test]
    async fn whatsapp_checks_phone_number_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/555"))
            .and(header("Authorization", "Bearer wa-token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = IntegrationConfig::new(
            "wa",
            "whatsapp",
            IntegrationType::Messaging,
            CredentialType::Bearer,
        )
        .with_base_url(server.uri())
        .with_credentials(IntegrationCredentials::bearer("wa-token"))
        .with_metadata(PHONE_NUMBER_ID_KEY, json!("555"));
        let connector = build(&config).expect("build").expect("connector");

        assert!(connector.test_connection().await.success);
        assert!(connector.refresh_credentials().await.expect("refresh").is_none());
    }
}
