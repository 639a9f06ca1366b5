//! Connection health checks.

use crate::auth::ApiKeyAdapter;
use crate::config::IntegrationConfig;
use crate::credential::IntegrationCredentials;
use crate::error::NetworkError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Per-request timeout used unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts made by `test_with_retry` by default.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Base delay between retry attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Outcome of one connection test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTestResult {
    /// Creates a successful result.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            latency_ms: None,
            metadata: None,
            error: None,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            latency_ms: None,
            metadata: None,
            error: Some(error.into()),
        }
    }

    /// Sets the measured latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the response metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, JsonValue>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Issues authenticated GET requests to check that an integration is reachable.
#[derive(Debug, Clone)]
pub struct ConnectionTester {
    http: reqwest::Client,
    timeout: Duration,
}

impl ConnectionTester {
    /// Creates a tester with the default 10 second timeout.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Replaces the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the HTTP client.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Sends one authenticated GET to `test_endpoint`, or to the
    /// integration's base URL when no endpoint is given.
    #[instrument(skip_all, fields(integration_id = %config.id))]
    pub async fn test_connection(
        &self,
        config: &IntegrationConfig,
        test_endpoint: Option<&str>,
    ) -> ConnectionTestResult {
        let Some(endpoint) = test_endpoint.or(config.base_url.as_deref()) else {
            return ConnectionTestResult::failed(
                "No test endpoint configured",
                format!("integration '{}' has no base URL", config.id),
            );
        };

        let (url, headers) = authenticate(endpoint, config.credentials.as_ref());
        let mut request = self.http.get(&url).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let started = Instant::now();
        let outcome = request.send().await;
        let latency = started.elapsed();

        match outcome {
            Ok(response) => {
                let status = response.status();
                let status_text = status.canonical_reason().unwrap_or_default();
                let mut metadata = Map::new();
                metadata.insert("status".to_string(), json!(status.as_u16()));
                metadata.insert("status_text".to_string(), json!(status_text));

                let result = if status.is_success() {
                    debug!(status = status.as_u16(), "connection test succeeded");
                    ConnectionTestResult::ok("Connection successful")
                } else {
                    let error = NetworkError::RequestFailed {
                        status: status.as_u16(),
                        body: String::new(),
                    };
                    warn!(status = status.as_u16(), "connection test failed");
                    ConnectionTestResult::failed(
                        format!("Connection failed: HTTP {} {status_text}", status.as_u16()),
                        error.to_string(),
                    )
                };
                result.with_latency(latency).with_metadata(metadata)
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    NetworkError::Timeout {
                        after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    }
                } else {
                    NetworkError::from(e)
                };
                warn!(error = %error, "connection test failed");
                ConnectionTestResult::failed("Connection failed", error.to_string())
                    .with_latency(latency)
            }
        }
    }

    /// Tests up to `max_retries` times, sleeping `delay * attempt` between
    /// attempts. Returns the first success or the last failure.
    #[instrument(skip_all, fields(integration_id = %config.id))]
    pub async fn test_with_retry(
        &self,
        config: &IntegrationConfig,
        test_endpoint: Option<&str>,
        max_retries: u32,
        delay: Duration,
    ) -> ConnectionTestResult {
        retry_linear(max_retries, delay, move || {
            self.test_connection(config, test_endpoint)
        })
        .await
    }

    /// Tests every integration concurrently, keyed by integration id.
    ///
    /// `endpoints` overrides the endpoint per integration id.
    pub async fn test_multiple(
        &self,
        configs: &[IntegrationConfig],
        endpoints: &HashMap<String, String>,
    ) -> HashMap<String, ConnectionTestResult> {
        let tests = configs.iter().map(|config| async move {
            let endpoint = endpoints.get(&config.id).map(String::as_str);
            (
                config.id.clone(),
                self.test_connection(config, endpoint).await,
            )
        });
        join_all(tests).await.into_iter().collect()
    }
}

/// Runs `check` up to `max_retries` times (at least once), sleeping
/// `delay * n` after the `n`th failure. Returns the first success or the last
/// failure.
pub async fn retry_linear<F, Fut>(
    max_retries: u32,
    delay: Duration,
    mut check: F,
) -> ConnectionTestResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ConnectionTestResult>,
{
    let attempts = max_retries.max(1);
    let mut attempt = 1;
    loop {
        let result = check().await;
        if result.success || attempt >= attempts {
            return result;
        }
        debug!(attempt, "retrying connection test");
        tokio::time::sleep(delay * attempt).await;
        attempt += 1;
    }
}

/// Applies the credentials to a request, returning the final URL and the
/// headers to send.
fn authenticate(
    endpoint: &str,
    credentials: Option<&IntegrationCredentials>,
) -> (String, Vec<(String, String)>) {
    let mut url = endpoint.to_string();
    let mut headers = Vec::new();

    match credentials {
        Some(
            IntegrationCredentials::Oauth2 { access_token, .. }
            | IntegrationCredentials::Jwt { access_token, .. }
            | IntegrationCredentials::Bearer { access_token, .. },
        ) => headers.push((AUTHORIZATION.to_string(), format!("Bearer {access_token}"))),
        Some(credentials @ IntegrationCredentials::ApiKey { .. }) => {
            if let Ok(adapter) = ApiKeyAdapter::from_credentials(credentials) {
                if adapter.config().query_param_name.is_some() {
                    url = adapter.append_to_url(endpoint);
                } else {
                    headers.extend(adapter.get_auth_headers());
                }
            }
        }
        Some(IntegrationCredentials::Basic {
            username, password, ..
        }) => {
            let encoded = STANDARD.encode(format!("{username}:{password}"));
            headers.push((AUTHORIZATION.to_string(), format!("Basic {encoded}")));
        }
        None => {}
    }

    (url, headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegrationType;
    use crate::credential::{CredentialMetadata, CredentialType};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn integration(id: &str, base_url: &str, credentials: IntegrationCredentials) -> IntegrationConfig {
        IntegrationConfig::new(id, "custom", IntegrationType::Crm, credentials.credential_type())
            .with_base_url(base_url)
            .with_credentials(credentials)
    }

    fn tester() -> ConnectionTester {
        ConnectionTester::new(reqwest::Client::new())
    }

    #[tokio::test]
    async fn bearer_success_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = integration("a", &server.uri(), IntegrationCredentials::bearer("tok"));
        let endpoint = format!("{}/me", server.uri());
        let result = tester().test_connection(&config, Some(&endpoint)).await;

        assert!(result.success, "{result:?}");
        assert!(result.latency_ms.is_some());
        let metadata = result.metadata.expect("metadata");
        assert_eq!(metadata["status"], 200);
        assert_eq!(metadata["status_text"], "OK");
    }

    #[tokio::test]
    async fn api_key_in_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("X-API-Key", "k1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let config = integration("a", &server.uri(), IntegrationCredentials::api_key("k1"));
        assert!(tester().test_connection(&config, None).await.success);
    }

    #[tokio::test]
    async fn api_key_in_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "k1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut metadata = CredentialMetadata::new();
        metadata.insert("query_param_name".to_string(), json!("key"));
        let credentials = IntegrationCredentials::ApiKey {
            api_key: "k1".to_string(),
            api_secret: None,
            metadata,
        };
        let config = integration("a", &server.uri(), credentials);
        assert!(tester().test_connection(&config, None).await.success);
    }

    #[tokio::test]
    async fn basic_auth_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = integration(
            "a",
            &server.uri(),
            IntegrationCredentials::basic("user", "pass"),
        );
        assert!(tester().test_connection(&config, None).await.success);
    }

    #[tokio::test]
    async fn non_success_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let config = integration("a", &server.uri(), IntegrationCredentials::bearer("bad"));
        let result = tester().test_connection(&config, None).await;

        assert!(!result.success);
        assert!(result.message.contains("401"));
        assert_eq!(result.metadata.expect("metadata")["status"], 401);
    }

    #[tokio::test]
    async fn timeout_is_failure_with_latency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config = integration("a", &server.uri(), IntegrationCredentials::bearer("tok"));
        let result = tester()
            .with_timeout(Duration::from_millis(50))
            .test_connection(&config, None)
            .await;

        assert!(!result.success);
        assert!(result.error.expect("error").contains("timed out"));
        assert!(result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn missing_endpoint_is_failure() {
        let config = IntegrationConfig::new(
            "a",
            "custom",
            IntegrationType::Crm,
            CredentialType::Bearer,
        );
        let result = tester().test_connection(&config, None).await;
        assert!(!result.success);
        assert!(result.latency_ms.is_none());
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = integration("a", &server.uri(), IntegrationCredentials::bearer("tok"));
        let result = tester()
            .test_with_retry(&config, None, 3, Duration::from_millis(5))
            .await;

        assert!(result.success);
        assert_eq!(server.received_requests().await.expect("recorded").len(), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let config = integration("a", &server.uri(), IntegrationCredentials::bearer("tok"));
        let result = tester()
            .test_with_retry(&config, None, 2, Duration::from_millis(5))
            .await;

        assert!(!result.success);
        assert!(result.message.contains("500"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_linearly() {
        let config =
            IntegrationConfig::new("a", "custom", IntegrationType::Crm, CredentialType::Bearer);
        let delay = Duration::from_millis(1000);

        for (attempts, waited) in [(1, 0), (3, 1000 + 2000), (4, 1000 + 2000 + 3000)] {
            let started = Instant::now();
            let result = tester().test_with_retry(&config, None, attempts, delay).await;

            assert!(!result.success);
            assert_eq!(started.elapsed(), Duration::from_millis(waited), "{attempts} attempts");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_at_first_success() {
        let mut calls = 0;
        let started = Instant::now();
        let result = retry_linear(5, Duration::from_millis(100), || {
            calls += 1;
            let result = if calls == 3 {
                ConnectionTestResult::ok("up")
            } else {
                ConnectionTestResult::failed("down", "503")
            };
            async move { result }
        })
        .await;

        assert!(result.success);
        assert_eq!(calls, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(100 + 200));
    }

    #[tokio::test]
    async fn multiple_keyed_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/up"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let configs = vec![
            integration("up", &format!("{}/up", server.uri()), IntegrationCredentials::bearer("t")),
            integration("down", &server.uri(), IntegrationCredentials::bearer("t")),
        ];
        let endpoints = HashMap::from([("down".to_string(), format!("{}/down", server.uri()))]);

        let results = tester().test_multiple(&configs, &endpoints).await;

        assert_eq!(results.len(), 2);
        assert!(results["up"].success);
        assert!(!results["down"].success);
    }
}
