//! Static API key authentication.

use super::AuthHeaders;
use crate::credential::{CredentialMetadata, IntegrationCredentials};
use crate::error::AuthError;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;

/// Header used when none is configured.
pub const DEFAULT_HEADER_NAME: &str = "X-API-Key";

const HEADER_NAME_KEY: &str = "header_name";
const PREFIX_KEY: &str = "prefix";
const QUERY_PARAM_KEY: &str = "query_param_name";

/// API key configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// The key itself.
    pub api_key: String,
    /// Header carrying the key. Defaults to `X-API-Key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Prepended to the key in the header value (e.g. `"Token "`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Query parameter carrying the key, for services that authenticate via
    /// the query string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_param_name: Option<String>,
}

impl fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("header_name", &self.header_name)
            .field("prefix", &self.prefix)
            .field("query_param_name", &self.query_param_name)
            .finish_non_exhaustive()
    }
}

impl ApiKeyConfig {
    /// Creates a header-only configuration.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            header_name: None,
            prefix: None,
            query_param_name: None,
        }
    }
}

/// Adapter for API key authentication.
#[derive(Debug, Clone)]
pub struct ApiKeyAdapter {
    config: ApiKeyConfig,
}

impl ApiKeyAdapter {
    /// Creates an adapter.
    #[must_use]
    pub fn new(config: ApiKeyConfig) -> Self {
        Self { config }
    }

    /// Rebuilds an adapter from stored credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are not API key credentials.
    pub fn from_credentials(credentials: &IntegrationCredentials) -> Result<Self, Report<AuthError>> {
        let IntegrationCredentials::ApiKey {
            api_key, metadata, ..
        } = credentials
        else {
            return Err(AuthError::CredentialTypeMismatch {
                expected: "api_key",
                actual: credentials.credential_type().as_str(),
            }
            .into());
        };

        let text = |key: &str| metadata.get(key).and_then(JsonValue::as_str).map(str::to_string);
        Ok(Self::new(ApiKeyConfig {
            api_key: api_key.clone(),
            header_name: text(HEADER_NAME_KEY),
            prefix: text(PREFIX_KEY),
            query_param_name: text(QUERY_PARAM_KEY),
        }))
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub fn config(&self) -> &ApiKeyConfig {
        &self.config
    }

    /// Returns the header name the key is sent in.
    #[must_use]
    pub fn header_name(&self) -> &str {
        self.config
            .header_name
            .as_deref()
            .unwrap_or(DEFAULT_HEADER_NAME)
    }

    /// Returns the authentication header.
    #[must_use]
    pub fn get_auth_headers(&self) -> AuthHeaders {
        let value = format!(
            "{}{}",
            self.config.prefix.as_deref().unwrap_or_default(),
            self.config.api_key
        );
        HashMap::from([(self.header_name().to_string(), value)])
    }

    /// Returns the query parameters carrying the key, if configured that way.
    #[must_use]
    pub fn get_auth_query_params(&self) -> HashMap<String, String> {
        self.config
            .query_param_name
            .iter()
            .map(|name| (name.clone(), self.config.api_key.clone()))
            .collect()
    }

    /// Appends the key to `url` as a query parameter.
    ///
    /// Returns the URL unchanged when no query parameter is configured.
    #[must_use]
    pub fn append_to_url(&self, url: &str) -> String {
        let Some(name) = self.config.query_param_name.as_deref() else {
            return url.to_string();
        };

        let separator = if url.ends_with('?') || url.ends_with('&') {
            ""
        } else if url.contains('?') {
            "&"
        } else {
            "?"
        };
        format!(
            "{url}{separator}{}={}",
            urlencoding::encode(name),
            urlencoding::encode(&self.config.api_key)
        )
    }

    /// Checks that a key is present.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::MissingApiKey` if the key is empty.
    pub fn validate(&self) -> Result<(), Report<AuthError>> {
        if self.config.api_key.trim().is_empty() {
            return Err(AuthError::MissingApiKey.into());
        }
        Ok(())
    }

    /// Packs the configuration into credentials.
    #[must_use]
    pub fn create_credentials(&self) -> IntegrationCredentials {
        let mut metadata = CredentialMetadata::new();
        let fields = [
            (HEADER_NAME_KEY, &self.config.header_name),
            (PREFIX_KEY, &self.config.prefix),
            (QUERY_PARAM_KEY, &self.config.query_param_name),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                metadata.insert(key.to_string(), JsonValue::String(value.clone()));
            }
        }

        IntegrationCredentials::ApiKey {
            api_key: self.config.api_key.clone(),
            api_secret: None,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_adapter() -> ApiKeyAdapter {
        ApiKeyAdapter::new(ApiKeyConfig {
            query_param_name: Some("token".to_string()),
            ..ApiKeyConfig::new("s3cr3t")
        })
    }

    #[test]
    fn default_header() {
        let adapter = ApiKeyAdapter::new(ApiKeyConfig::new("abc"));
        let headers = adapter.get_auth_headers();
        assert_eq!(headers.get("X-API-Key").map(String::as_str), Some("abc"));
        assert!(adapter.get_auth_query_params().is_empty());
    }

    #[test]
    fn custom_header_with_prefix() {
        let adapter = ApiKeyAdapter::new(ApiKeyConfig {
            header_name: Some("Authorization".to_string()),
            prefix: Some("Token ".to_string()),
            ..ApiKeyConfig::new("abc")
        });
        let headers = adapter.get_auth_headers();
        assert_eq!(
            headers.get("Authorization").map(String::as_str),
            Some("Token abc")
        );
    }

    #[test]
    fn append_uses_ampersand_after_existing_query() {
        let url = query_adapter().append_to_url("https://x/y?a=1");
        assert_eq!(url, "https://x/y?a=1&token=s3cr3t");
    }

    #[test]
    fn append_uses_question_mark_without_query() {
        let url = query_adapter().append_to_url("https://x/y");
        assert_eq!(url, "https://x/y?token=s3cr3t");
    }

    #[test]
    fn append_does_not_double_separator() {
        assert_eq!(
            query_adapter().append_to_url("https://x/y?"),
            "https://x/y?token=s3cr3t"
        );
        assert_eq!(
            query_adapter().append_to_url("https://x/y?a=1&"),
            "https://x/y?a=1&token=s3cr3t"
        );
    }

    #[test]
    fn append_encodes_key() {
        let adapter = ApiKeyAdapter::new(ApiKeyConfig {
            query_param_name: Some("key".to_string()),
            ..ApiKeyConfig::new("a b&c")
        });
        assert_eq!(adapter.append_to_url("https://x"), "https://x?key=a%20b%26c");
    }

    #[test]
    fn append_without_query_param_is_noop() {
        let adapter = ApiKeyAdapter::new(ApiKeyConfig::new("abc"));
        assert_eq!(adapter.append_to_url("https://x/y"), "https://x/y");
    }

    #[test]
    fn validate_rejects_empty_key() {
        let err = ApiKeyAdapter::new(ApiKeyConfig::new("  "))
            .validate()
            .expect_err("empty key");
        assert!(err.to_string().contains("API key is required"));
        assert!(ApiKeyAdapter::new(ApiKeyConfig::new("k")).validate().is_ok());
    }

    #[test]
    fn credentials_round_trip() {
        let adapter = ApiKeyAdapter::new(ApiKeyConfig {
            header_name: Some("X-Token".to_string()),
            prefix: Some("Key ".to_string()),
            query_param_name: Some("api_key".to_string()),
            ..ApiKeyConfig::new("abc")
        });

        let credentials = adapter.create_credentials();
        let restored = ApiKeyAdapter::from_credentials(&credentials).expect("api key credentials");
        assert_eq!(restored.config(), adapter.config());
    }

    #[test]
    fn from_credentials_rejects_other_types() {
        let credentials = IntegrationCredentials::oauth2("token");
        let err = ApiKeyAdapter::from_credentials(&credentials).expect_err("wrong type");
        assert!(err.to_string().contains("oauth2"));
    }
}
