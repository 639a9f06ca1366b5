//! Integration credentials.
//!
//! Credentials are handed to the manager by the caller, which owns their
//! persistence. Adapters read them to build request authentication and
//! replace them when tokens are refreshed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Adapter-specific credential metadata.
pub type CredentialMetadata = Map<String, JsonValue>;

/// The type of credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// OAuth 2.0 tokens.
    Oauth2,
    /// API key.
    ApiKey,
    /// Signed JSON Web Token.
    Jwt,
    /// Username and password.
    Basic,
    /// Bearer token.
    Bearer,
}

impl CredentialType {
    /// Returns the wire name of the credential type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Oauth2 => "oauth2",
            Self::ApiKey => "api_key",
            Self::Jwt => "jwt",
            Self::Basic => "basic",
            Self::Bearer => "bearer",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication material for one integration.
///
/// `Debug` output masks tokens, keys, secrets and passwords.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrationCredentials {
    /// OAuth 2.0 tokens.
    Oauth2 {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default)]
        scope: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(default)]
        metadata: CredentialMetadata,
    },
    /// Static API key.
    ApiKey {
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_secret: Option<String>,
        #[serde(default)]
        metadata: CredentialMetadata,
    },
    /// Signed JWT.
    Jwt {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default)]
        metadata: CredentialMetadata,
    },
    /// Basic authentication.
    Basic {
        username: String,
        password: String,
        #[serde(default)]
        metadata: CredentialMetadata,
    },
    /// Opaque bearer token.
    Bearer {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default)]
        metadata: CredentialMetadata,
    },
}

const REDACTED: &str = "[redacted]";

fn redact(secret: Option<&String>) -> Option<&'static str> {
    secret.map(|_| REDACTED)
}

impl fmt::Debug for IntegrationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oauth2 {
                refresh_token,
                expires_at,
                scope,
                client_id,
                client_secret,
                metadata,
                ..
            } => f
                .debug_struct("Oauth2")
                .field("access_token", &REDACTED)
                .field("refresh_token", &redact(refresh_token.as_ref()))
                .field("expires_at", expires_at)
                .field("scope", scope)
                .field("client_id", client_id)
                .field("client_secret", &redact(client_secret.as_ref()))
                .field("metadata", metadata)
                .finish(),
            Self::ApiKey {
                api_secret,
                metadata,
                ..
            } => f
                .debug_struct("ApiKey")
                .field("api_key", &REDACTED)
                .field("api_secret", &redact(api_secret.as_ref()))
                .field("metadata", metadata)
                .finish(),
            Self::Jwt {
                expires_at,
                metadata,
                ..
            } => f
                .debug_struct("Jwt")
                .field("access_token", &REDACTED)
                .field("expires_at", expires_at)
                .field("metadata", metadata)
                .finish(),
            Self::Basic {
                username, metadata, ..
            } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &REDACTED)
                .field("metadata", metadata)
                .finish(),
            Self::Bearer {
                expires_at,
                metadata,
                ..
            } => f
                .debug_struct("Bearer")
                .field("access_token", &REDACTED)
                .field("expires_at", expires_at)
                .field("metadata", metadata)
                .finish(),
        }
    }
}

impl IntegrationCredentials {
    /// Creates OAuth2 credentials with only an access token.
    #[must_use]
    pub fn oauth2(access_token: impl Into<String>) -> Self {
        Self::Oauth2 {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scope: Vec::new(),
            client_id: None,
            client_secret: None,
            metadata: CredentialMetadata::new(),
        }
    }

    /// Creates API key credentials.
    #[must_use]
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            api_key: key.into(),
            api_secret: None,
            metadata: CredentialMetadata::new(),
        }
    }

    /// Creates basic auth credentials.
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
            metadata: CredentialMetadata::new(),
        }
    }

    /// Creates bearer token credentials.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            access_token: token.into(),
            expires_at: None,
            metadata: CredentialMetadata::new(),
        }
    }

    /// Returns the credential type.
    #[must_use]
    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::Oauth2 { .. } => CredentialType::Oauth2,
            Self::ApiKey { .. } => CredentialType::ApiKey,
            Self::Jwt { .. } => CredentialType::Jwt,
            Self::Basic { .. } => CredentialType::Basic,
            Self::Bearer { .. } => CredentialType::Bearer,
        }
    }

    /// Returns the token sent as `Authorization: Bearer`, if this kind has one.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Oauth2 { access_token, .. }
            | Self::Jwt { access_token, .. }
            | Self::Bearer { access_token, .. } => Some(access_token),
            Self::ApiKey { .. } | Self::Basic { .. } => None,
        }
    }

    /// Returns the OAuth2 refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Self::Oauth2 { refresh_token, .. } => refresh_token.as_deref(),
            _ => None,
        }
    }

    /// Returns when the access token expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Oauth2 { expires_at, .. }
            | Self::Jwt { expires_at, .. }
            | Self::Bearer { expires_at, .. } => *expires_at,
            Self::ApiKey { .. } | Self::Basic { .. } => None,
        }
    }

    /// Returns the adapter-specific metadata.
    #[must_use]
    pub fn metadata(&self) -> &CredentialMetadata {
        match self {
            Self::Oauth2 { metadata, .. }
            | Self::ApiKey { metadata, .. }
            | Self::Jwt { metadata, .. }
            | Self::Basic { metadata, .. }
            | Self::Bearer { metadata, .. } => metadata,
        }
    }

    /// Returns a string metadata value.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata().get(key).and_then(JsonValue::as_str)
    }
}
