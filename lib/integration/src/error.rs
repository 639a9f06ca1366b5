//! Error types for the integration crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `AuthError`: Credential, JWT and API key failures
//! - `NetworkError`: HTTP failures talking to providers
//! - `ConfigError`: Invalid or incomplete integration configuration
//! - `StoreError`: Failures in the rate limit / quota state store
//! - `IntegrationError`: High-level wrapper for context
//!
//! Admission denials (rate limit, quota) are not errors; they are reported
//! as `false` plus an event.

use std::fmt;

/// Errors from authentication material handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// API key is empty.
    MissingApiKey,
    /// Credential is of a different type than the adapter expects.
    CredentialTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    /// Token is not made of three dot-separated segments.
    InvalidFormat { reason: String },
    /// Token signature does not match.
    InvalidSignature,
    /// Token segment could not be decoded.
    InvalidPayload { reason: String },
    /// Token `exp` claim is in the past.
    TokenExpired,
    /// Token `iss` claim does not match.
    InvalidIssuer { expected: String },
    /// Token `aud` claim does not match.
    InvalidAudience { expected: String },
    /// Duration string could not be parsed.
    InvalidDuration { value: String },
    /// Signing algorithm is not supported.
    UnsupportedAlgorithm { algorithm: String },
    /// Signing key could not be used.
    SigningFailed { reason: String },
    /// No refresh token is available.
    MissingRefreshToken,
    /// Refreshing credentials with the provider failed (use as context wrapper).
    RefreshFailed { provider: String },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingApiKey => write!(f, "API key is required"),
            Self::CredentialTypeMismatch { expected, actual } => {
                write!(f, "expected {expected} credentials, got {actual}")
            }
            Self::InvalidFormat { reason } => write!(f, "invalid token format: {reason}"),
            Self::InvalidSignature => write!(f, "invalid token signature"),
            Self::InvalidPayload { reason } => write!(f, "invalid token payload: {reason}"),
            Self::TokenExpired => write!(f, "token has expired"),
            Self::InvalidIssuer { expected } => {
                write!(f, "invalid token issuer, expected '{expected}'")
            }
            Self::InvalidAudience { expected } => {
                write!(f, "invalid token audience, expected '{expected}'")
            }
            Self::InvalidDuration { value } => write!(f, "invalid duration: '{value}'"),
            Self::UnsupportedAlgorithm { algorithm } => {
                write!(f, "unsupported signing algorithm: {algorithm}")
            }
            Self::SigningFailed { reason } => write!(f, "signing failed: {reason}"),
            Self::MissingRefreshToken => write!(f, "no refresh token available"),
            Self::RefreshFailed { provider } => {
                write!(f, "credential refresh with '{provider}' failed")
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// Errors from HTTP calls to providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Request could not be sent or the connection dropped.
    ConnectionFailed { reason: String },
    /// Provider answered with a non-2xx status.
    RequestFailed { status: u16, body: String },
    /// Request did not complete in time.
    Timeout { after_ms: u64 },
    /// Response body could not be understood.
    InvalidResponse { reason: String },
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => write!(f, "connection failed: {reason}"),
            Self::RequestFailed { status, body } => {
                if body.is_empty() {
                    write!(f, "request failed with status {status}")
                } else {
                    write!(f, "request failed with status {status}: {body}")
                }
            }
            Self::Timeout { after_ms } => write!(f, "request timed out after {after_ms}ms"),
            Self::InvalidResponse { reason } => write!(f, "invalid response: {reason}"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse {
                reason: err.to_string(),
            }
        } else {
            Self::ConnectionFailed {
                reason: err.to_string(),
            }
        }
    }
}

/// Errors from integration configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Webhook-based integration has no URL to post to.
    MissingWebhookUrl,
    /// WhatsApp integration has no phone-number id.
    MissingPhoneNumberId,
    /// No connector exists for the integration name.
    UnknownConnector { name: String },
    /// A URL could not be parsed.
    InvalidUrl { url: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingWebhookUrl => write!(f, "webhook URL is not configured"),
            Self::MissingPhoneNumberId => write!(f, "phone number id is not configured"),
            Self::UnknownConnector { name } => write!(f, "no connector for '{name}'"),
            Self::InvalidUrl { url, reason } => write!(f, "invalid URL '{url}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors from the rate limit / quota state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Compare-and-swap kept losing against concurrent writers.
    Contention { key: String, attempts: u32 },
    /// Backend failure.
    Backend { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contention { key, attempts } => {
                write!(f, "gave up updating '{key}' after {attempts} attempts")
            }
            Self::Backend { reason } => write!(f, "state store failure: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// High-level integration errors.
///
/// Use these to add context when wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// Integration is not registered.
    NotFound { id: String },
    /// Integration configuration was rejected.
    InvalidConfig { id: String },
    /// Integration is registered but disabled.
    Disabled { id: String },
    /// Integration has no webhook connector.
    NotAWebhook { id: String },
    /// Credential refresh context (use as context wrapper).
    CredentialRefresh { id: String },
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "integration not found: {id}"),
            Self::InvalidConfig { id } => write!(f, "invalid configuration for integration {id}"),
            Self::Disabled { id } => write!(f, "integration '{id}' is disabled"),
            Self::NotAWebhook { id } => write!(f, "integration {id} does not deliver webhooks"),
            Self::CredentialRefresh { id } => {
                write!(f, "credential refresh failed for integration {id}")
            }
        }
    }
}

impl std::error::Error for IntegrationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_display() {
        let err = AuthError::CredentialTypeMismatch {
            expected: "api_key",
            actual: "oauth2",
        };
        assert!(err.to_string().contains("api_key"));
        assert!(err.to_string().contains("oauth2"));
        assert!(AuthError::TokenExpired.to_string().contains("expired"));
    }

    #[test]
    fn network_error_carries_provider_body() {
        let err = NetworkError::RequestFailed {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("invalid_grant"));

        let empty = NetworkError::RequestFailed {
            status: 503,
            body: String::new(),
        };
        assert_eq!(empty.to_string(), "request failed with status 503");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::UnknownConnector {
            name: "fax".to_string(),
        };
        assert!(err.to_string().contains("fax"));
    }

    #[test]
    fn integration_error_display() {
        let err = IntegrationError::CredentialRefresh {
            id: "gmail-primary".to_string(),
        };
        assert!(err.to_string().contains("gmail-primary"));
    }
}
