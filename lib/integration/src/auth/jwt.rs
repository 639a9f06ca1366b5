//! HMAC-SHA256 signed JSON Web Tokens.
//!
//! Tokens are assembled and checked directly from the `hmac` and `sha2`
//! primitives. Only `HS256` is supported.

use super::AuthHeaders;
use crate::clock::{Clock, system_clock};
use crate::credential::{CredentialMetadata, IntegrationCredentials};
use crate::error::AuthError;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Decoded token claims.
pub type JwtClaims = Map<String, JsonValue>;

/// The only supported signing algorithm.
pub const HS256: &str = "HS256";

/// Token lifetime, either in seconds or as `<digits><s|m|h|d>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl From<u64> for ExpiresIn {
    fn from(seconds: u64) -> Self {
        Self::Seconds(seconds)
    }
}

impl From<&str> for ExpiresIn {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl fmt::Display for ExpiresIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds(seconds) => write!(f, "{seconds}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// JWT signing configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<ExpiresIn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

fn default_algorithm() -> String {
    HS256.to_string()
}

impl JwtConfig {
    /// Creates an `HS256` configuration with no expiry, issuer or audience.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: default_algorithm(),
            expires_in: None,
            issuer: None,
            audience: None,
        }
    }
}

/// Adapter for signing and verifying JWTs.
#[derive(Clone)]
pub struct JwtAdapter {
    config: JwtConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("algorithm", &self.algorithm)
            .field("expires_in", &self.expires_in)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for JwtAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JwtAdapter {
    /// Creates an adapter using the system clock.
    #[must_use]
    pub fn new(config: JwtConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
        }
    }

    /// Replaces the clock used for `iat`, `exp` and expiry checks.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    /// Signs a token carrying `payload` plus the configured registered claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm is unsupported or `expires_in`
    /// cannot be parsed.
    pub fn generate_token(&self, payload: &JwtClaims) -> Result<String, Report<AuthError>> {
        self.ensure_supported()?;

        let now = self.clock.now().timestamp();
        let mut claims = payload.clone();
        claims.insert("iat".to_string(), json!(now));
        if let Some(expires_in) = &self.config.expires_in {
            let seconds = parse_expires_in(expires_in)?;
            let seconds = i64::try_from(seconds).map_err(|_| AuthError::InvalidDuration {
                value: expires_in.to_string(),
            })?;
            claims.insert("exp".to_string(), json!(now.saturating_add(seconds)));
        }
        if let Some(issuer) = &self.config.issuer {
            claims.insert("iss".to_string(), json!(issuer));
        }
        if let Some(audience) = &self.config.audience {
            claims.insert("aud".to_string(), json!(audience));
        }

        let header = json!({ "alg": self.config.algorithm, "typ": "JWT" });
        let signing_input = format!(
            "{}.{}",
            base64url_encode(header.to_string().as_bytes()),
            base64url_encode(JsonValue::Object(claims).to_string().as_bytes())
        );
        let signature = self.sign(signing_input.as_bytes())?;

        Ok(format!("{signing_input}.{}", base64url_encode(&signature)))
    }

    /// Verifies the signature and registered claims, returning the claims.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat`, `InvalidSignature`, `InvalidPayload`,
    /// `TokenExpired`, `InvalidIssuer` or `InvalidAudience`.
    pub fn verify_token(&self, token: &str) -> Result<JwtClaims, Report<AuthError>> {
        self.ensure_supported()?;

        let segments: Vec<&str> = token.split('.').collect();
        let [header, payload, signature] = segments.as_slice() else {
            return Err(AuthError::InvalidFormat {
                reason: format!("expected 3 segments, found {}", segments.len()),
            }
            .into());
        };

        let signature = base64url_decode(signature).map_err(|_| AuthError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(format!("{header}.{payload}").as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let claims = decode_segment(payload)?;

        if let Some(exp) = claims.get("exp").and_then(JsonValue::as_i64)
            && self.clock.now().timestamp() >= exp
        {
            return Err(AuthError::TokenExpired.into());
        }

        if let Some(issuer) = &self.config.issuer
            && claims.get("iss").and_then(JsonValue::as_str) != Some(issuer.as_str())
        {
            return Err(AuthError::InvalidIssuer {
                expected: issuer.clone(),
            }
            .into());
        }

        if let Some(audience) = &self.config.audience
            && !audience_matches(claims.get("aud"), audience)
        {
            return Err(AuthError::InvalidAudience {
                expected: audience.clone(),
            }
            .into());
        }

        Ok(claims)
    }

    /// Decodes the claims without checking the signature or expiry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` or `InvalidPayload`.
    pub fn decode_token(&self, token: &str) -> Result<JwtClaims, Report<AuthError>> {
        let segments: Vec<&str> = token.split('.').collect();
        let [_, payload, _] = segments.as_slice() else {
            return Err(AuthError::InvalidFormat {
                reason: format!("expected 3 segments, found {}", segments.len()),
            }
            .into());
        };
        decode_segment(payload)
    }

    /// Returns whether the token's `exp` has passed.
    ///
    /// Tokens that cannot be decoded count as expired. Tokens without `exp`
    /// never expire.
    #[must_use]
    pub fn is_token_expired(&self, token: &str) -> bool {
        match self.decode_token(token) {
            Ok(claims) => claims
                .get("exp")
                .and_then(JsonValue::as_i64)
                .is_some_and(|exp| self.clock.now().timestamp() >= exp),
            Err(_) => true,
        }
    }

    /// Returns the bearer authorization header for `token`.
    #[must_use]
    pub fn get_auth_headers(&self, token: &str) -> AuthHeaders {
        HashMap::from([("Authorization".to_string(), format!("Bearer {token}"))])
    }

    /// Signs `payload` and wraps the token as JWT credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be generated.
    pub fn create_credentials(
        &self,
        payload: &JwtClaims,
    ) -> Result<IntegrationCredentials, Report<AuthError>> {
        let token = self.generate_token(payload)?;
        let expires_at = self
            .decode_token(&token)?
            .get("exp")
            .and_then(JsonValue::as_i64)
            .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));

        Ok(IntegrationCredentials::Jwt {
            access_token: token,
            expires_at,
            metadata: CredentialMetadata::new(),
        })
    }

    fn ensure_supported(&self) -> Result<(), Report<AuthError>> {
        if self.config.algorithm != HS256 {
            return Err(AuthError::UnsupportedAlgorithm {
                algorithm: self.config.algorithm.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn mac(&self) -> Result<HmacSha256, Report<AuthError>> {
        HmacSha256::new_from_slice(self.config.secret.as_bytes()).map_err(|e| {
            AuthError::SigningFailed {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, Report<AuthError>> {
        let mut mac = self.mac()?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Converts a lifetime into seconds.
///
/// The whole string must match: surrounding whitespace is trimmed, but text
/// such as `x10m` or `10mm` is rejected rather than having a `10m` picked out
/// of it.
///
/// # Errors
///
/// Returns `AuthError::InvalidDuration` unless the text is one or more
/// digits followed by exactly one of `s`, `m`, `h` or `d`.
pub fn parse_expires_in(value: &ExpiresIn) -> Result<u64, Report<AuthError>> {
    let text = match value {
        ExpiresIn::Seconds(seconds) => return Ok(*seconds),
        ExpiresIn::Text(text) => text.trim(),
    };
    let invalid = || AuthError::InvalidDuration {
        value: text.to_string(),
    };

    let Some(unit) = text.chars().last() else {
        return Err(invalid().into());
    };
    let digits = &text[..text.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid().into());
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => return Err(invalid().into()),
    };
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| invalid().into())
}

/// Base64url without padding.
#[must_use]
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes base64url, restoring any stripped padding first.
///
/// # Errors
///
/// Returns `AuthError::InvalidPayload` if the input is not base64url.
pub fn base64url_decode(text: &str) -> Result<Vec<u8>, Report<AuthError>> {
    let mut padded = text.trim_end_matches('=').to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    URL_SAFE.decode(padded).map_err(|e| {
        AuthError::InvalidPayload {
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode_segment(segment: &str) -> Result<JwtClaims, Report<AuthError>> {
    let bytes = base64url_decode(segment)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        AuthError::InvalidPayload {
            reason: e.to_string(),
        }
        .into()
    })
}

fn audience_matches(claim: Option<&JsonValue>, expected: &str) -> bool {
    match claim {
        Some(JsonValue::String(aud)) => aud == expected,
        Some(JsonValue::Array(values)) => values
            .iter()
            .any(|value| value.as_str() == Some(expected)),
        _ => false,
    }
}
