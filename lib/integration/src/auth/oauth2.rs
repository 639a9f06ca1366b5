//! OAuth 2.0 authorization-code grant.
//!
//! The authorization URL is built with the `oauth2` crate. Token exchange,
//! refresh and revocation are plain form POSTs so that a provider's error
//! body reaches the caller unchanged.

use super::AuthHeaders;
use crate::clock::{Clock, saturating_add, system_clock};
use crate::credential::{CredentialMetadata, IntegrationCredentials};
use crate::error::{ConfigError, NetworkError};
use chrono::{DateTime, TimeDelta, Utc};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope};
use reqwest::header::ACCEPT;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// How far ahead of expiry `should_refresh_token` starts returning true.
pub const DEFAULT_REFRESH_BUFFER_MINUTES: i64 = 5;

/// OAuth 2.0 client registration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Fixed `state` value; a random one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Revocation endpoint; derived from `token_url` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,
}

impl fmt::Debug for OAuth2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Config")
            .field("client_id", &self.client_id)
            .field("authorization_url", &self.authorization_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl OAuth2Config {
    /// Returns the revocation endpoint.
    #[must_use]
    pub fn revoke_endpoint(&self) -> String {
        self.revoke_url
            .clone()
            .unwrap_or_else(|| self.token_url.replace("/token", "/revoke"))
    }
}

/// Kind of token being revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

impl TokenTypeHint {
    /// Returns the RFC 7009 hint value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Adapter for the authorization-code grant.
#[derive(Clone)]
pub struct OAuth2Adapter {
    config: OAuth2Config,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for OAuth2Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Adapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OAuth2Adapter {
    /// Creates an adapter that talks to the provider through `http`.
    #[must_use]
    pub fn new(config: OAuth2Config, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            clock: system_clock(),
        }
    }

    /// Replaces the clock used for expiry calculations.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }

    /// Builds the URL the user is redirected to for consent.
    ///
    /// The `state` is the argument, else the configured value, else a fresh
    /// random CSRF token.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the authorization or redirect URL
    /// does not parse.
    pub fn get_authorization_url(&self, state: Option<&str>) -> Result<String, Report<ConfigError>> {
        let auth_url = AuthUrl::new(self.config.authorization_url.clone()).map_err(|e| {
            ConfigError::InvalidUrl {
                url: self.config.authorization_url.clone(),
                reason: e.to_string(),
            }
        })?;
        let redirect_url = RedirectUrl::new(self.config.redirect_uri.clone()).map_err(|e| {
            ConfigError::InvalidUrl {
                url: self.config.redirect_uri.clone(),
                reason: e.to_string(),
            }
        })?;

        let client = BasicClient::new(ClientId::new(self.config.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.config.client_secret.clone()))
            .set_auth_uri(auth_url)
            .set_redirect_uri(redirect_url);

        let state = state.map(str::to_string).or_else(|| self.config.state.clone());
        let (url, _) = client
            .authorize_url(move || state.map_or_else(CsrfToken::new_random, CsrfToken::new))
            .add_scopes(self.config.scopes.iter().cloned().map(Scope::new))
            .url();

        Ok(url.to_string())
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::RequestFailed` carrying the provider's body on a
    /// non-2xx response, `NetworkError::InvalidResponse` if the token response
    /// is malformed or its `expires_in` is out of range, or another
    /// `NetworkError` if the call fails.
    #[instrument(skip(self, code), fields(token_url = %self.config.token_url))]
    pub async fn exchange_code_for_token(
        &self,
        code: &str,
    ) -> Result<IntegrationCredentials, Report<NetworkError>> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        let token = self.request_token(&params).await?;
        debug!("exchanged authorization code");
        self.to_credentials(token, None)
    }

    /// Obtains a new access token with a refresh token.
    ///
    /// The old refresh token is kept when the provider does not rotate it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::exchange_code_for_token`].
    #[instrument(skip(self, refresh_token), fields(token_url = %self.config.token_url))]
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<IntegrationCredentials, Report<NetworkError>> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let token = self.request_token(&params).await?;
        debug!("refreshed access token");
        self.to_credentials(token, Some(refresh_token))
    }

    /// Revokes a token at the provider.
    ///
    /// # Errors
    ///
    /// Returns a `NetworkError` if the provider rejects the request.
    #[instrument(skip(self, token))]
    pub async fn revoke_token(
        &self,
        token: &str,
        token_type_hint: Option<TokenTypeHint>,
    ) -> Result<(), Report<NetworkError>> {
        let mut params = vec![
            ("token", token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        if let Some(hint) = token_type_hint {
            params.push(("token_type_hint", hint.as_str()));
        }

        self.post_form(&self.config.revoke_endpoint(), &params)
            .await?;
        Ok(())
    }

    /// Returns whether the access token has expired.
    ///
    /// Credentials without an expiry never expire.
    #[must_use]
    pub fn is_token_expired(&self, credentials: &IntegrationCredentials) -> bool {
        credentials
            .expires_at()
            .is_some_and(|expires_at| self.clock.now() >= expires_at)
    }

    /// Returns whether the token expires within `buffer_minutes`.
    #[must_use]
    pub fn should_refresh_token(
        &self,
        credentials: &IntegrationCredentials,
        buffer_minutes: i64,
    ) -> bool {
        let buffer = TimeDelta::try_minutes(buffer_minutes).unwrap_or(if buffer_minutes < 0 {
            TimeDelta::MIN
        } else {
            TimeDelta::MAX
        });
        credentials
            .expires_at()
            .is_some_and(|expires_at| saturating_add(self.clock.now(), buffer) >= expires_at)
    }

    /// Returns the bearer authorization header for the credentials.
    #[must_use]
    pub fn get_auth_headers(&self, credentials: &IntegrationCredentials) -> AuthHeaders {
        credentials
            .access_token()
            .map(|token| ("Authorization".to_string(), format!("Bearer {token}")))
            .into_iter()
            .collect::<HashMap<_, _>>()
    }

    async fn request_token(
        &self,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, Report<NetworkError>> {
        let response = self.post_form(&self.config.token_url, params).await?;
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| NetworkError::InvalidResponse {
                reason: e.to_string(),
            })?;
        Ok(token)
    }

    async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<reqwest::Response, Report<NetworkError>> {
        let response = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(NetworkError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NetworkError::RequestFailed {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(response)
    }

    fn to_credentials(
        &self,
        token: TokenResponse,
        previous_refresh_token: Option<&str>,
    ) -> Result<IntegrationCredentials, Report<NetworkError>> {
        let expires_at: Option<DateTime<Utc>> = match token.expires_in {
            Some(seconds) => Some(
                TimeDelta::try_seconds(seconds)
                    .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
                    .ok_or_else(|| NetworkError::InvalidResponse {
                        reason: format!("expires_in out of range: {seconds}"),
                    })?,
            ),
            None => None,
        };
        let scope = match token.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => self.config.scopes.clone(),
        };
        let mut metadata = CredentialMetadata::new();
        if let Some(token_type) = token.token_type {
            metadata.insert("token_type".to_string(), JsonValue::String(token_type));
        }

        Ok(IntegrationCredentials::Oauth2 {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .or_else(|| previous_refresh_token.map(str::to_string)),
            expires_at,
            scope,
            client_id: Some(self.config.client_id.clone()),
            client_secret: Some(self.config.client_secret.clone()),
            metadata,
        })
    }
}
