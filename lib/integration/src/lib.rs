//! Credential and traffic-control layer for switchboard integrations.
//!
//! This crate provides:
//!
//! - **Auth adapters**: API key, HMAC-signed JWT and OAuth 2.0 authorization-code
//! - **Rate limiter**: Fixed, sliding and token-bucket admission per key
//! - **Quota manager**: Daily, monthly and per-user usage ceilings
//! - **Connection tester**: Authenticated health checks with retry
//! - **Connectors**: Gmail, Outlook, LinkedIn, Zapier, Make and WhatsApp
//! - **Integration manager**: Registry, admission facade and event bus
//!
//! Runtime state lives behind the [`StateStore`] trait. The default
//! [`MemoryStore`] keeps it in process.

pub mod auth;
pub mod clock;
pub mod config;
pub mod connector;
pub mod credential;
pub mod error;
pub mod event;
pub mod manager;
pub mod quota;
pub mod rate_limit;
pub mod store;
pub mod tester;

pub use auth::{ApiKeyAdapter, ApiKeyConfig, JwtAdapter, JwtConfig, OAuth2Adapter, OAuth2Config};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{IntegrationConfig, IntegrationType};
pub use connector::{
    Connector, OAuthConnector, WebhookConnector, WebhookDelivery, WhatsAppConnector,
    build_connector,
};
pub use credential::{CredentialType, IntegrationCredentials};
pub use error::{AuthError, ConfigError, IntegrationError, NetworkError, StoreError};
pub use event::{EventListener, IntegrationEvent, IntegrationEventType, WILDCARD};
pub use manager::{IntegrationManager, IntegrationManagerBuilder};
pub use quota::{IntegrationUsage, QuotaConfig, QuotaManager};
pub use rate_limit::{RateLimitConfig, RateLimitStrategy, RateLimiter};
pub use store::{MemoryStore, StateStore};
pub use tester::{ConnectionTestResult, ConnectionTester, retry_linear};
