//! Authentication adapters.
//!
//! Each adapter turns one kind of credential configuration into request
//! authentication (headers, query parameters, signed tokens) and knows how to
//! validate or refresh it.

pub mod api_key;
pub mod jwt;
pub mod oauth2;

use std::collections::HashMap;

pub use api_key::{ApiKeyAdapter, ApiKeyConfig};
pub use jwt::{ExpiresIn, JwtAdapter, JwtConfig};
pub use oauth2::{OAuth2Adapter, OAuth2Config, TokenTypeHint};

/// Header name to value.
pub type AuthHeaders = HashMap<String, String>;
