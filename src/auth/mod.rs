//! Bearer token validation.
//!
//! The gateway never verifies credentials itself; it hands the bearer token to
//! a [`TokenValidator`] and attaches the returned [`UserContext`] to the request.

mod jwt;

pub use jwt::{JwtValidator, TokenClaims};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Identity of an authenticated caller, attached to request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserContext {
    pub user_id: String,
    pub email: String,
    pub token_type: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Validates bearer tokens and resolves them to a caller identity.
pub trait TokenValidator: Send + Sync {
    fn validate_token(&self, token: &str) -> Result<UserContext, TokenError>;
}

/// Extract the token from an `Authorization` header value.
///
/// Accepts exactly `<scheme> <token>` where the scheme is `Bearer` in any
/// case and the token is non-empty. Anything else yields `None`.
///
/// # Example
///
/// ```
/// use hcaas_gateway::auth::extract_bearer_token;
///
/// assert_eq!(extract_bearer_token("bearer abc.def"), Some("abc.def"));
/// assert_eq!(extract_bearer_token("Basic abc"), None);
/// assert_eq!(extract_bearer_token("Bearer "), None);
/// ```
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    if token.is_empty() || token.starts_with(char::is_whitespace) {
        return None;
    }
    Some(token)
}
