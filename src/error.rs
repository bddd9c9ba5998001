use std::time::Duration;

use axum::http::header::{CONTENT_TYPE, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::cors::CorsHeaders;

/// Gateway-wide error taxonomy.
///
/// Every failure is classified at the point where it happens; the HTTP status
/// and public `code` are derived from the variant, never from message text.
///
/// # Upstream Errors
///
/// - `UpstreamTimeout` - a single attempt exceeded the service timeout
/// - `UpstreamUnavailable` - connection-level failure (refused, DNS, reset)
/// - `UpstreamServerError` - the upstream answered with a retryable 5xx
/// - `RetriesExhausted` - every attempt failed; wraps the last failure
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no route found for path: {0}")]
    RouteNotFound(String),

    #[error("upstream {service} timed out after {timeout:?}")]
    UpstreamTimeout { service: String, timeout: Duration },

    #[error("upstream {service} unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    #[error("upstream {service} returned retryable status {status}")]
    UpstreamServerError { service: String, status: StatusCode },

    #[error("all {attempts} attempts failed: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<GatewayError>,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("authorization header missing or malformed")]
    AuthMissing,

    #[error("token has expired")]
    AuthExpired,

    #[error("invalid token: {0}")]
    AuthInvalid(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: u64 },

    #[error("proxy error: {0}")]
    InternalProxyError(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Public error codes returned in the `code` field of error bodies.
pub mod codes {
    pub const ROUTE_NOT_FOUND: &str = "ROUTE_NOT_FOUND";
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const PROXY_ERROR: &str = "PROXY_ERROR";
    pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION_FAILED";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
}

impl GatewayError {
    /// The failure that decides classification.
    ///
    /// `RetriesExhausted` is classified as whatever the last attempt hit.
    fn root(&self) -> &GatewayError {
        match self {
            GatewayError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// HTTP status sent to the client.
    pub fn status(&self) -> StatusCode {
        match self.root() {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamTimeout { .. } | GatewayError::Cancelled => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamServerError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::AuthMissing | GatewayError::AuthExpired | GatewayError::AuthInvalid(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InternalProxyError(_)
            | GatewayError::Config(_)
            | GatewayError::RetriesExhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Fixed taxonomy code for the `code` field.
    pub fn code(&self) -> &'static str {
        match self.root() {
            GatewayError::RouteNotFound(_) => codes::ROUTE_NOT_FOUND,
            GatewayError::UpstreamTimeout { .. } | GatewayError::Cancelled => codes::TIMEOUT_ERROR,
            GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamServerError { .. } => {
                codes::SERVICE_UNAVAILABLE
            }
            GatewayError::AuthMissing | GatewayError::AuthExpired | GatewayError::AuthInvalid(_) => {
                codes::AUTHENTICATION_FAILED
            }
            GatewayError::RateLimitExceeded { .. } => codes::RATE_LIMIT_EXCEEDED,
            _ => codes::PROXY_ERROR,
        }
    }

    /// Short client-facing message. Internal details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self.root() {
            GatewayError::RouteNotFound(_) => "Endpoint not found",
            GatewayError::UpstreamTimeout { .. } | GatewayError::Cancelled => "Request timeout",
            GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamServerError { .. } => {
                "Upstream service unavailable"
            }
            GatewayError::AuthMissing => "Authorization header required",
            GatewayError::AuthExpired => "Token has expired",
            GatewayError::AuthInvalid(_) => "Invalid token",
            GatewayError::RateLimitExceeded { .. } => "Rate limit exceeded",
            _ => "Internal server error",
        }
    }

    /// Whether the proxy may try the same upstream again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTimeout { .. }
                | GatewayError::UpstreamUnavailable { .. }
                | GatewayError::UpstreamServerError { .. }
        )
    }

    /// Label used for the `errors_total` metric.
    pub fn metric_kind(&self) -> &'static str {
        match self.root() {
            GatewayError::RouteNotFound(_) => "validation",
            GatewayError::UpstreamTimeout { .. } => "timeout",
            GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamServerError { .. } => {
                "upstream"
            }
            GatewayError::Cancelled => "cancelled",
            GatewayError::AuthMissing | GatewayError::AuthExpired | GatewayError::AuthInvalid(_) => {
                "auth"
            }
            GatewayError::RateLimitExceeded { .. } => "rate_limit",
            _ => "internal",
        }
    }
}

/// JSON body for every error the gateway produces itself.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        let retry_after = match err.root() {
            GatewayError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        };
        Self {
            error: err.public_message(),
            code: err.code(),
            retry_after,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        json_error_response(self.status(), &ErrorBody::from(&self), HeaderMap::new())
    }
}

/// Build a JSON error response carrying the default CORS headers.
///
/// `extra` headers are applied last (e.g. rate limit headers).
pub fn json_error_response(status: StatusCode, body: &ErrorBody, extra: HeaderMap) -> Response {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| {
        br#"{"error":"Internal server error","code":"PROXY_ERROR"}"#.to_vec()
    });

    let mut response = (status, payload).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    CorsHeaders::default().apply(None, headers);
    headers.extend(extra);
    response
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;
