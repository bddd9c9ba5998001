//! Bearer token authentication middleware.
//!
//! Requests whose path starts with a public prefix pass through untouched.
//! Everything else must carry `Authorization: Bearer <token>`; the token is
//! handed to the configured [`TokenValidator`] and the resulting
//! [`UserContext`] is stored in request extensions.
//!
//! # Modes
//!
//! - [`AuthMode::Required`]: failures are answered `401` immediately
//! - [`AuthMode::Optional`]: failures are logged and the request continues
//!   without an identity
//!
//! Every outcome is recorded as an auth validation metric with its latency.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::ClientIpExt;
use crate::auth::{TokenError, TokenValidator, UserContext, extract_bearer_token};
use crate::error::GatewayError;
use crate::metrics;

/// Whether authentication failures block the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    Required,
    Optional,
}

/// Result labels for the auth metric.
mod outcome {
    pub const SUCCESS: &str = "success";
    pub const EXPIRED: &str = "expired";
    pub const INVALID: &str = "invalid";
    pub const MISSING: &str = "missing";
}

#[derive(Clone)]
pub struct AuthLayer {
    validator: Arc<dyn TokenValidator>,
    public_paths: Arc<Vec<String>>,
    mode: AuthMode,
}

impl AuthLayer {
    pub fn new(validator: Arc<dyn TokenValidator>, public_paths: Vec<String>) -> Self {
        Self {
            validator,
            public_paths: Arc::new(public_paths),
            mode: AuthMode::Required,
        }
    }

    /// Attach identity when possible but never block.
    pub fn optional(mut self) -> Self {
        self.mode = AuthMode::Optional;
        self
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            validator: self.validator.clone(),
            public_paths: self.public_paths.clone(),
            mode: self.mode,
        }
    }
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    validator: Arc<dyn TokenValidator>,
    public_paths: Arc<Vec<String>>,
    mode: AuthMode,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        let path = req.uri().path();
        if is_public_path(&self.public_paths, path) {
            debug!(path, "Public path, skipping authentication");
            return Box::pin(async move { inner.call(req).await });
        }

        let start = Instant::now();
        let result = authenticate(self.validator.as_ref(), &req);

        let label = match &result {
            Ok(_) => outcome::SUCCESS,
            Err(GatewayError::AuthExpired) => outcome::EXPIRED,
            Err(GatewayError::AuthMissing) => outcome::MISSING,
            Err(_) => outcome::INVALID,
        };
        metrics::record_auth_validation(label, start.elapsed());

        match result {
            Ok(user) => {
                debug!(user_id = %user.user_id, "Authenticated request");
                req.extensions_mut().insert(user);
            }
            Err(err) => {
                warn!(
                    path = %req.uri().path(),
                    client_ip = %req.client_ip(),
                    error = %err,
                    blocking = self.mode == AuthMode::Required,
                    "Authentication failed"
                );
                if self.mode == AuthMode::Required {
                    metrics::record_error(metrics::component::AUTH, err.metric_kind());
                    return Box::pin(async move { Ok(err.into_response()) });
                }
            }
        }

        Box::pin(async move { inner.call(req).await })
    }
}

/// Whether `path` starts with any public prefix.
pub fn is_public_path(public_paths: &[String], path: &str) -> bool {
    public_paths.iter().any(|p| path.starts_with(p.as_str()))
}

fn authenticate<B>(
    validator: &dyn TokenValidator,
    req: &Request<B>,
) -> Result<UserContext, GatewayError> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or(GatewayError::AuthMissing)?;

    validator.validate_token(token).map_err(|e| match e {
        TokenError::Expired => GatewayError::AuthExpired,
        TokenError::Invalid(reason) => GatewayError::AuthInvalid(reason),
    })
}

/// Read the authenticated identity, if any.
pub trait UserContextExt {
    fn user(&self) -> Option<&UserContext>;
}

impl<B> UserContextExt for Request<B> {
    fn user(&self) -> Option<&UserContext> {
        self.extensions().get::<UserContext>()
    }
}
