//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header
//! ├──────────────────┤
//! │    Client IP     │ ← Resolves client identity once
//! ├──────────────────┤
//! │  Panic recovery  │ ← 500 JSON on panic
//! ├──────────────────┤
//! │  Global timeout  │ ← 504 and cancellation on deadline
//! ├──────────────────┤
//! │   Access log     │ ← Sees the final status
//! ├──────────────────┤
//! │      CORS        │ ← OPTIONS answered here
//! ├──────────────────┤
//! │     Tracing      │ ← One span per request
//! ├──────────────────┤
//! │  Rate Limiting   │ ← 429 if exceeded
//! ├──────────────────┤
//! │  Authentication  │ ← 401 if invalid (public paths bypassed)
//! └────────┬─────────┘
//!          ▼
//!   Local route or proxy
//! ```
//!
//! # Route Groups
//!
//! - `/healthz`, `/health`, `/readyz`, `/metrics` - served locally
//! - everything else - proxied to the owning upstream service

use std::any::Any;
use std::sync::Arc;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info};

use crate::error::GatewayError;
use crate::handlers;
use crate::middleware::{
    AuthLayer, ClientIpLayer, CorsHeaders, DeadlineSettings, RateLimitLayer, RequestIdLayer,
    access_log, cors, enforce_deadline, trace_layer,
};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// Layers are added innermost first; the last `.layer` call runs first.
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    let cors_headers = Arc::new(CorsHeaders::new(&config.cors_allowed_origins));

    let mut router = Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/health", get(handlers::health_check))
        .route("/readyz", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .fallback(handlers::proxy_handler);

    // Authentication
    info!(
        public_paths = config.public_paths.len(),
        "Bearer authentication enabled"
    );
    router = router.layer(AuthLayer::new(
        state.validator.clone(),
        config.public_paths.clone(),
    ));

    // Rate limiting
    if let Some(registry) = &state.rate_limiter {
        info!(
            rps = config.rate_limit_rps,
            burst = config.rate_limit_burst,
            "Rate limiting enabled"
        );
        router = router.layer(RateLimitLayer::new(registry.clone()));
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_ENABLED=false)");
    }

    // Tracing, CORS, access log
    router = router
        .layer(trace_layer())
        .layer(from_fn_with_state(cors_headers.clone(), cors))
        .layer(from_fn(access_log));

    // Global deadline, panic recovery, client identity, request id
    let panic_cors = cors_headers.clone();
    router = router
        .layer(from_fn_with_state(
            DeadlineSettings::new(config.request_timeout, cors_headers),
            enforce_deadline,
        ))
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| handle_panic(&panic_cors, panic),
        ))
        .layer(ClientIpLayer::new(&config.trusted_proxies))
        .layer(RequestIdLayer::new());

    router.with_state(state)
}

/// The request is gone once it panics, so the configured CORS policy is
/// applied without an `Origin` to match against.
fn handle_panic(cors: &CorsHeaders, panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");

    error!(panic = detail, "Request handler panicked");
    crate::metrics::record_error(crate::metrics::component::GATEWAY, "internal");

    let mut response = GatewayError::InternalProxyError(detail.to_string()).into_response();
    cors.apply(None, response.headers_mut());
    response
}
