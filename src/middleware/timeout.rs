//! Global request deadline.
//!
//! Every request gets a [`RequestCancellation`] token and a deadline. The
//! deadline is the configured `REQUEST_TIMEOUT_SECS`, or a shorter value the
//! client asks for with `X-Request-Timeout` (milliseconds, bounded).
//!
//! When the deadline passes, the token is cancelled and the client receives
//! `504 TIMEOUT_ERROR`. Inner work (upstream attempts, retry backoff) watches
//! the same token, so it stops promptly instead of running on in the
//! background. The token is also cancelled if the client goes away and the
//! request future is dropped.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::ORIGIN;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::metrics;
use crate::middleware::cors::CorsHeaders;
use crate::utils::duration_ms;

/// Minimum allowed client timeout (100ms).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum allowed client timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Client-requested timeout, already bounds-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeout {
    pub duration: Duration,
}

impl RequestTimeout {
    /// Returns `None` if `ms` is outside the allowed range.
    pub fn from_millis(ms: u64) -> Option<Self> {
        (MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS)
            .contains(&ms)
            .then(|| Self {
                duration: Duration::from_millis(ms),
            })
    }

    fn from_request(request: &Request) -> Option<Self> {
        let raw = request.headers().get(REQUEST_TIMEOUT_HEADER)?.to_str().ok()?;
        let parsed = raw
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(Self::from_millis);
        if parsed.is_none() {
            debug!(value = raw, "Ignoring invalid X-Request-Timeout header");
        }
        parsed
    }
}

/// Cancellation token for the lifetime of one inbound request.
#[derive(Debug, Clone)]
pub struct RequestCancellation(pub CancellationToken);

/// Read the request's cancellation token.
pub trait RequestCancellationExt {
    /// The request token, or a fresh never-cancelled one if the stage did not run.
    fn cancellation(&self) -> CancellationToken;
}

impl<B> RequestCancellationExt for axum::http::Request<B> {
    fn cancellation(&self) -> CancellationToken {
        self.extensions()
            .get::<RequestCancellation>()
            .map(|c| c.0.clone())
            .unwrap_or_default()
    }
}

/// Effective deadline: the client's value if shorter than the server default.
pub fn effective_timeout(client: Option<RequestTimeout>, default: Duration) -> Duration {
    client.map_or(default, |t| t.duration.min(default))
}

/// State for [`enforce_deadline`].
///
/// The 504 is produced outside the CORS stage, so it carries its own copy of
/// the configured CORS headers.
#[derive(Debug, Clone)]
pub struct DeadlineSettings {
    pub default_timeout: Duration,
    pub cors: Arc<CorsHeaders>,
}

impl DeadlineSettings {
    pub fn new(default_timeout: Duration, cors: Arc<CorsHeaders>) -> Self {
        Self {
            default_timeout,
            cors,
        }
    }
}

/// Middleware enforcing the per-request deadline.
pub async fn enforce_deadline(
    State(settings): State<DeadlineSettings>,
    mut request: Request,
    next: Next,
) -> Response {
    let timeout = effective_timeout(
        RequestTimeout::from_request(&request),
        settings.default_timeout,
    );

    let token = CancellationToken::new();
    request
        .extensions_mut()
        .insert(RequestCancellation(token.clone()));

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let origin = request.headers().get(ORIGIN).cloned();

    // Cancels inner work if the client disconnects and this future is dropped
    let guard = token.clone().drop_guard();

    let response = tokio::select! {
        response = next.run(request) => response,
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            warn!(
                method = %method,
                path = %path,
                timeout_ms = duration_ms(timeout),
                "Request deadline exceeded"
            );
            metrics::record_error(metrics::component::GATEWAY, "timeout");
            let mut response = GatewayError::Cancelled.into_response();
            settings.cors.apply(origin.as_ref(), response.headers_mut());
            response
        }
    };

    guard.disarm();
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[test]
    fn test_request_timeout_bounds() {
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS - 1).is_none());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS + 1).is_none());
        assert!(RequestTimeout::from_millis(0).is_none());
    }

    #[test]
    fn test_client_timeout_only_shortens() {
        let default = Duration::from_secs(60);
        let short = RequestTimeout::from_millis(500);
        let long = RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS);

        assert_eq!(effective_timeout(None, default), default);
        assert_eq!(effective_timeout(short, default), Duration::from_millis(500));
        assert_eq!(effective_timeout(long, default), default);
    }

    #[tokio::test]
    async fn test_deadline_cancels_and_returns_504() {
        let captured: Arc<Mutex<Option<CancellationToken>>> = Arc::default();
        let slot = captured.clone();

        let app = Router::new()
            .route(
                "/slow",
                get(move |req: axum::http::Request<Body>| {
                    let slot = slot.clone();
                    async move {
                        *slot.lock().unwrap() = Some(req.cancellation());
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        "done"
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                DeadlineSettings::new(
                    Duration::from_secs(30),
                    Arc::new(CorsHeaders::new(&["https://app.example.com".to_string()])),
                ),
                enforce_deadline,
            ));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/slow")
                    .header(REQUEST_TIMEOUT_HEADER, "150")
                    .header(ORIGIN, "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://app.example.com"
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "TIMEOUT_ERROR");

        let token = captured.lock().unwrap().clone().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_fast_request_passes_through() {
        let app = Router::new()
            .route("/fast", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                DeadlineSettings::new(Duration::from_secs(1), Arc::default()),
                enforce_deadline,
            ));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/fast")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
