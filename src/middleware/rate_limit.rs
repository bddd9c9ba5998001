//! Per-client rate limiting middleware.
//!
//! Keys the [`RateLimiterRegistry`] by the resolved client identity and
//! rejects over-limit requests before authentication runs, so floods of
//! unauthenticated traffic are throttled too.
//!
//! # Response Headers
//!
//! On rejection (429):
//! - `X-RateLimit-Limit`: Configured requests per second
//! - `X-RateLimit-Remaining`: Whole tokens left (never negative)
//! - `X-RateLimit-Reset`: Seconds until the bucket is full again
//! - `Retry-After`: Seconds until the next request can be admitted

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::warn;

use super::ip::ClientIpExt;
use crate::error::{ErrorBody, GatewayError, json_error_response};
use crate::metrics;
use crate::rate_limiter::{RateLimitDecision, RateLimiterRegistry};

#[derive(Clone)]
pub struct RateLimitLayer {
    registry: Arc<RateLimiterRegistry>,
}

impl RateLimitLayer {
    pub fn new(registry: Arc<RateLimiterRegistry>) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            registry: self.registry.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    registry: Arc<RateLimiterRegistry>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let registry = self.registry.clone();
        let mut inner = self.inner.clone();
        let client_ip = req.client_ip().to_string();

        Box::pin(async move {
            let decision = registry.check(&client_ip).await;
            if decision.allowed {
                return inner.call(req).await;
            }

            let path = req.uri().path();
            warn!(
                client_ip = %client_ip,
                path = %path,
                retry_after_secs = decision.retry_after,
                "Rate limit exceeded"
            );
            metrics::record_rate_limit_hit(&client_ip, path);

            Ok(rate_limited_response(&decision))
        })
    }
}

/// Build the 429 response for a rejected decision.
pub fn rate_limited_response(decision: &RateLimitDecision) -> Response<Body> {
    let err = GatewayError::RateLimitExceeded {
        retry_after: decision.retry_after,
    };

    let mut headers = HeaderMap::new();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset));
    headers.insert("retry-after", HeaderValue::from(decision.retry_after));

    json_error_response(err.status(), &ErrorBody::from(&err), headers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::ip::ClientIp;
    use crate::rate_limiter::RateLimitSettings;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::ServiceExt;

    fn registry(burst: u32) -> Arc<RateLimiterRegistry> {
        Arc::new(RateLimiterRegistry::new(RateLimitSettings {
            rps: 1,
            burst,
            idle_timeout: Duration::from_secs(600),
        }))
    }

    fn request_from(ip: &str) -> Request<Body> {
        let mut req = Request::builder().uri("/urls").body(Body::empty()).unwrap();
        req.extensions_mut().insert(ClientIp(ip.to_string()));
        req
    }

    async fn ok(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(Response::new(Body::from("ok")))
    }

    #[tokio::test]
    async fn test_requests_beyond_burst_are_rejected() {
        let layer = RateLimitLayer::new(registry(2));

        for _ in 0..2 {
            let response = layer
                .layer(tower::service_fn(ok))
                .oneshot(request_from("198.51.100.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = layer
            .layer(tower::service_fn(ok))
            .oneshot(request_from("198.51.100.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "1");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "1");
        assert_eq!(headers["x-ratelimit-reset"], "2");
        assert!(headers.contains_key("access-control-allow-origin"));

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Rate limit exceeded");
        assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(json["retry_after"], 1);
    }

    #[tokio::test]
    async fn test_other_clients_are_unaffected() {
        let layer = RateLimitLayer::new(registry(1));

        let first = layer
            .layer(tower::service_fn(ok))
            .oneshot(request_from("a"))
            .await
            .unwrap();
        let throttled = layer
            .layer(tower::service_fn(ok))
            .oneshot(request_from("a"))
            .await
            .unwrap();
        let other = layer
            .layer(tower::service_fn(ok))
            .oneshot(request_from("b"))
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(other.status(), StatusCode::OK);
    }
}
