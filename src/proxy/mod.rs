//! Reverse proxy engine.
//!
//! Resolves the route for an inbound request, forwards it to the owning
//! upstream service and relays the response back to the client.
//!
//! # Retries
//!
//! Each request gets up to `1 + retries` attempts against its service.
//! Network failures, attempt timeouts and `5xx` responses other than `501`
//! are retried after a backoff of `(attempt + 1) * 100ms`; no backoff follows
//! the final attempt. The backoff and the in-flight attempt both abort as soon
//! as the request's cancellation token fires.
//!
//! # Bodies
//!
//! The inbound body is buffered once (bounded by the configured size) and
//! every attempt is sent from that buffer. A fresh copy is restored on the
//! inbound request. Upstream response bodies are streamed, never buffered.

mod headers;
mod routing;

use std::fmt;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, Uri};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use headers::{
    Forwarding, GATEWAY_ID, HOP_BY_HOP, X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO,
    X_GATEWAY, copy_end_to_end, is_hop_by_hop,
};
pub use routing::{RouteRule, RouteTable, RouteTarget};

use crate::config::{ServiceEndpoint, ServiceName, ServicesConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::utils::duration_ms;

/// Pooled upstream client shared by every request.
pub type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Idle keep-alive connections are closed after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Delay before the retry that follows attempt `attempt` (zero-based).
///
/// ```
/// use std::time::Duration;
/// use hcaas_gateway::proxy::backoff_delay;
///
/// assert_eq!(backoff_delay(0), Duration::from_millis(100));
/// assert_eq!(backoff_delay(2), Duration::from_millis(300));
/// ```
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 * (u64::from(attempt) + 1))
}

/// Whether an upstream status is worth another attempt.
///
/// `501 Not Implemented` will never succeed on retry.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED
}

/// Builds the pooled HTTP/1 client used for upstream calls.
pub fn build_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(HttpConnector::new())
}

/// Keeps the in-flight gauge balanced however the call ends.
///
/// On success the guard moves into the relayed body, so the call counts as
/// in flight until the client has read the whole response.
struct InFlightGuard {
    service: &'static str,
}

impl InFlightGuard {
    fn start(service: ServiceName) -> Self {
        let service = service.as_str();
        metrics::upstream_request_started(service);
        Self { service }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        metrics::upstream_request_finished(self.service);
    }
}

/// Snapshot of the inbound request shared by every attempt.
struct Outbound<'a> {
    method: &'a Method,
    url: &'a Uri,
    headers: axum::http::HeaderMap,
    body: Bytes,
}

impl Outbound<'_> {
    fn build(&self) -> GatewayResult<Request<Full<Bytes>>> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.url.clone())
            .body(Full::new(self.body.clone()))
            .map_err(|e| GatewayError::InternalProxyError(format!("invalid upstream request: {e}")))?;
        *req.headers_mut() = self.headers.clone();
        Ok(req)
    }
}

#[derive(Clone)]
pub struct ReverseProxy {
    client: UpstreamClient,
    routes: RouteTable,
    services: ServicesConfig,
    max_body_size: usize,
}

impl ReverseProxy {
    pub fn new(routes: RouteTable, services: ServicesConfig, max_body_size: usize) -> Self {
        Self::with_client(build_client(), routes, services, max_body_size)
    }

    pub fn with_client(
        client: UpstreamClient,
        routes: RouteTable,
        services: ServicesConfig,
        max_body_size: usize,
    ) -> Self {
        Self {
            client,
            routes,
            services,
            max_body_size,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn services(&self) -> &ServicesConfig {
        &self.services
    }

    /// Forward `req` to its upstream and return the relayed response.
    ///
    /// `req` keeps a readable copy of its body afterwards. `client_ip` is sent
    /// as `X-Forwarded-For`. Cancelling `cancel` aborts the current attempt or
    /// backoff and yields [`GatewayError::Cancelled`].
    ///
    /// # Errors
    ///
    /// - `RouteNotFound` when no rule matches, before any upstream call
    /// - `Cancelled` when the token fires
    /// - `RetriesExhausted` wrapping the last failure once attempts run out
    /// - `InternalProxyError` when the inbound body cannot be read
    pub async fn forward(
        &self,
        req: &mut Request<Body>,
        client_ip: &str,
        cancel: &CancellationToken,
    ) -> GatewayResult<Response<Body>> {
        let target = match self.routes.target(&self.services, req.uri()) {
            Ok(target) => target,
            Err(err) => {
                metrics::record_error(metrics::component::PROXY, err.metric_kind());
                return Err(err);
            }
        };

        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let service = target.service;

        let result = async {
            let body = self.buffer_body(req).await?;

            let mut outbound_headers = copy_end_to_end(req.headers(), true);
            Forwarding::from_inbound(req.headers(), client_ip).apply(&mut outbound_headers);

            let outbound = Outbound {
                method: &method,
                url: &target.url,
                headers: outbound_headers,
                body,
            };

            let in_flight = InFlightGuard::start(service);
            self.send_with_retries(service, &outbound, cancel)
                .await
                .map(|response| (response, in_flight))
        }
        .await;

        let duration = start.elapsed();
        let latency_ms = duration_ms(duration);

        match result {
            Ok((response, in_flight)) => {
                let status = response.status();
                metrics::record_upstream_request(
                    service.as_str(),
                    method.as_str(),
                    &path,
                    status.as_u16(),
                    duration,
                );
                info!(
                    service = %service,
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    latency_ms,
                    "Upstream call completed"
                );
                Ok(relay(service, response, in_flight))
            }
            Err(err) => {
                let status = err.status();
                metrics::record_upstream_request(
                    service.as_str(),
                    method.as_str(),
                    &path,
                    status.as_u16(),
                    duration,
                );
                metrics::record_error(metrics::component::PROXY, err.metric_kind());
                error!(
                    service = %service,
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    latency_ms,
                    error = %err,
                    "Upstream call failed"
                );
                Err(err)
            }
        }
    }

    /// Read the inbound body once and put a fresh copy back on `req`.
    async fn buffer_body(&self, req: &mut Request<Body>) -> GatewayResult<Bytes> {
        let body = std::mem::take(req.body_mut());
        let bytes = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| GatewayError::InternalProxyError(format!("failed to read request body: {e}")))?;
        *req.body_mut() = Body::from(bytes.clone());
        Ok(bytes)
    }

    async fn send_with_retries(
        &self,
        service: ServiceName,
        outbound: &Outbound<'_>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Response<Incoming>> {
        let endpoint = self.services.endpoint(service);
        let attempts = endpoint.retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.attempt(service, endpoint, outbound, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => {
                    warn!(
                        service = %service,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %err,
                        "Upstream attempt failed"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }

            if attempt + 1 < attempts {
                let delay = backoff_delay(attempt);
                debug!(service = %service, delay_ms = duration_ms(delay), "Backing off before retry");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let last = last_error.ok_or_else(|| {
            GatewayError::InternalProxyError("retry loop made no attempts".to_string())
        })?;
        Err(GatewayError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    /// One upstream call bounded by the service's per-attempt timeout.
    ///
    /// A retryable status is turned into an error; its body is dropped, which
    /// closes it.
    async fn attempt(
        &self,
        service: ServiceName,
        endpoint: &ServiceEndpoint,
        outbound: &Outbound<'_>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Response<Incoming>> {
        let request = outbound.build()?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            outcome = tokio::time::timeout(endpoint.timeout, self.client.request(request)) => outcome,
        };

        let response = match outcome {
            Err(_elapsed) => {
                return Err(GatewayError::UpstreamTimeout {
                    service: service.to_string(),
                    timeout: endpoint.timeout,
                });
            }
            Ok(Err(e)) => {
                return Err(GatewayError::UpstreamUnavailable {
                    service: service.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if is_retryable_status(status) {
            return Err(GatewayError::UpstreamServerError {
                service: service.to_string(),
                status,
            });
        }

        Ok(response)
    }

    /// Probe a service's readiness path once.
    ///
    /// Returns the upstream status; callers decide what counts as ready.
    pub async fn probe(&self, service: ServiceName, timeout: Duration) -> GatewayResult<StatusCode> {
        let endpoint = self.services.endpoint(service);
        let url = format!("{}{}", endpoint.base_url, endpoint.health_path)
            .parse::<Uri>()
            .map_err(|e| GatewayError::InternalProxyError(format!("invalid probe URL: {e}")))?;

        let request = Request::get(url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| GatewayError::InternalProxyError(format!("invalid probe request: {e}")))?;

        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response.status()),
            Ok(Err(e)) => Err(GatewayError::UpstreamUnavailable {
                service: service.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(GatewayError::UpstreamTimeout {
                service: service.to_string(),
                timeout,
            }),
        }
    }
}

/// Copy end-to-end headers and status, then stream the upstream body.
///
/// A failure mid-stream is logged and counted; the client sees a truncated
/// body since the status has already been sent. `in_flight` is released when
/// the body is finished or dropped.
fn relay<B>(service: ServiceName, upstream: Response<B>, in_flight: InFlightGuard) -> Response<Body>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: fmt::Display + Into<axum::BoxError>,
{
    let (parts, incoming) = upstream.into_parts();

    let body = incoming.map_err(move |e| {
        let _in_flight = &in_flight;
        warn!(service = %service, error = %e, "Upstream body stream failed");
        metrics::record_error(metrics::component::PROXY, "internal");
        e
    });

    let mut response = Response::new(Body::new(body));
    *response.status_mut() = parts.status;
    *response.headers_mut() = copy_end_to_end(&parts.headers, false);
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_linearly_per_attempt() {
        let delays: Vec<u64> = (0..4).map(|a| duration_ms(backoff_delay(a))).collect();
        assert_eq!(delays, vec![100, 200, 300, 400]);
    }

    fn in_flight(handle: &metrics_exporter_prometheus::PrometheusHandle) -> f64 {
        handle
            .render()
            .lines()
            .find(|line| line.starts_with(crate::metrics::names::UPSTREAM_IN_FLIGHT))
            .and_then(|line| line.rsplit(' ').next())
            .map_or(0.0, |value| value.parse().unwrap())
    }

    #[test]
    fn test_in_flight_held_until_body_dropped() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            let guard = InFlightGuard::start(ServiceName::Url);
            let upstream = Response::new(Full::new(Bytes::from_static(b"payload")));
            let response = relay(ServiceName::Url, upstream, guard);
            assert_eq!(in_flight(&handle), 1.0);

            drop(response);
            assert_eq!(in_flight(&handle), 0.0);
        });
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::NOT_IMPLEMENTED));
        assert!(!is_retryable_status(StatusCode::OK));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
    }

    fn unreachable_services() -> ServicesConfig {
        // Port 9 (discard) on loopback refuses connections.
        let endpoint = ServiceEndpoint::new("http://127.0.0.1:9", Duration::from_secs(1), 2);
        ServicesConfig {
            auth: endpoint.clone(),
            url: endpoint.clone(),
            notification: endpoint,
        }
    }

    #[tokio::test]
    async fn test_unknown_route_fails_without_upstream_call() {
        let proxy = ReverseProxy::new(RouteTable::default(), unreachable_services(), 1024);
        let mut req = Request::builder().uri("/billing").body(Body::empty()).unwrap();

        let err = proxy
            .forward(&mut req, "203.0.113.1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound(_)));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_retrying() {
        let proxy = ReverseProxy::new(RouteTable::default(), unreachable_services(), 1024);
        let mut req = Request::builder().uri("/urls").body(Body::empty()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        let err = proxy.forward(&mut req, "203.0.113.1", &cancel).await.unwrap_err();

        assert!(matches!(err, GatewayError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_connection_failures_exhaust_retries() {
        let proxy = ReverseProxy::new(RouteTable::default(), unreachable_services(), 1024);
        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/urls")
            .body(Body::from("payload"))
            .unwrap();

        let err = proxy
            .forward(&mut req, "203.0.113.1", &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            GatewayError::RetriesExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, GatewayError::UpstreamUnavailable { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");

        // The inbound body is still readable after all attempts.
        let body = axum::body::to_bytes(std::mem::take(req.body_mut()), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let proxy = ReverseProxy::new(RouteTable::default(), unreachable_services(), 4);
        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/urls")
            .body(Body::from("too large"))
            .unwrap();

        let err = proxy
            .forward(&mut req, "203.0.113.1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InternalProxyError(_)));
    }
}
