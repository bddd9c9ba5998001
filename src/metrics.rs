//! Prometheus metrics for gateway observability.
//!
//! The recorder is installed once at startup and rendered by `GET /metrics`.
//! Every recording function is a no-op when no recorder is installed, so
//! library code and tests can call them freely.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_http_requests_total` - Inbound requests (labels: method, path, status)
//! - `gateway_upstream_requests_total` - Upstream calls (labels: service, method, status)
//! - `gateway_rate_limit_hits_total` - Throttled requests (labels: client, path)
//! - `gateway_auth_validations_total` - Auth outcomes (labels: result)
//! - `gateway_errors_total` - Errors (labels: component, kind)
//!
//! ## Histograms
//! - `gateway_http_request_duration_seconds` - Inbound request latency
//! - `gateway_upstream_request_duration_seconds` - Upstream call latency
//! - `gateway_auth_validation_duration_seconds` - Token validation latency
//!
//! ## Gauges
//! - `gateway_upstream_in_flight` - Upstream calls in progress (labels: service)
//! - `gateway_rate_limit_active_clients` - Buckets held by the rate limiter

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "gateway_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "gateway_http_request_duration_seconds";
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";
    pub const UPSTREAM_REQUEST_DURATION_SECONDS: &str = "gateway_upstream_request_duration_seconds";
    pub const UPSTREAM_IN_FLIGHT: &str = "gateway_upstream_in_flight";
    pub const RATE_LIMIT_HITS_TOTAL: &str = "gateway_rate_limit_hits_total";
    pub const RATE_LIMIT_ACTIVE_CLIENTS: &str = "gateway_rate_limit_active_clients";
    pub const AUTH_VALIDATIONS_TOTAL: &str = "gateway_auth_validations_total";
    pub const AUTH_VALIDATION_DURATION_SECONDS: &str = "gateway_auth_validation_duration_seconds";
    pub const ERRORS_TOTAL: &str = "gateway_errors_total";
}

/// Components named in the `component` label of `gateway_errors_total`.
pub mod component {
    pub const PROXY: &str = "proxy";
    pub const AUTH: &str = "auth";
    pub const GATEWAY: &str = "gateway";
}

/// Install the Prometheus recorder and describe all metrics.
///
/// Returns the handle used by `GET /metrics` to render the exposition.
pub fn init_metrics() -> Result<PrometheusHandle, String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))?;

    describe_counter!(names::HTTP_REQUESTS_TOTAL, "Total inbound HTTP requests");
    describe_counter!(
        names::UPSTREAM_REQUESTS_TOTAL,
        "Total requests forwarded to upstream services"
    );
    describe_counter!(
        names::RATE_LIMIT_HITS_TOTAL,
        "Total requests rejected by the rate limiter"
    );
    describe_counter!(
        names::AUTH_VALIDATIONS_TOTAL,
        "Total authentication outcomes by result"
    );
    describe_counter!(names::ERRORS_TOTAL, "Total errors by component and kind");

    describe_histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "Inbound HTTP request duration in seconds"
    );
    describe_histogram!(
        names::UPSTREAM_REQUEST_DURATION_SECONDS,
        "Upstream request duration in seconds, retries included"
    );
    describe_histogram!(
        names::AUTH_VALIDATION_DURATION_SECONDS,
        "Token validation duration in seconds"
    );

    describe_gauge!(
        names::UPSTREAM_IN_FLIGHT,
        "Upstream requests currently in progress"
    );
    describe_gauge!(
        names::RATE_LIMIT_ACTIVE_CLIENTS,
        "Client buckets currently held by the rate limiter"
    );

    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

// =============================================================================
// Request Metrics
// =============================================================================

/// Record a completed inbound request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let status = status.to_string();
    counter!(names::HTTP_REQUESTS_TOTAL, "method" => method.to_string(), "path" => path.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status)
        .record(duration.as_secs_f64());
}

/// Record a completed upstream call.
///
/// `status` is `0` when no response was received.
pub fn record_upstream_request(service: &str, method: &str, path: &str, status: u16, duration: Duration) {
    counter!(names::UPSTREAM_REQUESTS_TOTAL, "service" => service.to_string(), "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::UPSTREAM_REQUEST_DURATION_SECONDS, "service" => service.to_string())
        .record(duration.as_secs_f64());
}

pub fn upstream_request_started(service: &str) {
    gauge!(names::UPSTREAM_IN_FLIGHT, "service" => service.to_string()).increment(1.0);
}

pub fn upstream_request_finished(service: &str) {
    gauge!(names::UPSTREAM_IN_FLIGHT, "service" => service.to_string()).decrement(1.0);
}

// =============================================================================
// Rate Limit Metrics
// =============================================================================

pub fn record_rate_limit_hit(client: &str, path: &str) {
    counter!(names::RATE_LIMIT_HITS_TOTAL, "client" => client.to_string(), "path" => path.to_string())
        .increment(1);
}

/// Publish the number of buckets held by the rate limiter.
#[allow(clippy::cast_precision_loss)]
pub fn set_rate_limit_active(count: usize) {
    gauge!(names::RATE_LIMIT_ACTIVE_CLIENTS).set(count as f64);
}

// =============================================================================
// Auth and Error Metrics
// =============================================================================

/// Record one authentication outcome (`success`, `expired`, `invalid`, `missing`).
pub fn record_auth_validation(result: &'static str, duration: Duration) {
    counter!(names::AUTH_VALIDATIONS_TOTAL, "result" => result).increment(1);
    histogram!(names::AUTH_VALIDATION_DURATION_SECONDS, "result" => result)
        .record(duration.as_secs_f64());
}

pub fn record_error(component: &'static str, kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "component" => component, "kind" => kind).increment(1);
}
