//! Health, readiness, and metrics endpoints.
//!
//! # Endpoints
//!
//! - `GET /healthz`, `GET /health` - Liveness, always 200
//! - `GET /readyz` - Probes every upstream service, 503 if any is down
//! - `GET /metrics` - Prometheus text exposition
//!
//! # Health vs Readiness
//!
//! - **Health**: the process is up and answering
//! - **Readiness**: every upstream answered its health path with 2xx within
//!   the probe budget and the gateway is not shutting down

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::config::ServiceName;
use crate::models::{CheckResult, HealthResponse, ReadinessResponse};
use crate::proxy::ReverseProxy;
use crate::state::AppState;
use crate::utils::duration_ms;

/// Budget for each upstream readiness probe.
pub const READINESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "timestamp": "2026-01-15T10:30:00Z",
///   "service": "hcaas-gateway",
///   "version": "0.1.0"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        service: state.config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint for Kubernetes probes.
///
/// All services are probed concurrently, so the endpoint answers within
/// [`READINESS_PROBE_TIMEOUT`] even when every upstream hangs.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let proxy = state.proxy.as_ref();
    let (auth, url, notification) = tokio::join!(
        probe_service(proxy, ServiceName::Auth),
        probe_service(proxy, ServiceName::Url),
        probe_service(proxy, ServiceName::Notification),
    );

    let mut checks = BTreeMap::new();
    checks.insert(ServiceName::Auth.to_string(), auth);
    checks.insert(ServiceName::Url.to_string(), url);
    checks.insert(ServiceName::Notification.to_string(), notification);

    let gateway = if state.is_shutting_down() {
        CheckResult::failed(None, "shutting down", 0)
    } else {
        CheckResult::ok(None, 0)
    };
    checks.insert("gateway".to_string(), gateway);

    if let Some(registry) = &state.rate_limiter {
        let start = Instant::now();
        let active = registry.active_clients().await;
        debug!(active, "Rate limiter registry reachable");
        checks.insert(
            "rate_limiter".to_string(),
            CheckResult::ok(None, duration_ms(start.elapsed())),
        );
    }

    let response = ReadinessResponse::from_checks(checks);
    let status = if response.is_ready() {
        StatusCode::OK
    } else {
        warn!(checks = ?response.checks, "Readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

async fn probe_service(proxy: &ReverseProxy, service: ServiceName) -> CheckResult {
    let start = Instant::now();
    let result = proxy.probe(service, READINESS_PROBE_TIMEOUT).await;
    let latency_ms = duration_ms(start.elapsed());

    match result {
        Ok(status) if status.is_success() => CheckResult::ok(Some(status.as_u16()), latency_ms),
        Ok(status) => CheckResult::failed(
            Some(status.as_u16()),
            format!("unexpected status {status}"),
            latency_ms,
        ),
        Err(err) => CheckResult::failed(None, err.to_string(), latency_ms),
    }
}

/// Prometheus metrics endpoint.
///
/// Returns 503 when the recorder was not installed (`METRICS_ENABLED=false`).
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response(),
    }
}
