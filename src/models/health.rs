use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Liveness response for `/healthz` and `/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process can answer
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    /// Configured service name
    pub service: String,
    /// Crate version
    pub version: &'static str,
}

/// Outcome of one readiness check.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckResult {
    /// `ok` or `failed`
    pub status: &'static str,
    /// Upstream status code, when the probe got a response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Why the check failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl CheckResult {
    pub fn ok(http_status: Option<u16>, latency_ms: u64) -> Self {
        Self {
            status: "ok",
            http_status,
            error: None,
            latency_ms,
        }
    }

    pub fn failed(http_status: Option<u16>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            status: "failed",
            http_status,
            error: Some(error.into()),
            latency_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Readiness response for `/readyz`.
///
/// ```json
/// {
///   "status": "not_ready",
///   "timestamp": "2026-01-15T10:30:00Z",
///   "checks": {
///     "auth": { "status": "ok", "http_status": 200, "latency_ms": 3 },
///     "url": { "status": "failed", "error": "connection refused", "latency_ms": 1 }
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, CheckResult>,
}

impl ReadinessResponse {
    pub fn from_checks(checks: BTreeMap<String, CheckResult>) -> Self {
        let ready = checks.values().all(CheckResult::is_ok);
        Self {
            status: if ready { "ready" } else { "not_ready" },
            timestamp: Utc::now(),
            checks,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}
