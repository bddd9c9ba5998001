//! Access logging.
//!
//! One event per request, emitted after the inner stages have chosen the
//! final status: 5xx at `error`, 4xx at `warn`, everything else at `info`.
//! The same observation feeds the inbound request metrics.

use std::time::Instant;

use axum::extract::Request;
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, warn};

use super::ip::ClientIpExt;
use crate::metrics;
use crate::utils::duration_ms;

pub async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = request.client_ip().to_string();
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status();
    let latency_ms = duration_ms(elapsed);

    if status.is_server_error() {
        error!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            client_ip = %client_ip,
            user_agent = %user_agent,
            latency_ms,
            "HTTP request"
        );
    } else if status.is_client_error() {
        warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            client_ip = %client_ip,
            user_agent = %user_agent,
            latency_ms,
            "HTTP request"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            client_ip = %client_ip,
            user_agent = %user_agent,
            latency_ms,
            "HTTP request"
        );
    }

    metrics::record_http_request(method.as_str(), &path, status.as_u16(), elapsed);

    response
}
