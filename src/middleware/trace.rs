//! Per-request tracing span.
//!
//! Uses `tower-http`'s `TraceLayer` with a span carrying OpenTelemetry-style
//! HTTP attributes. The status fields are recorded when the response is
//! produced. Exporting spans is left to whichever subscriber layer is
//! installed.

use std::time::Duration;

use axum::http::header::{HOST, USER_AGENT};
use axum::http::{Request, Response};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, DefaultOnRequest, HttpMakeClassifier, MakeSpan, OnResponse,
    TraceLayer,
};
use tracing::field::Empty;
use tracing::{Span, debug, info_span};

use super::request_id::RequestIdExt;
use crate::utils::duration_ms;

pub type GatewayTraceLayer = TraceLayer<
    HttpMakeClassifier,
    GatewayMakeSpan,
    DefaultOnRequest,
    GatewayOnResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    (),
>;

/// Build the tracing layer. Failures are reported by the access log, so the
/// layer's own failure event is disabled.
pub fn trace_layer() -> GatewayTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(GatewayMakeSpan)
        .on_response(GatewayOnResponse)
        .on_failure(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayMakeSpan;

impl<B> MakeSpan<B> for GatewayMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let header = |name| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
        };

        let scheme = request
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri().scheme_str())
            .unwrap_or("http");

        info_span!(
            "request",
            otel.name = %format!("{} {}", request.method(), request.uri().path()),
            otel.kind = "server",
            http.method = %request.method(),
            http.target = %request.uri(),
            http.scheme = scheme,
            http.host = header(HOST),
            user_agent.original = header(USER_AGENT),
            request_id = request.request_id().unwrap_or(""),
            http.status_code = Empty,
            otel.status_code = Empty,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayOnResponse;

impl<B> OnResponse<B> for GatewayOnResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let status = response.status();
        span.record("http.status_code", status.as_u16());
        span.record(
            "otel.status_code",
            if status.as_u16() >= 400 { "ERROR" } else { "OK" },
        );
        debug!(
            status = status.as_u16(),
            latency_ms = duration_ms(latency),
            "finished processing request"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_trace_layer_is_transparent() {
        let app = Router::new()
            .route("/teapot", get(|| async { StatusCode::IM_A_TEAPOT }))
            .layer(trace_layer());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/teapot")
                    .header(USER_AGENT, "probe/1.0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn test_make_span_without_subscriber() {
        let request = Request::builder()
            .uri("https://gw.example.com/urls?page=2")
            .body(())
            .unwrap();
        let span = GatewayMakeSpan.make_span(&request);
        GatewayOnResponse.on_response(
            &Response::builder().status(503).body(()).unwrap(),
            Duration::from_millis(5),
            &span,
        );
    }
}
