//! CORS header injection.
//!
//! The gateway sends one fixed set of CORS headers on every response,
//! including errors produced by inner stages. Any `OPTIONS` request is
//! answered `200` here and never reaches rate limiting, auth or the proxy.
//!
//! `Access-Control-Allow-Origin` follows `CORS_ALLOWED_ORIGINS`: `*` when the
//! list contains `*`, otherwise the request's `Origin` when it is listed.
//! Unlisted origins get no allow-origin header at all.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, HeaderValue, ORIGIN, VARY,
};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, PATCH";
const ALLOW_HEADERS: &str = "Accept, Content-Type, Content-Length, Accept-Encoding, Authorization, X-CSRF-Token, X-Requested-With";
const MAX_AGE_SECS: &str = "3600";

#[derive(Debug, Clone)]
enum AllowedOrigins {
    Any,
    List(Vec<HeaderValue>),
}

/// The CORS header set applied to responses.
#[derive(Debug, Clone)]
pub struct CorsHeaders {
    origins: AllowedOrigins,
}

impl CorsHeaders {
    /// Build from the configured origin list.
    ///
    /// Entries that are not valid header values are skipped. An empty
    /// result falls back to `*`.
    pub fn new(origins: &[String]) -> Self {
        if origins.iter().any(|o| o == "*") {
            return Self::default();
        }

        let list: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| {
                let parsed = HeaderValue::from_str(origin).ok();
                if parsed.is_none() {
                    warn!(origin = %origin, "Invalid CORS origin, skipping");
                }
                parsed
            })
            .collect();

        if list.is_empty() {
            warn!("No valid CORS origins configured, falling back to '*'");
            return Self::default();
        }

        Self {
            origins: AllowedOrigins::List(list),
        }
    }

    /// Allow-origin value for a request carrying `origin`.
    ///
    /// Without an `Origin` header a single configured origin is still sent.
    fn allow_origin(&self, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        match (&self.origins, origin) {
            (AllowedOrigins::Any, _) => Some(HeaderValue::from_static("*")),
            (AllowedOrigins::List(list), Some(origin)) => {
                list.contains(origin).then(|| origin.clone())
            }
            (AllowedOrigins::List(list), None) => match list.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            },
        }
    }

    /// Write the header set for a request whose `Origin` was `origin`.
    ///
    /// Overwrites any allow-origin already present, so an error rendered with
    /// the defaults ends up with the configured policy.
    pub fn apply(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        match self.allow_origin(origin) {
            Some(value) => {
                headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            }
            None => {
                if let Some(origin) = origin {
                    debug!(origin = ?origin, "Origin not in CORS allow list");
                }
                headers.remove(ACCESS_CONTROL_ALLOW_ORIGIN);
            }
        }
        if matches!(self.origins, AllowedOrigins::List(_)) {
            headers.insert(VARY, HeaderValue::from_static("Origin"));
        }
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE_SECS));
    }
}

impl Default for CorsHeaders {
    fn default() -> Self {
        Self {
            origins: AllowedOrigins::Any,
        }
    }
}

/// Middleware injecting CORS headers and answering preflight requests.
pub async fn cors(State(headers): State<Arc<CorsHeaders>>, request: Request, next: Next) -> Response {
    let origin = request.headers().get(ORIGIN).cloned();

    if request.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::OK;
        headers.apply(origin.as_ref(), response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    headers.apply(origin.as_ref(), response.headers_mut());
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn origins(list: &[&str]) -> Vec<String> {
        list.iter().map(|o| o.to_string()).collect()
    }

    fn app(hits: Arc<AtomicUsize>, origins: &[String]) -> Router {
        Router::new()
            .route(
                "/urls",
                any(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "listed"
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(CorsHeaders::new(origins)),
                cors,
            ))
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let hits = Arc::new(AtomicUsize::new(0));
        let response = app(hits.clone(), &origins(&["https://app.example.com"]))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/urls")
                    .header(ORIGIN, "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );
        assert_eq!(response.headers()[ACCESS_CONTROL_MAX_AGE], "3600");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_headers_added_to_normal_responses() {
        let hits = Arc::new(AtomicUsize::new(0));
        let response = app(hits.clone(), &origins(&["*"]))
            .oneshot(Request::builder().uri("/urls").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert!(!response.headers().contains_key(VARY));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listed_origin_is_echoed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = app(
            hits.clone(),
            &origins(&["https://a.example", "https://b.example"]),
        );

        for origin in ["https://a.example", "https://b.example"] {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/urls")
                        .header(ORIGIN, origin)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], origin);
            assert_eq!(response.headers()[VARY], "Origin");
        }
    }

    #[tokio::test]
    async fn test_unlisted_origin_gets_no_allow_origin() {
        let hits = Arc::new(AtomicUsize::new(0));
        let response = app(
            hits.clone(),
            &origins(&["https://a.example", "https://b.example"]),
        )
        .oneshot(
            Request::builder()
                .uri("/urls")
                .header(ORIGIN, "https://evil.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(response.headers()[VARY], "Origin");
    }

    #[test]
    fn test_configured_policy_replaces_default_origin() {
        let mut headers = HeaderMap::new();
        CorsHeaders::default().apply(None, &mut headers);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let single = CorsHeaders::new(&origins(&["https://app.example.com"]));
        single.apply(None, &mut headers);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example.com");

        let several = CorsHeaders::new(&origins(&["https://a.example", "https://b.example"]));
        several.apply(None, &mut headers);
        assert!(!headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn test_invalid_origin_falls_back() {
        let mut headers = HeaderMap::new();
        CorsHeaders::new(&origins(&["bad\norigin"])).apply(None, &mut headers);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
