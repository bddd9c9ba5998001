//! Request ID propagation.
//!
//! Reuses an inbound `X-Request-Id` or generates a UUIDv4, stores it as a
//! [`RequestId`] extension and header (so the proxy forwards it upstream),
//! and echoes it on the response. This is the outermost stage, so even
//! responses produced by other middleware carry the id.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest accepted client-supplied id; longer values are replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Request id stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let (id, header) = request_id_for(&req);

        req.headers_mut().insert(REQUEST_ID_HEADER, header.clone());
        req.extensions_mut().insert(RequestId(id));

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, header);
            Ok(response)
        })
    }
}

/// Reuse a usable inbound id, otherwise generate one.
fn request_id_for<B>(req: &Request<B>) -> (String, HeaderValue) {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(id) = value.to_str()
        && !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
    {
        return (id.to_string(), value.clone());
    }

    let id = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value
    let header = HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    (id, header)
}

/// Read the request id from a request.
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions().get::<RequestId>().map(|id| id.0.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::ServiceExt;

    async fn echo(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let id = req.request_id().unwrap_or_default().to_string();
        Ok(Response::new(Body::from(id)))
    }

    #[tokio::test]
    async fn test_existing_id_is_reused_and_echoed() {
        let svc = RequestIdLayer::new().layer(tower::service_fn(echo));
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "corr-123")
            .body(Body::empty())
            .unwrap();

        let response = svc.oneshot(req).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "corr-123");
        let body = axum::body::to_bytes(response.into_body(), 128).await.unwrap();
        assert_eq!(&body[..], b"corr-123");
    }

    #[tokio::test]
    async fn test_missing_id_is_generated() {
        let svc = RequestIdLayer::new().layer(tower::service_fn(echo));
        let response = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_oversized_id_is_replaced() {
        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, long.as_str())
            .body(Body::empty())
            .unwrap();

        let (id, _) = request_id_for(&req);
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
