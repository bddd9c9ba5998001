//! HTTP middleware making up the gateway pipeline.
//!
//! - **Request ID**: reuse or generate `X-Request-Id`
//! - **Client IP**: resolve the client identity once, honouring trusted proxies
//! - **Timeout**: per-request deadline and cancellation token
//! - **Access log**: one event and metric per request with the final status
//! - **CORS**: fixed header set, preflight answered directly
//! - **Trace**: one span per request
//! - **Rate limiting**: per-client token buckets
//! - **Authentication**: bearer token validation with a public path allowlist
//!
//! # Order
//!
//! ```text
//! Request ID → Client IP → Panic recovery → Timeout → Access log → CORS
//!   → Trace → Rate limit → Auth → proxy handler
//!                  ↓          ↓
//!               429        401
//! ```
//!
//! Rate limiting runs before auth so unauthenticated floods are throttled.
//! Access log and CORS wrap the trace stage so both observe the final status.

pub mod auth;
pub mod cors;
pub mod ip;
pub mod logging;
pub mod rate_limit;
pub mod request_id;
pub mod timeout;
pub mod trace;

pub use auth::{AuthLayer, AuthMode, UserContextExt, is_public_path};
pub use cors::{CorsHeaders, cors};
pub use ip::{ClientIp, ClientIpExt, ClientIpLayer, TrustedProxies, UNKNOWN_IP, resolve_client_ip};
pub use logging::access_log;
pub use rate_limit::{RateLimitLayer, rate_limited_response};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdExt, RequestIdLayer};
pub use timeout::{
    DeadlineSettings, MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_HEADER,
    RequestCancellation, RequestCancellationExt, RequestTimeout, effective_timeout,
    enforce_deadline,
};
pub use trace::{GatewayTraceLayer, trace_layer};
