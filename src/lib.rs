//! # HCaaS Gateway
//!
//! API gateway in front of the HCaaS backend services, featuring:
//!
//! - **Routing**: Path prefix rules mapping requests to the auth, url and
//!   notification services
//! - **Resilience**: Bounded retries with cancellable backoff, per-attempt
//!   timeouts and a global request deadline
//! - **Security**: Bearer token authentication with a public path allowlist,
//!   per-client rate limiting
//! - **Observability**: Request IDs, structured access logs, tracing spans,
//!   Prometheus metrics, health and readiness endpoints
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → IP → Timeout → Log → CORS →       │
//! │              Trace → Rate Limit → Auth)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, readiness, metrics, proxy fallback)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ReverseProxy (routing, retries, header hygiene, relay)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Upstream services (auth / url / notification)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hcaas_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config, None);
//!     let _app = build_router(state.clone());
//!
//!     // Or let `server::serve` run it and stop background tasks afterwards
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! JWT_SECRET=a-secret-of-at-least-32-characters! \
//! URL_SERVICE_URL=http://localhost:8080 \
//! RATE_LIMIT_RPS=50 RATE_LIMIT_BURST=100 cargo run
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod rate_limiter;
pub mod routes;
pub mod server;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use proxy::ReverseProxy;
pub use routes::build_router;
pub use state::AppState;
