//! Shared application state for Axum handlers.
//!
//! Everything here is immutable after startup except the rate limiter
//! registry, which guards its own state. Cloning the state is cheap.
//!
//! # Structured Concurrency
//!
//! The rate limiter sweep runs on a `tokio_util::task::TaskTracker` and stops
//! on a `CancellationToken`. Call `shutdown()` before exit so the sweep is
//! cancelled and joined exactly once.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::auth::{JwtValidator, TokenValidator};
use crate::config::Config;
use crate::proxy::{ReverseProxy, RouteTable};
use crate::rate_limiter::{RateLimitSettings, RateLimiterRegistry};

#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Upstream proxy sharing one pooled client
    pub proxy: Arc<ReverseProxy>,
    /// Bearer token validator used by the auth stage
    pub validator: Arc<dyn TokenValidator>,
    /// Per-client buckets; `None` when rate limiting is disabled
    pub rate_limiter: Option<Arc<RateLimiterRegistry>>,
    /// Prometheus recorder handle; `None` when metrics are disabled
    pub metrics: Option<PrometheusHandle>,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state with the HS256 validator from `config.jwt_secret`.
    ///
    /// Spawns the rate limiter sweep when rate limiting is enabled.
    pub fn new(config: Config, metrics: Option<PrometheusHandle>) -> Self {
        let validator = Arc::new(JwtValidator::new(&config.jwt_secret));
        Self::with_validator(config, validator, metrics)
    }

    /// Build state around a custom [`TokenValidator`].
    pub fn with_validator(
        config: Config,
        validator: Arc<dyn TokenValidator>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let proxy = ReverseProxy::new(
            RouteTable::default(),
            config.services.clone(),
            config.max_request_body_size,
        );
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let rate_limiter = config.rate_limit_enabled.then(|| {
            let registry = Arc::new(RateLimiterRegistry::new(RateLimitSettings {
                rps: config.rate_limit_rps,
                burst: config.rate_limit_burst,
                idle_timeout: config.rate_limit_idle_timeout,
            }));
            registry.spawn_sweeper(
                config.rate_limit_sweep_interval,
                &task_tracker,
                cancellation_token.clone(),
            );
            registry
        });

        Self {
            config: Arc::new(config),
            proxy: Arc::new(proxy),
            validator,
            rate_limiter,
            metrics,
            task_tracker,
            cancellation_token,
        }
    }

    /// Whether `shutdown()` has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals the tasks, closes the tracker so nothing new is spawned, then
    /// waits for them to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_joins_sweeper() {
        let config = Config {
            rate_limit_sweep_interval: Duration::from_millis(10),
            ..Config::default()
        };
        let state = AppState::new(config, None);
        assert!(state.rate_limiter.is_some());
        assert!(!state.is_shutting_down());

        tokio::time::timeout(Duration::from_secs(1), state.shutdown())
            .await
            .expect("sweeper should stop promptly");
        assert!(state.is_shutting_down());

        // A second call is a no-op.
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled() {
        let config = Config {
            rate_limit_enabled: false,
            ..Config::default()
        };
        let state = AppState::new(config, None);
        assert!(state.rate_limiter.is_none());
        state.shutdown().await;
    }
}
