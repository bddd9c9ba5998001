use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hcaas_gateway::config::LogFormat;
use hcaas_gateway::{AppState, Config, metrics, server, utils};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration; logging is set up from it, so report failures after
    let config = match Config::from_env() {
        Ok(config) => {
            init_tracing(&config.log_level, config.log_format);
            config
        }
        Err(e) => {
            init_tracing("info", LogFormat::default());
            error!("Configuration error: {e}");
            return Err(exitcode::CONFIG);
        }
    };

    info!(
        "Starting HCaaS Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %config.host,
        port = %config.port,
        auth = %config.services.auth.base_url,
        url = %config.services.url.base_url,
        notification = %config.services.notification.base_url,
        "Configuration loaded"
    );

    let metrics_handle = if config.metrics_enabled {
        Some(metrics::init_metrics().map_err(|e| {
            error!("Failed to initialize metrics: {e}");
            exitcode::SOFTWARE
        })?)
    } else {
        info!("Metrics disabled (METRICS_ENABLED=false)");
        None
    };

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    // Built after bind so early exits leave no sweep task behind
    let state = AppState::new(config.clone(), metrics_handle);

    info!("Server listening on http://{addr}");
    info!("  GET  /healthz /health  - Liveness");
    info!("  GET  /readyz           - Readiness (probes upstreams)");
    info!("  GET  /metrics          - Prometheus metrics");
    info!("  *    /auth/* /me       - auth service");
    info!("  *    /urls*            - url service");
    info!("  *    /notifications*   - notification service");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        utils::shutdown_signal().await;
        signal_token.cancel();
    });

    let served = server::serve(listener, state, shutdown, config.shutdown_timeout)
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        });

    info!("Server shutdown complete");
    served
}
