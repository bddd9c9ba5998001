//! Serving the router until shutdown.

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::routes::build_router;
use crate::state::AppState;
use crate::utils::duration_ms;

/// Serve the gateway on `listener` until `shutdown` fires.
///
/// In-flight requests get `drain_timeout` after the signal; whatever is still
/// running then is abandoned. Background tasks are stopped with
/// [`AppState::shutdown`] before returning, whether the server stopped
/// cleanly or failed.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> io::Result<()> {
    let app = build_router(state.clone());

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .into_future();

    let drain_deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(drain_timeout).await;
    };

    let served = tokio::select! {
        result = server => result,
        () = drain_deadline => {
            warn!(
                timeout_ms = duration_ms(drain_timeout),
                "Shutdown timeout elapsed, abandoning in-flight requests"
            );
            Ok(())
        }
    };

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    served
}
