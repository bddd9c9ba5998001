use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};

use crate::middleware::{ClientIpExt, RequestCancellationExt};
use crate::state::AppState;

/// Terminal handler: every path without a local route is proxied upstream.
///
/// Failures are already logged and counted by the proxy; here they are only
/// rendered as the JSON error response.
pub async fn proxy_handler(State(state): State<AppState>, mut request: Request) -> Response {
    let client_ip = request.client_ip().to_string();
    let cancel = request.cancellation();

    match state.proxy.forward(&mut request, &client_ip, &cancel).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
