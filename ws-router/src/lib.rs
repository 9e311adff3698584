pub mod auth;
pub mod connection;
pub mod messages;
pub mod state;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::error;

pub use auth::{CredentialResolver, PrincipalResolver};
pub use state::{TransportConfig, WsState};

/// Build the transport router: the session socket plus liveness probes.
pub fn ws_routes(state: WsState) -> Router {
    Router::new()
        .route("/ws/{session_id}", get(ws_handler))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

#[allow(clippy::missing_docs_in_private_items)]
async fn ws_handler(
    State(state): State<WsState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, session_id, state))
}

#[allow(clippy::missing_docs_in_private_items)]
async fn ready_handler(State(state): State<WsState>) -> Response {
    match state.db.client.query("RETURN 1").await {
        Ok(_) => "ok".into_response(),
        Err(err) => {
            error!(error = %err, "readiness probe failed");
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "db unavailable").into_response()
        }
    }
}
