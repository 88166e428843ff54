//! HTTP front: the WebSocket upgrade route and `/health`.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SessionManager;

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connections: usize,
}

/// Build the router: streaming upgrades on `path`, health on `/health`.
pub fn router(sessions: Arc<SessionManager>, path: &str) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(path, get(handle_upgrade))
        .with_state(sessions)
}

/// Accept on `listener` until `stop` is cancelled.
///
/// Upgraded sessions run in their own tasks and are not waited for here;
/// the session manager closes them.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    stop: CancellationToken,
) -> Result<(), std::io::Error> {
    tokio::select! {
        _ = stop.cancelled() => {
            info!("Streaming listener stopping");
            Ok(())
        }
        served = axum::serve(listener, router).into_future() => served,
    }
}

async fn handle_upgrade(
    State(sessions): State<Arc<SessionManager>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(sessions.config().max_message_bytes)
        .on_upgrade(move |socket| async move {
            if let Err(e) = sessions.accept(socket) {
                debug!("Rejected connection: {e}");
            }
        })
}

async fn handle_health(State(sessions): State<Arc<SessionManager>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::build_info::VERSION.to_string(),
        connections: sessions.connection_count(),
    })
}
