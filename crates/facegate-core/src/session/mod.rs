//! Streaming sessions: connection registry, per-connection loops, delivery.
//!
//! Each accepted WebSocket gets a [`ConnectionId`], a bounded outbound queue,
//! and two tasks (read, and write/keepalive). Completions reach a session
//! through [`ResponseSink::deliver`], which never blocks: a response for a
//! connection that is gone is dropped, and a connection whose queue is full
//! is closed.

mod connection;
mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::WebSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use facegate_config::ServerConfig;

use crate::gateway::{SubmitError, Submitter};
use crate::id::{ConnectionId, UniqueId};
use crate::protocol::FaceResponse;

pub use server::{HealthResponse, router, serve};

/// Where the gateway hands finished responses.
pub trait ResponseSink: Send + Sync {
    /// Queue `response` for `connection`. Must not block.
    fn deliver(&self, connection: ConnectionId, response: FaceResponse);
}

/// Errors that end a single session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("service is shutting down")]
    ShuttingDown,

    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error("malformed request: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("no pong received within {0:?}")]
    PongTimeout(Duration),

    #[error("submit failed: {0}")]
    Submit(#[from] SubmitError),

    #[error("peer did not accept writes within {0:?}")]
    WriteStalled(Duration),
}

/// Per-session tuning, derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pong_wait: Duration,
    pub ping_interval: Duration,
    pub outbound_queue: usize,
    pub max_message_bytes: usize,
}

impl From<&ServerConfig> for SessionConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            pong_wait: config.pong_wait(),
            ping_interval: config.ping_interval(),
            outbound_queue: config.outbound_queue,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionHandle {
    outbound: mpsc::Sender<FaceResponse>,
    close: CancellationToken,
}

/// Registry of live streaming sessions.
pub struct SessionManager {
    registry: Mutex<HashMap<ConnectionId, SessionHandle>>,
    next_connection: AtomicU64,
    ids: UniqueId,
    submitter: Submitter,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig, submitter: Submitter, shutdown: CancellationToken) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            ids: UniqueId::new(),
            submitter,
            shutdown,
            tracker: TaskTracker::new(),
            config,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ConnectionId, SessionHandle>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register an upgraded socket and start its loops.
    pub fn accept(self: &Arc<Self>, socket: WebSocket) -> Result<ConnectionId, SessionError> {
        let manager = Arc::clone(self);
        self.admit(move |id, outbound, close| connection::run(manager, id, socket, outbound, close))
    }

    /// Register a session and spawn `start` for it.
    ///
    /// Admission and [`wait_closed`](Self::wait_closed) both hold the
    /// registry lock, so a session is either tracked before the wait begins
    /// or refused.
    fn admit<F, Fut>(&self, start: F) -> Result<ConnectionId, SessionError>
    where
        F: FnOnce(ConnectionId, mpsc::Receiver<FaceResponse>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut registry = self.registry();
        if self.shutdown.is_cancelled() || self.tracker.is_closed() {
            return Err(SessionError::ShuttingDown);
        }

        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let close = self.shutdown.child_token();
        registry.insert(
            id,
            SessionHandle {
                outbound: outbound_tx,
                close: close.clone(),
            },
        );
        let live = registry.len();
        self.tracker.spawn(start(id, outbound_rx, close));
        drop(registry);

        info!(connection_id = %id, live, "Connection accepted");
        Ok(id)
    }

    /// Number of registered sessions.
    pub fn connection_count(&self) -> usize {
        self.registry().len()
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.registry().contains_key(&id)
    }

    /// Wait until every session task has finished.
    ///
    /// Call after the shared shutdown token has been cancelled.
    pub async fn wait_closed(&self) {
        {
            let _registry = self.registry();
            self.tracker.close();
        }
        self.tracker.wait().await;
    }

    fn deregister(&self, id: ConnectionId) {
        let (removed, live) = {
            let mut registry = self.registry();
            let removed = registry.remove(&id).is_some();
            (removed, registry.len())
        };
        if removed {
            info!(connection_id = %id, live, "Connection closed");
        }
    }
}

impl ResponseSink for SessionManager {
    fn deliver(&self, connection: ConnectionId, response: FaceResponse) {
        let handle = self.registry().get(&connection).cloned();
        let Some(handle) = handle else {
            debug!(connection_id = %connection, request_id = %response.id, "Dropping response for closed connection");
            return;
        };

        match handle.outbound.try_send(response) {
            Ok(()) => {}
            Err(TrySendError::Full(response)) => {
                warn!(
                    connection_id = %connection,
                    request_id = %response.id,
                    "Outbound queue full, closing slow connection"
                );
                handle.close.cancel();
            }
            Err(TrySendError::Closed(response)) => {
                debug!(connection_id = %connection, request_id = %response.id, "Dropping response for closing connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::dispatch_channel;

    fn manager() -> SessionManager {
        let shutdown = CancellationToken::new();
        let (submitter, _queue) = dispatch_channel(shutdown.clone());
        SessionManager::new(
            SessionConfig::from(&ServerConfig::default()),
            submitter,
            shutdown,
        )
    }

    fn register(manager: &SessionManager, id: u64, capacity: usize) -> (mpsc::Receiver<FaceResponse>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let close = CancellationToken::new();
        manager.registry().insert(
            ConnectionId(id),
            SessionHandle {
                outbound: tx,
                close: close.clone(),
            },
        );
        (rx, close)
    }

    fn response(id: &str) -> FaceResponse {
        FaceResponse::error(id.into(), "feature".into(), -1)
    }

    #[test]
    fn test_session_config_from_server_config() {
        let config = SessionConfig::from(&ServerConfig::default());
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.ping_interval, Duration::from_secs(54));
        assert_eq!(config.outbound_queue, 64);
    }

    #[test]
    fn test_deliver_to_registered_connection() {
        let manager = manager();
        let (mut rx, _close) = register(&manager, 1, 4);

        manager.deliver(ConnectionId(1), response("a"));
        manager.deliver(ConnectionId(1), response("b"));

        assert_eq!(rx.try_recv().unwrap().id, "a");
        assert_eq!(rx.try_recv().unwrap().id, "b");
    }

    #[test]
    fn test_deliver_to_unknown_connection_is_dropped() {
        let manager = manager();
        let (mut rx, _close) = register(&manager, 1, 4);

        manager.deliver(ConnectionId(2), response("x"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_closes_connection() {
        let manager = manager();
        let (mut rx, close) = register(&manager, 1, 1);

        manager.deliver(ConnectionId(1), response("first"));
        assert!(!close.is_cancelled());
        manager.deliver(ConnectionId(1), response("second"));
        assert!(close.is_cancelled());

        assert_eq!(rx.try_recv().unwrap().id, "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_admission_once_closed() {
        let manager = manager();
        assert!(manager.admit(|_, _, _| async {}).is_ok());

        manager.wait_closed().await;
        assert!(matches!(
            manager.admit(|_, _, _| async {}),
            Err(SessionError::ShuttingDown)
        ));
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_no_admission_after_shutdown() {
        let shutdown = CancellationToken::new();
        let (submitter, _queue) = dispatch_channel(shutdown.clone());
        let manager = SessionManager::new(
            SessionConfig::from(&ServerConfig::default()),
            submitter,
            shutdown.clone(),
        );
        shutdown.cancel();
        assert!(manager.admit(|_, _, _| async {}).is_err());
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_deregister_removes_once() {
        let manager = manager();
        let (_rx, _close) = register(&manager, 1, 1);
        assert_eq!(manager.connection_count(), 1);

        manager.deregister(ConnectionId(1));
        manager.deregister(ConnectionId(1));
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.is_registered(ConnectionId(1)));
    }
}
