//! Ordered teardown of a running service.
//!
//! 1. stop accepting streaming connections and wait for the accept task
//! 2. cancel the shared token (sessions and dispatch begin closing)
//! 3. wait for every session to finish
//! 4. release the engine
//! 5. close the control channel

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::control::ControlServer;
use crate::gateway::EngineGateway;
use crate::session::SessionManager;

/// Everything the coordinator tears down.
pub struct ServiceParts {
    pub accept_stop: CancellationToken,
    pub accept: JoinHandle<Result<(), std::io::Error>>,
    pub shutdown: CancellationToken,
    pub sessions: Arc<SessionManager>,
    pub gateway: Arc<EngineGateway>,
    pub control: Arc<ControlServer>,
}

/// Runs the teardown sequence exactly once.
pub struct ShutdownCoordinator {
    parts: Mutex<Option<ServiceParts>>,
}

impl ShutdownCoordinator {
    pub fn new(parts: ServiceParts) -> Self {
        Self {
            parts: Mutex::new(Some(parts)),
        }
    }

    /// Tear the service down. Later calls wait for the first to finish and
    /// then return without doing anything.
    pub async fn shutdown(&self) {
        let mut guard = self.parts.lock().await;
        let Some(parts) = guard.take() else {
            debug!("Shutdown already complete");
            return;
        };

        info!("Shutting down");

        parts.accept_stop.cancel();
        match parts.accept.await {
            Ok(Ok(())) => debug!("Streaming listener stopped"),
            Ok(Err(e)) => error!(error = %e, "Streaming listener failed"),
            Err(e) => error!(error = %e, "Streaming listener task panicked"),
        }

        parts.shutdown.cancel();

        let live = parts.sessions.connection_count();
        debug!(live, "Waiting for sessions to close");
        parts.sessions.wait_closed().await;

        parts.gateway.release().await;

        parts.control.close().await;

        info!("Shutdown complete");
    }
}
