//! Daemon test helpers.
//!
//! [`TestDaemon`] starts a real service on an ephemeral port with a control
//! endpoint unique to its temp directory, and offers WebSocket and control
//! helpers for driving it.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use facegate_config::AppConfig;
use facegate_core::protocol::FaceResponse;
use facegate_core::{ControlEndpoint, Daemon, RunningDaemon, send_command};

use crate::config::TestConfigBuilder;
use crate::engine::ScriptedEngine;

/// Client side of a streaming connection.
pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long helpers wait for a frame before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A running daemon scoped to one test.
///
/// The temp directory (and with it the control endpoint's name) lives as
/// long as this value.
pub struct TestDaemon {
    pub running: RunningDaemon,
    pub engine: Arc<ScriptedEngine>,
    pub config: AppConfig,
    _temp_dir: TempDir,
}

impl TestDaemon {
    /// Start with default test configuration.
    pub async fn start(engine: Arc<ScriptedEngine>) -> Self {
        Self::with_config(TestConfigBuilder::new(), engine).await
    }

    /// Start with a customised configuration.
    pub async fn with_config(builder: TestConfigBuilder, engine: Arc<ScriptedEngine>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let endpoint = ControlEndpoint::for_directory(temp_dir.path());
        let config = builder.control_endpoint(endpoint.as_str()).build();
        config.validate().expect("invalid test config");

        let running = Daemon::new(config.clone(), engine.clone(), endpoint)
            .start()
            .await
            .expect("failed to start test daemon");

        Self {
            running,
            engine,
            config,
            _temp_dir: temp_dir,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.running.local_addr(), self.config.server.path)
    }

    /// Open a streaming connection and wait until the service registered it.
    pub async fn connect(&self) -> WsClient {
        let before = self.running.connection_count();
        let (ws, _) = connect_async(self.ws_url())
            .await
            .expect("websocket connect failed");
        self.wait_for_connections(before + 1).await;
        ws
    }

    /// Attempt an upgrade on an arbitrary path.
    pub async fn connect_at(&self, path: &str) -> Result<WsClient, WsError> {
        let url = format!("ws://{}{}", self.running.local_addr(), path);
        connect_async(url).await.map(|(ws, _)| ws)
    }

    /// Poll until exactly `n` sessions are registered.
    pub async fn wait_for_connections(&self, n: usize) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.running.connection_count() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {n} connections, have {}",
                self.running.connection_count()
            )
        });
    }

    /// Send one control command and return the reply.
    pub async fn control(&self, command: &str) -> String {
        send_command(
            self.running.control_endpoint(),
            command,
            Some(RECV_TIMEOUT),
        )
        .await
        .expect("control command failed")
    }

    pub async fn shutdown(&self) {
        self.running.shutdown().await;
    }
}

/// Send a raw text frame.
pub async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.into()))
        .await
        .expect("websocket send failed");
}

/// Send a raw text frame, reporting whether the transport accepted it.
pub async fn try_send_text(ws: &mut WsClient, text: &str) -> bool {
    ws.send(Message::Text(text.into())).await.is_ok()
}

/// Next text frame as raw JSON, skipping control frames.
///
/// # Panics
///
/// Panics on timeout, close, or error.
pub async fn recv_text(ws: &mut WsClient) -> String {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a response")
}

/// Next response, parsed.
pub async fn recv_response(ws: &mut WsClient) -> FaceResponse {
    let text = recv_text(ws).await;
    serde_json::from_str(&text).expect("response is not valid JSON")
}

/// Assert nothing but control frames arrives within `wait`.
pub async fn assert_silent(ws: &mut WsClient, wait: Duration) {
    let got = tokio::time::timeout(wait, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(got.is_err(), "unexpected frame: {got:?}");
}

/// Wait until the server closes the connection.
pub async fn expect_closed(ws: &mut WsClient) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("connection was not closed");
}
