//! Read and write/keepalive loops for one streaming session.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SessionError, SessionManager};
use crate::id::ConnectionId;
use crate::protocol::{FaceRequest, FaceResponse, Request};

/// How long a closing session may spend on writes still in flight.
const WRITE_GRACE: Duration = Duration::from_secs(1);

/// Removes the session from the registry when the write side finishes.
struct Registration {
    manager: Arc<SessionManager>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.manager.deregister(self.id);
    }
}

/// Drive a session until either side stops, then run the close sequence.
pub(super) async fn run(
    manager: Arc<SessionManager>,
    id: ConnectionId,
    socket: WebSocket,
    mut outbound: mpsc::Receiver<FaceResponse>,
    close: CancellationToken,
) {
    let registration = Registration {
        manager: Arc::clone(&manager),
        id,
    };
    let (mut sink, stream) = socket.split();
    let mut reader: JoinHandle<Result<(), SessionError>> = tokio::spawn(read_loop(
        Arc::clone(&manager),
        id,
        stream,
        close.clone(),
    ));

    let ping_interval = manager.config.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut writable = true;
    let mut read_finished = false;

    loop {
        tokio::select! {
            joined = &mut reader => {
                read_finished = true;
                log_read_outcome(id, joined);
                break;
            }
            _ = close.cancelled() => break,
            _ = ping.tick() => {
                if let Err(e) = send_frame(&mut sink, Message::Ping(Bytes::new()), &close).await {
                    debug!(connection_id = %id, error = %e, "Ping failed");
                    writable = false;
                    break;
                }
            }
            next = outbound.recv() => {
                let Some(response) = next else { break };
                if let Err(e) = write_response(&mut sink, &response, &close).await {
                    debug!(connection_id = %id, error = %e, "Write failed");
                    writable = false;
                    break;
                }
            }
        }
    }

    if !read_finished {
        close.cancel();
        log_read_outcome(id, reader.await);
    }

    // No deliveries are accepted once the session leaves the registry.
    drop(registration);
    outbound.close();

    // A peer that stopped reading gets one grace period for the whole flush.
    if writable {
        let flushed = tokio::time::timeout(WRITE_GRACE, async {
            while let Ok(response) = outbound.try_recv() {
                write_response(&mut sink, &response, &close).await?;
            }
            sink.send(Message::Close(None)).await?;
            sink.close().await?;
            Ok::<_, SessionError>(())
        })
        .await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection_id = %id, error = %e, "Flush failed"),
            Err(_) => debug!(connection_id = %id, "Flush timed out, dropping transport"),
        }
    }
}

async fn read_loop(
    manager: Arc<SessionManager>,
    id: ConnectionId,
    mut stream: SplitStream<WebSocket>,
    close: CancellationToken,
) -> Result<(), SessionError> {
    let pong_wait = manager.config.pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            biased;
            _ = close.cancelled() => return Ok(()),
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => return Err(SessionError::PongTimeout(pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(message)) => message?,
        };

        let wire: FaceRequest = match message {
            Message::Text(text) => serde_json::from_str(text.as_str())?,
            Message::Binary(data) => serde_json::from_slice(&data)?,
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => return Ok(()),
        };
        let request = Request::new(wire, manager.ids.get(), id);
        debug!(
            connection_id = %id,
            correlation_id = %request.correlation_id,
            request_id = %request.id,
            "Request received"
        );

        let submitted = tokio::select! {
            biased;
            _ = close.cancelled() => return Ok(()),
            submitted = manager.submitter.submit(request) => submitted,
        };
        submitted?;
    }
}

async fn write_response(
    sink: &mut SplitSink<WebSocket, Message>,
    response: &FaceResponse,
    close: &CancellationToken,
) -> Result<(), SessionError> {
    let json = serde_json::to_string(response)?;
    send_frame(sink, Message::Text(json.into()), close).await
}

/// Send one frame. Once `close` fires the send gets [`WRITE_GRACE`] to
/// finish, so a peer that stopped reading cannot hold the session open.
async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    close: &CancellationToken,
) -> Result<(), SessionError> {
    let send = sink.send(message);
    tokio::pin!(send);
    tokio::select! {
        sent = &mut send => Ok(sent?),
        _ = close.cancelled() => match tokio::time::timeout(WRITE_GRACE, send).await {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(SessionError::WriteStalled(WRITE_GRACE)),
        },
    }
}

fn log_read_outcome(
    id: ConnectionId,
    joined: Result<Result<(), SessionError>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(())) => debug!(connection_id = %id, "Read side finished"),
        Ok(Err(SessionError::Submit(e))) => debug!(connection_id = %id, "Read side stopped: {e}"),
        Ok(Err(e)) => warn!(connection_id = %id, "Session terminated: {e}"),
        Err(e) => warn!(connection_id = %id, error = %e, "Read task failed"),
    }
}
