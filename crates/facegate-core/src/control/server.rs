//! Control channel server: accept loop plus per-connection read/write tasks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::transport::LocalListener;
use super::{CommandHandler, ControlCodec, ControlEndpoint, ControlError};

/// A running control channel.
pub struct ControlServer {
    endpoint: ControlEndpoint,
    stop: CancellationToken,
    tracker: TaskTracker,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl ControlServer {
    /// Bind `endpoint` and start accepting connections.
    pub async fn open(
        endpoint: ControlEndpoint,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, ControlError> {
        let listener = LocalListener::bind(&endpoint).await?;
        info!(endpoint = %endpoint, "Control channel listening");

        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            handler,
            stop.clone(),
            tracker.clone(),
        ));

        Ok(Self {
            endpoint,
            stop,
            tracker,
            accept: Mutex::new(Some(accept)),
        })
    }

    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    /// Stop accepting, end every connection after its queued replies are
    /// written, and remove the endpoint. Safe to call more than once.
    pub async fn close(&self) {
        self.stop.cancel();
        let accept = self.accept.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(accept) = accept {
            if let Err(e) = accept.await {
                warn!(error = %e, "Control accept task failed");
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        debug!(endpoint = %self.endpoint, "Control channel closed");
    }
}

async fn accept_loop(
    mut listener: LocalListener,
    handler: Arc<dyn CommandHandler>,
    stop: CancellationToken,
    tracker: TaskTracker,
) {
    let mut next_id: u64 = 1;
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                let id = next_id;
                next_id += 1;
                debug!(control_connection = id, "Control client connected");
                tracker.spawn(serve_connection(
                    stream,
                    id,
                    Arc::clone(&handler),
                    stop.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Control accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serve one control connection until the peer hangs up or `stop` fires.
///
/// Replies already produced are written before the connection is closed.
pub async fn serve_connection<S>(
    stream: S,
    id: u64,
    handler: Arc<dyn CommandHandler>,
    stop: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut frames) = Framed::new(stream, ControlCodec).split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(16);

    let reader = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(command)) => {
                    debug!(control_connection = id, command = %command, "Control command");
                    let reply = handler.handle(id, &command);
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(control_connection = id, "Bad control frame: {e}");
                    break;
                }
                None => break,
            }
        }
    });

    while let Some(reply) = reply_rx.recv().await {
        if let Err(e) = sink.send(reply).await {
            debug!(control_connection = id, "Control reply failed: {e}");
            break;
        }
    }
    drop(reply_rx);
    let _ = sink.close().await;

    if let Err(e) = reader.await {
        warn!(control_connection = id, error = %e, "Control read task failed");
    }
    debug!(control_connection = id, "Control client disconnected");
}
