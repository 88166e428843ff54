//! Engine gateway: serialized dispatch into the engine and completion routing.
//!
//! Sessions hand requests to a [`Submitter`]. One dispatch task drains the
//! hand-off queue, resolves content, records the request in the
//! [`PendingTable`] and submits it. Completions arrive on the engine's own
//! thread and are matched back to their request by correlation id before
//! being handed to the [`ResponseSink`].

mod pending;
mod resolve;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{CompletionCallback, EngineInit, EngineOutput, FeatureEngine, status};
use crate::id::CorrelationId;
use crate::protocol::{FaceFeature, Request, result_code};
use crate::session::ResponseSink;

pub use pending::PendingTable;
pub use resolve::resolve_content;

/// Why a request produced an error response instead of features.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("resource not found: {path}: {source}")]
    ResourceNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine rejected submission with status {0}")]
    EngineRejected(i32),

    #[error("no feature found")]
    NoFeatureFound,

    #[error("engine reported error {0}")]
    EngineReported(i32),
}

impl RequestError {
    /// The `result` value sent to the client.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameters(_) => result_code::INVALID_PARAMETERS,
            Self::ResourceNotFound { .. } => result_code::RESOURCE_NOT_FOUND,
            Self::NoFeatureFound => result_code::NO_FEATURE,
            Self::EngineRejected(code) | Self::EngineReported(code) => *code,
        }
    }
}

/// Errors handing a request to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("service is shutting down")]
    ShuttingDown,

    #[error("dispatcher has stopped")]
    Closed,
}

/// Errors bringing the gateway up.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("engine init failed with status {0}")]
    Init(i32),

    #[error("engine init task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Producer side of the dispatch hand-off.
#[derive(Debug, Clone)]
pub struct Submitter {
    tx: mpsc::Sender<Request>,
    shutdown: CancellationToken,
}

impl Submitter {
    /// Hand a request to the dispatcher, waiting while it is busy.
    pub async fn submit(&self, request: Request) -> Result<(), SubmitError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SubmitError::ShuttingDown),
            sent = self.tx.send(request) => sent.map_err(|_| SubmitError::Closed),
        }
    }
}

/// Consumer side of the dispatch hand-off, owned by the gateway.
#[derive(Debug)]
pub struct DispatchQueue {
    rx: mpsc::Receiver<Request>,
}

/// Create the single-slot hand-off between sessions and the dispatcher.
pub fn dispatch_channel(shutdown: CancellationToken) -> (Submitter, DispatchQueue) {
    let (tx, rx) = mpsc::channel(1);
    (Submitter { tx, shutdown }, DispatchQueue { rx })
}

/// State shared with the engine's completion callback.
struct CompletionRouter {
    pending: PendingTable,
    sink: Arc<dyn ResponseSink>,
}

impl CompletionRouter {
    fn complete(&self, id: CorrelationId, output: Option<EngineOutput>) {
        let Some(request) = self.pending.take(id) else {
            debug!(correlation_id = %id, "Discarding completion with no pending request");
            return;
        };

        let outcome = match output {
            None => Err(RequestError::NoFeatureFound),
            Some(out) if out.error_code != status::OK => {
                Err(RequestError::EngineReported(out.error_code))
            }
            Some(out) if out.features.is_empty() => Err(RequestError::NoFeatureFound),
            Some(out) => Ok(out
                .features
                .into_iter()
                .map(FaceFeature::from)
                .collect::<Vec<_>>()),
        };

        let response = match outcome {
            Ok(features) => {
                debug!(
                    correlation_id = %id,
                    connection_id = %request.connection_id,
                    faces = features.len(),
                    "Request completed"
                );
                request.success(features)
            }
            Err(e) => {
                debug!(
                    correlation_id = %id,
                    connection_id = %request.connection_id,
                    code = e.code(),
                    "Request completed with error: {e}"
                );
                request.error(e.code())
            }
        };
        self.sink.deliver(request.connection_id, response);
    }

    fn fail(&self, request: &Request, err: RequestError) {
        debug!(
            correlation_id = %request.correlation_id,
            connection_id = %request.connection_id,
            request_id = %request.id,
            code = err.code(),
            "Request failed: {err}"
        );
        self.sink.deliver(request.connection_id, request.error(err.code()));
    }
}

/// Owns the engine, the pending table, and the dispatch task.
pub struct EngineGateway {
    engine: Arc<dyn FeatureEngine>,
    router: Arc<CompletionRouter>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl EngineGateway {
    /// Initialise the engine and start the dispatch task.
    ///
    /// The task stops when `shutdown` is cancelled or every [`Submitter`]
    /// has been dropped.
    pub async fn start(
        engine: Arc<dyn FeatureEngine>,
        sink: Arc<dyn ResponseSink>,
        params: EngineInit,
        queue: DispatchQueue,
        shutdown: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let router = Arc::new(CompletionRouter {
            pending: PendingTable::new(),
            sink,
        });

        let callback_router = Arc::clone(&router);
        let callback: CompletionCallback =
            Arc::new(move |id, output| callback_router.complete(id, output));

        let init_engine = Arc::clone(&engine);
        let code = tokio::task::spawn_blocking(move || init_engine.init(&params, callback)).await?;
        if code != status::OK {
            return Err(GatewayError::Init(code));
        }
        info!(engine = engine.name(), "Engine initialised");

        let handle = tokio::spawn(run_dispatch(
            Arc::clone(&engine),
            Arc::clone(&router),
            queue,
            shutdown,
        ));

        Ok(Self {
            engine,
            router,
            dispatch: Mutex::new(Some(handle)),
            released: AtomicBool::new(false),
        })
    }

    /// Number of requests accepted by the engine and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.router.pending.len()
    }

    /// Wait for the dispatch task to stop, then uninit the engine.
    ///
    /// The shutdown token must already be cancelled. Safe to call more than
    /// once; the engine is released exactly once.
    pub async fn release(&self) {
        let handle = self
            .dispatch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch task ended abnormally");
            }
        }

        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let engine = Arc::clone(&self.engine);
        if let Err(e) = tokio::task::spawn_blocking(move || engine.uninit()).await {
            warn!(error = %e, "Engine uninit task failed");
        }

        let abandoned = self.router.pending.clear();
        if abandoned > 0 {
            warn!(abandoned, "Pending requests abandoned at engine release");
        }
        info!("Engine released");
    }
}

async fn run_dispatch(
    engine: Arc<dyn FeatureEngine>,
    router: Arc<CompletionRouter>,
    mut queue: DispatchQueue,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = queue.rx.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };
        dispatch_one(&engine, &router, request).await;
    }
    queue.rx.close();
    debug!("Dispatch task stopped");
}

async fn dispatch_one(
    engine: &Arc<dyn FeatureEngine>,
    router: &Arc<CompletionRouter>,
    mut request: Request,
) {
    let content = std::mem::take(&mut request.content);
    let buffer = match resolve_content(request.kind, &content).await {
        Ok(buffer) => buffer,
        Err(e) => {
            router.fail(&request, e);
            return;
        }
    };
    drop(content);

    let id = request.correlation_id;
    let mode = request.predict_mode;
    let max_faces = request.max_face_count;

    // Recorded before submitting: the engine may complete before submit returns.
    router.pending.insert(request);

    let engine = Arc::clone(engine);
    let code = tokio::task::spawn_blocking(move || engine.submit(id, mode, max_faces, &buffer))
        .await
        .unwrap_or_else(|e| {
            warn!(correlation_id = %id, error = %e, "Engine submit task failed");
            status::OTHER
        });

    if code != status::OK {
        if let Some(request) = router.pending.take(id) {
            router.fail(&request, RequestError::EngineRejected(code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ConnectionId;
    use crate::protocol::{FaceRequest, FaceResponse};
    use crate::engine::EngineFeature;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicI32, AtomicUsize};
    use std::time::Duration;

    #[derive(Default)]
    struct ManualEngine {
        callback: Mutex<Option<CompletionCallback>>,
        submissions: Mutex<Vec<(CorrelationId, Vec<u8>)>>,
        reject_with: AtomicI32,
        uninits: AtomicUsize,
    }

    impl ManualEngine {
        fn complete(&self, id: CorrelationId, output: Option<EngineOutput>) {
            let callback = self.callback.lock().unwrap().clone().unwrap();
            callback(id, output);
        }

        fn submissions(&self) -> Vec<(CorrelationId, Vec<u8>)> {
            self.submissions.lock().unwrap().clone()
        }

        async fn wait_for_submissions(&self, n: usize) -> Vec<(CorrelationId, Vec<u8>)> {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let subs = self.submissions();
                    if subs.len() >= n {
                        return subs;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("engine never saw the submission")
        }
    }

    impl FeatureEngine for ManualEngine {
        fn name(&self) -> &str {
            "manual"
        }

        fn init(&self, _params: &EngineInit, callback: CompletionCallback) -> i32 {
            *self.callback.lock().unwrap() = Some(callback);
            status::OK
        }

        fn submit(&self, id: CorrelationId, _mode: i32, _max: i32, buffer: &[u8]) -> i32 {
            self.submissions.lock().unwrap().push((id, buffer.to_vec()));
            self.reject_with.load(Ordering::SeqCst)
        }

        fn uninit(&self) {
            self.uninits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<(ConnectionId, FaceResponse)>);

    impl ResponseSink for ChannelSink {
        fn deliver(&self, connection: ConnectionId, response: FaceResponse) {
            let _ = self.0.send((connection, response));
        }
    }

    struct Harness {
        engine: Arc<ManualEngine>,
        gateway: EngineGateway,
        submitter: Submitter,
        responses: mpsc::UnboundedReceiver<(ConnectionId, FaceResponse)>,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn new() -> Self {
            let shutdown = CancellationToken::new();
            let engine = Arc::new(ManualEngine::default());
            let (tx, responses) = mpsc::unbounded_channel();
            let (submitter, queue) = dispatch_channel(shutdown.clone());
            let gateway = EngineGateway::start(
                engine.clone(),
                Arc::new(ChannelSink(tx)),
                EngineInit::default(),
                queue,
                shutdown.clone(),
            )
            .await
            .unwrap();
            Self {
                engine,
                gateway,
                submitter,
                responses,
                shutdown,
            }
        }

        async fn submit(&self, raw: &str, correlation: u64, connection: u64) {
            let wire: FaceRequest = serde_json::from_str(raw).unwrap();
            let request = Request::new(wire, CorrelationId(correlation), ConnectionId(connection));
            self.submitter.submit(request).await.unwrap();
        }

        async fn next_response(&mut self) -> (ConnectionId, FaceResponse) {
            tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
                .await
                .expect("no response delivered")
                .expect("sink dropped")
        }

        async fn assert_no_response(&mut self) {
            let got = tokio::time::timeout(Duration::from_millis(100), self.responses.recv()).await;
            assert!(got.is_err(), "unexpected response: {got:?}");
        }
    }

    fn one_face() -> EngineOutput {
        EngineOutput {
            error_code: 0,
            features: vec![EngineFeature {
                metric: vec![0.5; 4],
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn test_inline_request_round_trip() {
        let mut h = Harness::new().await;
        h.submit(
            r#"{"id":"r1","cmd":"feature","type":1,"content":"YWJjZA==","max_face_count":1}"#,
            10,
            3,
        )
        .await;

        let subs = h.engine.wait_for_submissions(1).await;
        assert_eq!(subs, vec![(CorrelationId(10), b"abcd".to_vec())]);
        assert_eq!(h.gateway.pending_count(), 1);

        h.engine.complete(CorrelationId(10), Some(one_face()));
        let (conn, resp) = h.next_response().await;
        assert_eq!(conn, ConnectionId(3));
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.cmd, "feature");
        assert_eq!(resp.result, 0);
        assert_eq!(resp.content.unwrap()[0].metric, "0.5,0.5,0.5,0.5");
        assert_eq!(h.gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_base64_skips_engine() {
        let mut h = Harness::new().await;
        h.submit(r#"{"id":"r2","cmd":"feature","type":1,"content":"%%%"}"#, 1, 1)
            .await;

        let (_, resp) = h.next_response().await;
        assert_eq!(resp.result, -1);
        assert!(resp.content.is_none());
        assert!(h.engine.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_reports_not_found() {
        let mut h = Harness::new().await;
        h.submit(
            r#"{"id":"r3","cmd":"feature","type":0,"content":"/nonexistent/x.jpg"}"#,
            1,
            1,
        )
        .await;

        let (_, resp) = h.next_response().await;
        assert_eq!(resp.result, -2);
        assert!(h.engine.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_engine_rejection_is_reported_once() {
        let mut h = Harness::new().await;
        h.engine.reject_with.store(7, Ordering::SeqCst);
        h.submit(r#"{"id":"r4","type":1,"content":"YWJjZA=="}"#, 4, 2).await;

        let (conn, resp) = h.next_response().await;
        assert_eq!(conn, ConnectionId(2));
        assert_eq!(resp.result, 7);
        assert_eq!(h.gateway.pending_count(), 0);

        // A stray completion for the rejected id must not produce a second response.
        h.engine.complete(CorrelationId(4), Some(one_face()));
        h.assert_no_response().await;
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_completions_are_ignored() {
        let mut h = Harness::new().await;
        h.engine.complete(CorrelationId(99), Some(one_face()));
        h.assert_no_response().await;

        h.submit(r#"{"id":"r5","type":1,"content":"YWJjZA=="}"#, 5, 1).await;
        h.engine.wait_for_submissions(1).await;
        h.engine.complete(CorrelationId(5), Some(one_face()));
        h.engine.complete(CorrelationId(5), Some(one_face()));

        let (_, resp) = h.next_response().await;
        assert_eq!(resp.result, 0);
        h.assert_no_response().await;
    }

    #[tokio::test]
    async fn test_completion_error_mapping() {
        let mut h = Harness::new().await;
        for id in 0..3 {
            h.submit(r#"{"id":"m","type":1,"content":"YWJjZA=="}"#, id, 1).await;
        }
        h.engine.wait_for_submissions(3).await;

        h.engine.complete(CorrelationId(0), None);
        h.engine.complete(
            CorrelationId(1),
            Some(EngineOutput {
                error_code: 6,
                features: vec![],
            }),
        );
        h.engine.complete(CorrelationId(2), Some(EngineOutput::default()));

        assert_eq!(h.next_response().await.1.result, -3);
        assert_eq!(h.next_response().await.1.result, 6);
        assert_eq!(h.next_response().await.1.result, -3);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let h = Harness::new().await;
        h.shutdown.cancel();
        let request = Request::new(FaceRequest::default(), CorrelationId(0), ConnectionId(0));
        assert!(matches!(
            h.submitter.submit(request).await,
            Err(SubmitError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_blocked_submit_is_released_by_shutdown() {
        let shutdown = CancellationToken::new();
        let (submitter, _queue) = dispatch_channel(shutdown.clone());
        let request = |n| Request::new(FaceRequest::default(), CorrelationId(n), ConnectionId(1));

        // Nobody drains the queue, so the second submit waits for the slot.
        submitter.submit(request(0)).await.unwrap();
        let waiting = tokio::spawn({
            let submitter = submitter.clone();
            let second = request(1);
            async move { submitter.submit(second).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("submit stayed blocked")
            .unwrap();
        assert!(matches!(result, Err(SubmitError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_release_uninits_once() {
        let h = Harness::new().await;
        h.shutdown.cancel();
        h.gateway.release().await;
        h.gateway.release().await;
        assert_eq!(h.engine.uninits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_failure() {
        struct FailingEngine;
        impl FeatureEngine for FailingEngine {
            fn name(&self) -> &str {
                "failing"
            }
            fn init(&self, _: &EngineInit, _: CompletionCallback) -> i32 {
                status::CONFIG_ERROR
            }
            fn submit(&self, _: CorrelationId, _: i32, _: i32, _: &[u8]) -> i32 {
                status::UNINIT
            }
            fn uninit(&self) {}
        }

        let shutdown = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_submitter, queue) = dispatch_channel(shutdown.clone());
        let result = EngineGateway::start(
            Arc::new(FailingEngine),
            Arc::new(ChannelSink(tx)),
            EngineInit::default(),
            queue,
            shutdown,
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Init(13))));
    }

    #[test]
    fn test_request_error_codes() {
        assert_eq!(RequestError::InvalidParameters("x".into()).code(), -1);
        assert_eq!(RequestError::NoFeatureFound.code(), -3);
        assert_eq!(RequestError::EngineRejected(2).code(), 2);
        assert_eq!(RequestError::EngineReported(100).code(), 100);
    }
}
