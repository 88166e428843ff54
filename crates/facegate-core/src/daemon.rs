//! Service wiring: startup order, the main wait loop, and control commands.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use facegate_config::{AppConfig, EngineConfig};

use crate::build_info;
use crate::control::{CommandHandler, ControlEndpoint, ControlError, ControlServer, MAX_FRAME_LEN};
use crate::engine::{EngineInit, FeatureEngine, select_engine};
use crate::gateway::{EngineGateway, GatewayError, dispatch_channel};
use crate::logging::LogReader;
use crate::session::{self, SessionConfig, SessionManager};
use crate::shutdown::{ServiceParts, ShutdownCoordinator};

/// Reply to `quit` and `stop`.
pub const QUIT_REPLY: &str = "app will quit";

/// Lines returned by the `logs` command.
const LOG_TAIL_LINES: usize = 50;

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("engine backend {0:?} is not available")]
    UnknownEngine(String),

    #[error("failed to read engine config {path}: {source}")]
    EngineConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    EngineInit(#[from] GatewayError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A configured, not yet started service.
pub struct Daemon {
    config: AppConfig,
    engine: Arc<dyn FeatureEngine>,
    endpoint: ControlEndpoint,
    logs: Option<LogReader>,
    quit: CancellationToken,
}

impl Daemon {
    pub fn new(config: AppConfig, engine: Arc<dyn FeatureEngine>, endpoint: ControlEndpoint) -> Self {
        Self {
            config,
            engine,
            endpoint,
            logs: None,
            quit: CancellationToken::new(),
        }
    }

    /// Build a daemon with the configured engine and control endpoint.
    pub fn from_config(config: AppConfig) -> Result<Self, DaemonError> {
        let engine = select_engine(&config.engine)
            .ok_or_else(|| DaemonError::UnknownEngine(config.engine.backend.clone()))?;
        let endpoint = ControlEndpoint::from_config(&config.control)?;
        Ok(Self::new(config, engine, endpoint))
    }

    /// Serve recent log lines through the `logs` control command.
    pub fn with_log_reader(mut self, reader: LogReader) -> Self {
        self.logs = Some(reader);
        self
    }

    /// Cancelling this token asks the running service to shut down.
    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Bring the service up: engine, then control channel, then the
    /// streaming listener. A failing step tears down the earlier ones.
    pub async fn start(self) -> Result<RunningDaemon, DaemonError> {
        let started_at = Instant::now();
        let server = &self.config.server;
        info!(
            addr = %server.listen_addr,
            port = server.listen_port,
            engine = self.engine.name(),
            version = %build_info::version_string(),
            "facegate starting"
        );

        let init = engine_init(&self.config.engine)?;

        let shutdown = CancellationToken::new();
        let (submitter, queue) = dispatch_channel(shutdown.clone());
        let sessions = Arc::new(SessionManager::new(
            SessionConfig::from(server),
            submitter,
            shutdown.clone(),
        ));

        let gateway = Arc::new(
            EngineGateway::start(
                Arc::clone(&self.engine),
                sessions.clone(),
                init,
                queue,
                shutdown.clone(),
            )
            .await?,
        );

        let commands = Arc::new(ServiceCommands {
            quit: self.quit.clone(),
            sessions: Arc::clone(&sessions),
            gateway: Arc::clone(&gateway),
            logs: self.logs.clone(),
            started_at,
        });
        let control = match ControlServer::open(self.endpoint.clone(), commands).await {
            Ok(control) => Arc::new(control),
            Err(e) => {
                shutdown.cancel();
                gateway.release().await;
                return Err(e.into());
            }
        };

        let addr = server.bind_address();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                shutdown.cancel();
                gateway.release().await;
                control.close().await;
                return Err(DaemonError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr()?;

        let accept_stop = CancellationToken::new();
        let router = session::router(Arc::clone(&sessions), &server.path);
        let accept = {
            let stop = accept_stop.clone();
            let quit = self.quit.clone();
            tokio::spawn(async move {
                let result = session::serve(listener, router, stop).await;
                if let Err(e) = &result {
                    error!(error = %e, "Streaming listener failed, shutting down");
                    quit.cancel();
                }
                result
            })
        };
        info!(%local_addr, path = %server.path, "Streaming listener ready");

        let coordinator = ShutdownCoordinator::new(ServiceParts {
            accept_stop,
            accept,
            shutdown,
            sessions: Arc::clone(&sessions),
            gateway: Arc::clone(&gateway),
            control: Arc::clone(&control),
        });

        Ok(RunningDaemon {
            local_addr,
            endpoint: self.endpoint,
            sessions,
            gateway,
            coordinator,
            quit: self.quit,
            stats_interval: Duration::from_secs(server.stats_interval_secs),
        })
    }
}

/// Handles to a started service.
pub struct RunningDaemon {
    local_addr: SocketAddr,
    endpoint: ControlEndpoint,
    sessions: Arc<SessionManager>,
    gateway: Arc<EngineGateway>,
    coordinator: ShutdownCoordinator,
    quit: CancellationToken,
    stats_interval: Duration,
}

impl RunningDaemon {
    /// Address the streaming listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn control_endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.connection_count()
    }

    pub fn pending_count(&self) -> usize {
        self.gateway.pending_count()
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// Wait for a quit request or Ctrl-C, then shut down.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(ctrl_c);

        let mut stats = tokio::time::interval_at(
            tokio::time::Instant::now() + self.stats_interval,
            self.stats_interval,
        );

        loop {
            tokio::select! {
                _ = self.quit.cancelled() => {
                    info!("Quit requested");
                    break;
                }
                _ = &mut ctrl_c => {
                    warn!("Ctrl-C received, initiating graceful shutdown");
                    break;
                }
                _ = stats.tick() => {
                    debug!(
                        connections = self.connection_count(),
                        pending = self.pending_count(),
                        "Runtime stats"
                    );
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Run the ordered teardown. Idempotent.
    pub async fn shutdown(&self) {
        self.quit.cancel();
        self.coordinator.shutdown().await;
    }
}

/// Read engine settings and resolve the model path.
///
/// Relative paths are taken against the executable's directory.
pub fn engine_init(config: &EngineConfig) -> Result<EngineInit, DaemonError> {
    let base = exe_dir();
    let settings = match config.config_file.as_deref() {
        Some(file) => {
            let path = resolve_against(&base, file);
            std::fs::read_to_string(&path)
                .map_err(|source| DaemonError::EngineConfig { path, source })?
        }
        None => String::new(),
    };
    Ok(EngineInit {
        settings,
        model_path: resolve_against(&base, &config.model_path),
    })
}

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve_against(base: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Control commands understood by a running service.
struct ServiceCommands {
    quit: CancellationToken,
    sessions: Arc<SessionManager>,
    gateway: Arc<EngineGateway>,
    logs: Option<LogReader>,
    started_at: Instant,
}

impl CommandHandler for ServiceCommands {
    fn handle(&self, connection: u64, command: &str) -> String {
        match command.to_ascii_lowercase().as_str() {
            "quit" | "stop" => {
                info!(control_connection = connection, "Quit requested over control channel");
                self.quit.cancel();
                QUIT_REPLY.to_string()
            }
            "status" => format!(
                "running: connections={} pending={} uptime={}s",
                self.sessions.connection_count(),
                self.gateway.pending_count(),
                self.started_at.elapsed().as_secs()
            ),
            "version" => build_info::version_string(),
            "logs" => match &self.logs {
                Some(reader) => tail_within_frame(reader.render_tail(LOG_TAIL_LINES)),
                None => "log capture is not enabled".to_string(),
            },
            _ => format!("unknown command: {command}"),
        }
    }
}

/// Keep the end of `text` so it fits in one control frame.
fn tail_within_frame(text: String) -> String {
    if text.len() <= MAX_FRAME_LEN {
        return text;
    }
    let mut start = text.len() - MAX_FRAME_LEN;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyntheticEngine;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> (AppConfig, ControlEndpoint) {
        let mut config = AppConfig::default();
        config.server.listen_port = 0;
        let endpoint =
            ControlEndpoint::new(dir.path().join("facegate.sock").to_string_lossy().into_owned());
        config.control.endpoint = Some(endpoint.to_string());
        (config, endpoint)
    }

    #[test]
    fn test_resolve_against() {
        let base = Path::new("/opt/facegate");
        assert_eq!(
            resolve_against(base, "xface.json"),
            PathBuf::from("/opt/facegate/xface.json")
        );
        assert_eq!(resolve_against(base, "/etc/x.json"), PathBuf::from("/etc/x.json"));
    }

    #[test]
    fn test_engine_init_without_settings_file() {
        let init = engine_init(&EngineConfig::default()).unwrap();
        assert!(init.settings.is_empty());
        assert!(init.model_path.ends_with("models_bit8/model_conf.json"));
    }

    #[test]
    fn test_engine_init_missing_settings_file() {
        let config = EngineConfig {
            config_file: Some("/nonexistent/xface.json".into()),
            ..Default::default()
        };
        assert!(matches!(
            engine_init(&config),
            Err(DaemonError::EngineConfig { .. })
        ));
    }

    #[test]
    fn test_tail_within_frame() {
        assert_eq!(tail_within_frame("short".into()), "short");
        let long = "é".repeat(MAX_FRAME_LEN);
        let tail = tail_within_frame(long);
        assert!(tail.len() <= MAX_FRAME_LEN);
        assert!(tail.chars().all(|c| c == 'é'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_from_config_uses_override_endpoint() {
        let dir = TempDir::new().unwrap();
        let (config, endpoint) = test_config(&dir);
        let daemon = Daemon::from_config(config).unwrap();
        assert_eq!(daemon.endpoint, endpoint);
        assert_eq!(daemon.config().server.listen_port, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_shutdown_twice() {
        let dir = TempDir::new().unwrap();
        let (config, endpoint) = test_config(&dir);
        let running = Daemon::new(config, Arc::new(SyntheticEngine::new()), endpoint.clone())
            .start()
            .await
            .unwrap();
        assert_ne!(running.local_addr().port(), 0);
        assert!(Path::new(endpoint.as_str()).exists());

        running.shutdown().await;
        running.shutdown().await;
        assert_eq!(running.connection_count(), 0);
        assert!(!Path::new(endpoint.as_str()).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_instance_is_refused() {
        let dir = TempDir::new().unwrap();
        let (config, endpoint) = test_config(&dir);
        let first = Daemon::new(
            config.clone(),
            Arc::new(SyntheticEngine::new()),
            endpoint.clone(),
        )
        .start()
        .await
        .unwrap();

        let second = Daemon::new(config, Arc::new(SyntheticEngine::new()), endpoint)
            .start()
            .await;
        assert!(matches!(
            second,
            Err(DaemonError::Control(ControlError::AlreadyRunning(_)))
        ));

        first.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_failure_rolls_back_control_channel() {
        let dir = TempDir::new().unwrap();
        let (mut config, endpoint) = test_config(&dir);
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        config.server.listen_port = occupied.local_addr().unwrap().port();

        let result = Daemon::new(config, Arc::new(SyntheticEngine::new()), endpoint.clone())
            .start()
            .await;
        assert!(matches!(result, Err(DaemonError::Bind { .. })));
        assert!(!Path::new(endpoint.as_str()).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quit_token_ends_run() {
        let dir = TempDir::new().unwrap();
        let (config, endpoint) = test_config(&dir);
        let daemon = Daemon::new(config, Arc::new(SyntheticEngine::new()), endpoint);
        let quit = daemon.quit_token();
        let running = daemon.start().await.unwrap();

        quit.cancel();
        tokio::time::timeout(Duration::from_secs(5), running.run())
            .await
            .expect("run did not return")
            .unwrap();
    }
}
