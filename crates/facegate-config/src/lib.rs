#![deny(unsafe_code)]

//! Configuration loading and validation for facegate.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine back ends this build knows how to construct.
pub const ENGINE_BACKENDS: &[&str] = &["synthetic"];

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Streaming (WebSocket) listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Feature engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Local control channel configuration.
    #[serde(default)]
    pub control: ControlConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the streaming listener and its sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port the WebSocket listener binds (0 picks an ephemeral port).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Upgrade path for streaming clients.
    #[serde(default = "default_path")]
    pub path: String,

    /// Seconds a session may go without a pong before it is dropped.
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,

    /// Capacity of each session's outbound response queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Largest inbound WebSocket message accepted, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Interval between periodic runtime statistics log lines.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            path: default_path(),
            pong_wait_secs: default_pong_wait_secs(),
            outbound_queue: default_outbound_queue(),
            max_message_bytes: default_max_message_bytes(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl ServerConfig {
    /// Liveness window renewed by every pong.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keepalive ping interval: nine tenths of the pong window.
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    /// `listen_addr:listen_port` as a single string.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    9999
}

fn default_path() -> String {
    "/".to_string()
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_outbound_queue() -> usize {
    64
}

fn default_max_message_bytes() -> usize {
    32 * 1024 * 1024 // 32 MiB
}

fn default_stats_interval_secs() -> u64 {
    30
}

/// Feature engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine back end name (see [`ENGINE_BACKENDS`]).
    #[serde(default = "default_engine_backend")]
    pub backend: String,

    /// JSON file of engine settings. Relative paths resolve against the
    /// directory of the running executable.
    #[serde(default)]
    pub config_file: Option<String>,

    /// Model configuration path handed to the engine at init.
    #[serde(default = "default_model_path")]
    pub model_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: default_engine_backend(),
            config_file: None,
            model_path: default_model_path(),
        }
    }
}

fn default_engine_backend() -> String {
    "synthetic".to_string()
}

fn default_model_path() -> String {
    "./models_bit8/model_conf.json".to_string()
}

/// Local control channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Explicit endpoint (socket path or pipe name). When unset the endpoint
    /// is derived from the executable's install directory.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Seconds a client waits for the reply frame (0 = wait forever).
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            reply_timeout_secs: default_reply_timeout_secs(),
        }
    }
}

impl ControlConfig {
    /// Client read deadline, if any.
    pub fn reply_timeout(&self) -> Option<Duration> {
        (self.reply_timeout_secs > 0).then(|| Duration::from_secs(self.reply_timeout_secs))
    }
}

fn default_reply_timeout_secs() -> u64 {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "server.listen_addr must not be empty".to_string(),
            ));
        }
        if !server.path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "server.path must start with '/', got {:?}",
                server.path
            )));
        }
        if server.path == "/health" {
            return Err(ConfigError::Validation(
                "server.path must not shadow the /health route".to_string(),
            ));
        }
        if server.pong_wait_secs == 0 {
            return Err(ConfigError::Validation(
                "server.pong_wait_secs must be non-zero".to_string(),
            ));
        }
        if server.outbound_queue == 0 {
            return Err(ConfigError::Validation(
                "server.outbound_queue must be at least 1".to_string(),
            ));
        }
        if server.max_message_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.max_message_bytes must be non-zero".to_string(),
            ));
        }
        if server.stats_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "server.stats_interval_secs must be non-zero".to_string(),
            ));
        }

        if !ENGINE_BACKENDS.contains(&self.engine.backend.as_str()) {
            return Err(ConfigError::Validation(format!(
                "engine.backend must be one of {:?}, got {:?}",
                ENGINE_BACKENDS, self.engine.backend
            )));
        }
        if self.engine.config_file.as_deref() == Some("") {
            return Err(ConfigError::Validation(
                "engine.config_file must not be empty when set".to_string(),
            ));
        }

        if self.control.endpoint.as_deref() == Some("") {
            return Err(ConfigError::Validation(
                "control.endpoint must not be empty when set".to_string(),
            ));
        }

        Ok(())
    }
}
