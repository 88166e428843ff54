#![deny(unsafe_code)]

//! facegate core runtime.
//!
//! Bridges streaming WebSocket clients to an asynchronous, callback-driven
//! feature engine, and exposes a local control channel for administration.
//!
//! ```text
//!  client ─ws─▶ SessionManager ─Submitter─▶ EngineGateway ──▶ engine
//!     ▲              ▲                           │               │
//!     └── outbound ──┴──── deliver ◀── completion router ◀───────┘
//! ```

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Local control channel (framed request/reply over a socket or pipe).
pub mod control;
/// Service startup, main loop, and control commands.
pub mod daemon;
/// Feature engine contract and the synthetic back end.
pub mod engine;
/// Serialized engine dispatch and completion routing.
pub mod gateway;
/// Correlation and connection identifiers.
pub mod id;
/// In-memory capture of recent log lines.
pub mod logging;
/// Streaming wire types.
pub mod protocol;
/// WebSocket sessions and the connection registry.
pub mod session;
/// Ordered service teardown.
pub mod shutdown;

pub use control::{ControlClient, ControlEndpoint, ControlError, send_command};
pub use daemon::{Daemon, DaemonError, QUIT_REPLY, RunningDaemon};
pub use engine::{FeatureEngine, SyntheticEngine};
pub use logging::{LogReader, RecentLogs};
pub use protocol::{FaceRequest, FaceResponse};
