#![deny(unsafe_code)]

//! Shared test utilities for the facegate workspace.
//!
//! Provides a scriptable engine double, config builders, a disposable
//! running daemon with WebSocket and control helpers, and tracing setup.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! facegate-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod engine;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use daemon::{TestDaemon, WsClient};
pub use engine::{Script, ScriptedEngine, Submission};
