//! Local control channel.
//!
//! A one-shot request/reply protocol over a local socket (named pipe on
//! Windows) used by the `facegate` CLI to talk to a running service.
//!
//! ```text
//! ┌──────────┐   u16 BE length + UTF-8    ┌────────────────┐
//! │   CLI    │───────────────────────────▶│ ControlServer  │──▶ CommandHandler
//! │          │◀───────────────────────────│ (per-conn r/w) │
//! └──────────┘        one reply           └────────────────┘
//! ```

mod client;
mod codec;
mod endpoint;
mod server;
mod transport;

use std::time::Duration;

pub use client::{ControlClient, send_command};
pub use codec::{ControlCodec, FrameError, MAX_FRAME_LEN};
pub use endpoint::ControlEndpoint;
pub use server::{ControlServer, serve_connection};

/// Turns one command into one reply.
pub trait CommandHandler: Send + Sync {
    /// `connection` identifies the control connection the command arrived on.
    fn handle(&self, connection: u64, command: &str) -> String;
}

/// Errors from the control channel.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("another instance is already listening on {0}")]
    AlreadyRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before a reply arrived")]
    NoReply,
}
