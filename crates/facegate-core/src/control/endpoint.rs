//! Control endpoint naming.
//!
//! Every install directory gets its own endpoint, so two copies of the
//! service installed side by side never collide, while the CLI finds the
//! service running from its own directory without configuration.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

use facegate_config::ControlConfig;

/// Address of a control channel: a socket path (Unix) or pipe name (Windows).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlEndpoint(String);

impl ControlEndpoint {
    /// Use `name` verbatim.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derive the endpoint for an install directory.
    pub fn for_directory(dir: &Path) -> Self {
        let digest = Sha256::digest(dir.as_os_str().as_encoded_bytes());
        let tag = hex::encode_upper(&digest[..16]);
        Self(platform_name(&tag))
    }

    /// Derive the endpoint from the running executable's directory.
    pub fn for_current_exe() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let exe = exe.canonicalize().unwrap_or(exe);
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::for_directory(dir))
    }

    /// The configured override, or the derived endpoint.
    pub fn from_config(config: &ControlConfig) -> std::io::Result<Self> {
        match config.endpoint.as_deref() {
            Some(name) => Ok(Self::new(name)),
            None => Self::for_current_exe(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(unix)]
fn platform_name(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("facegate-{tag}.sock"))
        .to_string_lossy()
        .into_owned()
}

#[cfg(windows)]
fn platform_name(tag: &str) -> String {
    format!(r"\\.\pipe\facegate-{tag}")
}
