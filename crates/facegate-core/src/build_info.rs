//! Build metadata embedded by `build.rs`, reported by `version` and `/health`.

pub const GIT_HASH: &str = env!("FACEGATE_GIT_HASH");

/// Unix epoch seconds at build time.
pub const BUILD_TIMESTAMP: &str = env!("FACEGATE_BUILD_TIMESTAMP");

pub const BUILD_PROFILE: &str = env!("FACEGATE_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `"facegate 0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("facegate {VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

/// Multi-line build report for `facegate version`.
pub fn build_report() -> String {
    format!(
        "facegate {VERSION}\n  commit:  {GIT_HASH}\n  profile: {BUILD_PROFILE}\n  built:   {BUILD_TIMESTAMP}\n  target:  {}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}
