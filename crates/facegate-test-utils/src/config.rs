//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. The builder starts from an
//! ephemeral listen port so tests never collide.

use facegate_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .path("/face")
///     .outbound_queue(2)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.server.listen_port = 0;
        Self { config }
    }

    pub fn path(mut self, path: &str) -> Self {
        self.config.server.path = path.to_string();
        self
    }

    pub fn pong_wait_secs(mut self, secs: u64) -> Self {
        self.config.server.pong_wait_secs = secs;
        self
    }

    pub fn outbound_queue(mut self, capacity: usize) -> Self {
        self.config.server.outbound_queue = capacity;
        self
    }

    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.config.server.max_message_bytes = bytes;
        self
    }

    pub fn control_endpoint(mut self, endpoint: &str) -> Self {
        self.config.control.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
