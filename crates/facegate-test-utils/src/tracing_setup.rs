//! Tracing initialisation helpers for tests.
//!
//! Call [`init_test_tracing`] at the top of any test that wants service
//! logs captured by the test harness. Initialisation happens at most once
//! per process, so every test may call it.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset: service crates at debug.
const DEFAULT_FILTER: &str = "warn,facegate_core=debug";

/// Install a test-writer subscriber honouring `RUST_LOG`.
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     facegate_test_utils::tracing_setup::init_test_tracing();
///     tracing::info!("visible with --nocapture");
/// }
/// ```
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_test_writer()
        .try_init();
}
