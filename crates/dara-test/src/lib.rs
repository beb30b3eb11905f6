//! Helpers for testing the cache store and the task pool.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Shared memory segments written into a dropped directory are
//!    lost, and workers reading them fail with a serialization error.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Routes trace output of the dara crates into the test writer.
///
/// Safe to call from every test, only the first call installs the subscriber.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("dara_service=trace,dara_worker=trace,dara=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a fresh directory for cache files or shared memory segments.
///
/// Removed together with its contents once the returned guard is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}
