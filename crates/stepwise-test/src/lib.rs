//! Helpers for testing the computation cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - The [`ToyEngine`] is cheap to clone and all clones share their counters. Keep a clone
//!    around before moving one into a cache to inspect how often each agent ran.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let _dir = test::tempdir()`.

use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use stepwise_cache::requests::CacheCall;
use stepwise_cache::{ComputationKey, Config, Value};

mod digest;
mod engine;
mod loader;

pub use digest::{Digest, sum_digest};
pub use engine::{ToyContext, ToyEngine};
pub use loader::MemoryLoader;
pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: The logger only captures logs from the `stepwise_cache` crate and
/// mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("stepwise_cache=debug"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A configuration with short intervals, so tests do not wait on timers.
pub fn fast_config() -> Config {
    Config {
        workers: 4,
        worker_wakeup_interval: Duration::from_millis(1),
        min_split_interval: Duration::from_millis(5),
        io_threads: 2,
        ..Config::default()
    }
}

/// The key applying `agent` to `args`.
pub fn key(agent: &str, args: impl IntoIterator<Item = Value>) -> ComputationKey {
    ComputationKey::apply(std::iter::once(Value::symbol(agent)).chain(args))
}

pub fn call(agent: &str, args: impl IntoIterator<Item = Value>) -> CacheCall {
    CacheCall::new(Value::symbol(agent), args)
}

/// A call in the encoded form expected inside a cache request, e.g. as argument to the
/// `bundle` agent of the [`ToyEngine`].
pub fn encoded_call(agent: &str, args: impl IntoIterator<Item = Value>) -> Value {
    Value::tuple([Value::symbol(agent), Value::tuple(args)])
}
