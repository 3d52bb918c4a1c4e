//! A memoizing scheduler for long-running, interruptible computations.
//!
//! The [`ComputationCache`] drives computations of an [`Engine`] on a fixed pool of
//! worker threads. Each distinct [`ComputationKey`] is computed at most once while its
//! result is cached. Computations may request sub-computations, external data, or split
//! themselves into independent pieces, and dependency cycles between them are detected and
//! broken.

pub mod metrics;

mod cache;
pub mod config;
pub mod data;
mod engine;
mod error;
pub mod graph;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod requests;
mod types;
pub mod watcher;

pub use cache::{CacheStats, ComputationCache};
pub use config::Config;
pub use engine::{Engine, ExecutionContext, InterruptFlag, StepStatus};
pub use error::{CacheError, EngineFailure, LoadError};
pub use types::{
    ComputationKey, ComputationResult, DatasetLocator, ExternalSlice, PageId, Snapshot, Value,
    VectorRef,
};
