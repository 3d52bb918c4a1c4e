use std::io;
use std::sync::Arc;

use thiserror::Error;

/// The engine was unable to produce any value for a computation.
///
/// Unlike an exception this is not a result of the computation itself, so it is never
/// retained in the finished table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine failure: {message}")]
pub struct EngineFailure {
    message: Arc<str>,
}

impl EngineFailure {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An error returned to a caller of the [`ComputationCache`](crate::ComputationCache).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// One of the requested computations ended in a [`Failure`](crate::ComputationResult::Failure).
    #[error(transparent)]
    EngineFailure(#[from] EngineFailure),
    /// The cache was torn down before or while the call was waiting.
    #[error("computation cache has been torn down")]
    ShutDown,
    /// An unexpected error in the cache itself, such as failing to spawn a thread.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<rayon::ThreadPoolBuildError> for CacheError {
    #[track_caller]
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Internal(e.to_string())
    }
}

/// An error raised by an [`ExternalLoader`](crate::data::ExternalLoader).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The bucket or key does not exist.
    #[error("not found")]
    NotFound,
    /// Reading from the source failed.
    ///
    /// The attached string contains the underlying error.
    #[error("io error: {0}")]
    Io(String),
    /// The source answered, but with data that does not fit the request, for example a
    /// short read.
    #[error("malformed: {0}")]
    Malformed(String),
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::Io(err.to_string()),
        }
    }
}
