//! The boundary between the scheduler and the interpreter that actually runs computations.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::types::{ComputationKey, ComputationResult, Snapshot, Value, VectorRef};

/// A factory for execution contexts.
pub trait Engine: Send + Sync + 'static {
    type Context: ExecutionContext;

    fn create_context(&self) -> Self::Context;
}

/// A stateful handle able to advance one computation at a time.
///
/// A context is used by exactly one thread at a time. It keeps its state between steps,
/// including while its computation is suspended waiting for data or sub-computations.
pub trait ExecutionContext: Send + 'static {
    /// Loads the computation named by `key`.
    fn place(&mut self, key: &ComputationKey);

    /// Advances the placed computation until it finishes, needs something, or notices
    /// that `interrupt` was raised.
    fn step(&mut self, interrupt: &InterruptFlag) -> StepStatus;

    /// Hands over the bytes of a vector requested via [`StepStatus::VectorLoad`].
    fn supply_external_data(&mut self, vector: &VectorRef, bytes: Bytes);

    /// Hands over the answer to a [`StepStatus::CacheRequest`], or one child result after
    /// a successful split.
    fn supply_cache_result(&mut self, result: ComputationResult);

    /// Tries to carve the remaining work of an interrupted computation into independent
    /// pieces.
    ///
    /// On success the context keeps whatever it needs to combine the pieces, and receives
    /// one [`supply_cache_result`](Self::supply_cache_result) per piece, in order, before
    /// its next step.
    fn attempt_split(&mut self) -> Option<Vec<Snapshot>> {
        None
    }

    /// Drops all computation state before the context goes back to the pool.
    fn reset(&mut self);
}

/// What a context reports after a [`step`](ExecutionContext::step).
#[derive(Debug)]
pub enum StepStatus {
    Finished(ComputationResult),
    /// The step yielded without finishing. The computation can be continued as-is.
    Interrupted,
    /// The computation needs the contents of these vectors.
    VectorLoad(Vec<VectorRef>),
    /// The computation needs the answer to this cache request.
    CacheRequest(Value),
}

#[derive(Debug, Default)]
struct InterruptState {
    raised: AtomicBool,
    split_requested: AtomicBool,
}

/// A flag the scheduler raises to ask a running step to yield.
///
/// Engines poll [`is_raised`](Self::is_raised) at convenient points, and return
/// [`StepStatus::Interrupted`] when it is set.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<InterruptState>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Asks the step to yield without requesting a split.
    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::Release);
    }

    /// Asks the step to yield so the scheduler can try splitting it.
    pub(crate) fn request_split(&self) {
        self.0.split_requested.store(true, Ordering::Release);
        self.0.raised.store(true, Ordering::Release);
    }

    pub(crate) fn take_split_request(&self) -> bool {
        self.0.split_requested.swap(false, Ordering::AcqRel)
    }

    /// Drops a pending interrupt and split request. Called whenever a step is about to start.
    pub(crate) fn reset(&self) {
        self.0.raised.store(false, Ordering::Release);
        self.0.split_requested.store(false, Ordering::Release);
    }
}

/// The message of a caught engine panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".into()
    }
}
