//! One-shot latches that callers and suspended computations wait on.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::CacheError;
use crate::types::ComputationResult;

#[derive(Debug, Default)]
enum WatchState {
    #[default]
    Pending,
    Done(ComputationResult),
    Cancelled,
}

/// Released once with the outcome of one computation.
///
/// Any number of threads may wait. The first call to [`set`](Self::set) or
/// [`cancel`](Self::cancel) wins and later calls are ignored.
#[derive(Debug, Default)]
pub struct Watcher {
    state: Mutex<WatchState>,
    signal: Condvar,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes the outcome. Returns `false` if the watcher was already released.
    pub fn set(&self, result: ComputationResult) -> bool {
        self.release(WatchState::Done(result))
    }

    /// Wakes all waiters with [`CacheError::ShutDown`].
    pub fn cancel(&self) -> bool {
        self.release(WatchState::Cancelled)
    }

    fn release(&self, outcome: WatchState) -> bool {
        let mut state = self.lock();
        if !matches!(*state, WatchState::Pending) {
            return false;
        }
        *state = outcome;
        drop(state);
        self.signal.notify_all();
        true
    }

    fn outcome(state: &WatchState) -> Option<Result<ComputationResult, CacheError>> {
        match state {
            WatchState::Pending => None,
            WatchState::Done(result) => Some(Ok(result.clone())),
            WatchState::Cancelled => Some(Err(CacheError::ShutDown)),
        }
    }

    /// Blocks until the watcher is released.
    pub fn wait(&self) -> Result<ComputationResult, CacheError> {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = Self::outcome(&state) {
                return outcome;
            }
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait), giving up with `None` after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<ComputationResult, CacheError>> {
        let state = self.lock();
        let (state, _) = self
            .signal
            .wait_timeout_while(state, timeout, |state| matches!(state, WatchState::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        Self::outcome(&state)
    }

    /// The published result, if there is one.
    pub fn result(&self) -> Option<ComputationResult> {
        match &*self.lock() {
            WatchState::Done(result) => Some(result.clone()),
            _ => None,
        }
    }

    pub fn is_released(&self) -> bool {
        !matches!(*self.lock(), WatchState::Pending)
    }
}
