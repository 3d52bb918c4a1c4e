//! A free-list of reusable execution contexts.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::{Engine, ExecutionContext, InterruptFlag, panic_message};

/// An execution context together with the flag used to interrupt it.
///
/// Whoever holds the slot has exclusive use of the context.
#[derive(Debug)]
pub struct Slot<C> {
    pub context: C,
    pub interrupt: InterruptFlag,
}

/// Hands out contexts created by the engine and takes them back once a computation is done.
pub struct ContextPool<E: Engine> {
    engine: Arc<E>,
    free: Mutex<Vec<Slot<E::Context>>>,
    closed: AtomicBool,
    created: AtomicUsize,
}

impl<E: Engine> ContextPool<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            free: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot<E::Context>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a free context, if there is one. Never calls into the engine.
    pub fn take_free(&self) -> Option<Slot<E::Context>> {
        self.lock().pop()
    }

    /// Asks the engine for a new context.
    ///
    /// A panic inside the engine is caught and returned as its message.
    pub fn create(&self) -> Result<Slot<E::Context>, String> {
        let context = panic::catch_unwind(AssertUnwindSafe(|| self.engine.create_context()))
            .map_err(|payload| panic_message(&*payload))?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Slot {
            context,
            interrupt: InterruptFlag::new(),
        })
    }

    /// Resets a context and returns it to the free list.
    ///
    /// After [`close`](Self::close), or when the engine panics while resetting it, the
    /// slot is dropped instead.
    pub fn checkin(&self, mut slot: Slot<E::Context>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| slot.context.reset())) {
            let message = panic_message(&*payload);
            tracing::error!(%message, "engine panicked while resetting a context");
            return;
        }
        slot.interrupt.reset();
        self.lock().push(slot);
    }

    /// Drops every free context and refuses further check-ins. Returns the number of
    /// contexts released.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let released = std::mem::take(&mut *self.lock());
        released.len()
    }

    pub fn free_count(&self) -> usize {
        self.lock().len()
    }

    /// How many contexts the engine was asked to create over the lifetime of the pool.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}
