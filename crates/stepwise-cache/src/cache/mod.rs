//! The computation cache: a memoizing scheduler driving engine computations on a fixed
//! pool of worker threads.
//!
//! Every computation is identified by its [`ComputationKey`]. The first lookup of a key
//! registers a node for it and enqueues it, all later lookups wait for the same node.
//! Workers advance nodes one engine step at a time. Between steps a node may be suspended
//! on sub-computations, on the pieces it was split into, or on external data, and is
//! enqueued again once whatever it waits for is available.
//!
//! All bookkeeping lives behind one lock, which is never held while the engine runs.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::data::{ExternalLoader, MemoryPageStore, NoLoader, PagedStore, fetch_chunked};
use crate::engine::Engine;
use crate::error::{CacheError, LoadError};
use crate::graph::NodeId;
use crate::metric;
use crate::pool::{ContextPool, Slot};
use crate::queue::CompletableQueue;
use crate::types::{ComputationKey, ComputationResult, VectorRef};
use crate::watcher::Watcher;

mod maintenance;
mod state;
mod worker;

use state::{State, Supply};

/// A point-in-time view of the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Keys in the finished table.
    pub finished: usize,
    /// Nodes not finished yet.
    pub intermediates: usize,
    /// Nodes whose context is currently inside an engine step.
    pub running: usize,
    /// Nodes waiting for a worker.
    pub queued: usize,
    /// Nodes suspended on dependencies, split pieces or data.
    pub awaiting: usize,
    pub lookups: u64,
    /// Computations placed into a context.
    pub computations: u64,
    pub steps: u64,
    pub splits: u64,
    pub cycles_broken: u64,
    pub data_loads: u64,
}

#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicU64,
    computations: AtomicU64,
    steps: AtomicU64,
    splits: AtomicU64,
    cycles_broken: AtomicU64,
    data_loads: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

struct Shared<E: Engine> {
    config: Config,
    state: Mutex<State<E::Context>>,
    queue: CompletableQueue,
    pool: ContextPool<E>,
    store: Arc<dyn PagedStore>,
    loader: Arc<dyn ExternalLoader>,
    io_pool: Mutex<Option<rayon::ThreadPool>>,
    stop: AtomicBool,
    counters: Counters,
}

/// What a worker does with a node after one step.
enum Transition {
    Finish(ComputationResult),
    /// Finish, and drop the context instead of pooling it.
    Abandon(ComputationResult),
    Requeue(Vec<Supply>),
    AwaitCalls(Vec<crate::requests::CacheCall>),
    Split(Vec<crate::types::Snapshot>),
    AwaitData {
        supplies: Vec<Supply>,
        fetches: Vec<VectorRef>,
    },
}

impl<E: Engine> Shared<E> {
    fn lock_state(&self) -> MutexGuard<'_, State<E::Context>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn release(&self, slots: impl IntoIterator<Item = Slot<E::Context>>) {
        for slot in slots {
            self.pool.checkin(slot);
        }
    }

    /// Applies the outcome of a step to the node `id`.
    fn complete(self: &Arc<Self>, id: NodeId, spent: Duration, slot: Slot<E::Context>, transition: Transition) {
        let mut released = Vec::new();
        let mut fetches = Vec::new();
        {
            let mut state = self.lock_state();
            state.running.remove(&id);

            let Some(node) = state.nodes.get_mut(&id) else {
                tracing::error!(%id, "node vanished while running");
                drop(state);
                self.pool.checkin(slot);
                return;
            };
            node.elapsed += spent;

            match transition {
                Transition::Finish(result) => {
                    released.push(slot);
                    released.extend(state.finish(id, result, &self.queue));
                }
                Transition::Abandon(result) => {
                    drop(slot);
                    released.extend(state.finish(id, result, &self.queue));
                }
                Transition::Requeue(supplies) => state.requeue(id, slot, supplies, &self.queue),
                Transition::AwaitCalls(calls) => state.await_calls(id, slot, calls, &self.queue),
                Transition::Split(pieces) => {
                    Counters::bump(&self.counters.splits, 1);
                    metric!(counter("cache.split") += 1);
                    state.await_split(id, slot, pieces, &self.queue);
                }
                Transition::AwaitData {
                    supplies,
                    fetches: pending,
                } => {
                    state.await_data(id, slot, supplies, pending.len());
                    fetches = pending;
                }
            }
        }

        self.release(released);
        for vector in fetches {
            self.dispatch_fetch(id, vector);
        }
    }

    fn dispatch_fetch(self: &Arc<Self>, id: NodeId, vector: VectorRef) {
        let io_pool = self.io_pool.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(io_pool) = io_pool.as_ref() else {
            self.fetch_done(id, vector, Err(LoadError::Io("I/O pool is shut down".into())));
            return;
        };

        let shared = Arc::clone(self);
        io_pool.spawn(move || {
            let result = match &vector.source {
                Some(slice) => {
                    let started = Instant::now();
                    let result = fetch_chunked(&*shared.loader, slice, shared.config.max_fetch_chunk_size);
                    metric!(timer("data.load") = started.elapsed());
                    result
                }
                None => Err(LoadError::NotFound),
            };
            if let Ok(bytes) = &result {
                metric!(histogram("data.load.bytes") = bytes.len() as u64);
                shared.store.store(vector.page, bytes.clone());
            }
            Counters::bump(&shared.counters.data_loads, 1);
            shared.fetch_done(id, vector, result);
        });
    }

    fn fetch_done(&self, id: NodeId, vector: VectorRef, result: Result<Bytes, LoadError>) {
        let mut released = None;
        {
            let mut state = self.lock_state();
            state.pending_loads = state.pending_loads.saturating_sub(1);
            match result {
                Ok(bytes) => state.data_arrived(id, Supply::Data(vector, bytes), &self.queue),
                Err(err) => {
                    let description = match &vector.source {
                        Some(slice) => slice.to_string(),
                        None => vector.page.to_string(),
                    };
                    tracing::warn!(%id, source = %description, error = %err, "external load failed");
                    if state.is_awaiting_data(id) {
                        let exception = ComputationResult::exception(format!(
                            "failed to load {description}: {err}"
                        ));
                        released = state.finish(id, exception, &self.queue);
                    }
                }
            }
        }
        self.release(released);
    }
}

/// A memoizing scheduler for engine computations.
///
/// Lookups of the same key are coalesced: every key is computed at most once while its
/// result stays in the finished table. Dropping the cache tears it down.
pub struct ComputationCache<E: Engine> {
    shared: Arc<Shared<E>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: Engine> std::fmt::Debug for ComputationCache<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<E: Engine> ComputationCache<E> {
    /// Creates a cache with an in-memory page store and no external loader.
    pub fn new(engine: E, config: &Config) -> Result<Self, CacheError> {
        let store = Arc::new(MemoryPageStore::new(config.page_store_capacity));
        Self::with_data(engine, config, store, Arc::new(NoLoader))
    }

    /// Creates a cache reading vector data through the given store and loader.
    pub fn with_data(
        engine: E,
        config: &Config,
        store: Arc<dyn PagedStore>,
        loader: Arc<dyn ExternalLoader>,
    ) -> Result<Self, CacheError> {
        let io_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.io_threads.max(1))
            .thread_name(|index| format!("stepwise-io-{index}"))
            .build()?;

        let shared = Arc::new(Shared {
            config: config.clone(),
            state: Mutex::new(State::new()),
            queue: CompletableQueue::new(),
            pool: ContextPool::new(Arc::new(engine)),
            store,
            loader,
            io_pool: Mutex::new(Some(io_pool)),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let workers = config.workers.max(1);
        let cache = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(workers)),
        };
        for index in 0..workers {
            let shared = Arc::clone(&cache.shared);
            // on error, dropping `cache` stops the workers spawned so far
            let handle = thread::Builder::new()
                .name(format!("stepwise-worker-{index}"))
                .spawn(move || worker::run(shared))?;
            cache.lock_workers().push(handle);
        }

        tracing::info!(workers, "computation cache started");
        Ok(cache)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a batch of keys, computing the ones that are not known yet.
    ///
    /// Without `block`, returns `Ok(None)` unless every key is already finished. With
    /// `leave_in_cache` set to `false`, keys that were not finished before this call are
    /// evicted from the finished table once their results are read.
    pub fn lookup_several(
        &self,
        keys: &[ComputationKey],
        block: bool,
        leave_in_cache: bool,
    ) -> Result<Option<Vec<ComputationResult>>, CacheError> {
        enum Lookup {
            Ready(ComputationResult),
            Waiting(Arc<Watcher>),
        }

        Counters::bump(&self.shared.counters.lookups, keys.len() as u64);
        metric!(counter("cache.lookup") += keys.len() as i64);

        let mut not_already_cached = Vec::new();
        let mut lookups = Vec::with_capacity(keys.len());
        {
            let mut state = self.shared.lock_state();
            if !state.accepting {
                return Err(CacheError::ShutDown);
            }
            for key in keys {
                if let Some(entry) = state.finished.get(key) {
                    lookups.push(Lookup::Ready(entry.result.clone()));
                } else {
                    let (_, watcher) = state.register(key, &self.shared.queue);
                    not_already_cached.push(key.clone());
                    lookups.push(Lookup::Waiting(watcher));
                }
            }
        }

        if !block && !not_already_cached.is_empty() {
            return Ok(None);
        }

        let results = lookups
            .into_iter()
            .map(|lookup| match lookup {
                Lookup::Ready(result) => Ok(result),
                Lookup::Waiting(watcher) => watcher.wait(),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if !leave_in_cache && !not_already_cached.is_empty() {
            let mut state = self.shared.lock_state();
            for key in &not_already_cached {
                state.finished.remove(key);
            }
        }

        if let Some(ComputationResult::Failure(failure)) = results.iter().find(|r| r.is_failure()) {
            return Err(CacheError::EngineFailure(failure.clone()));
        }
        Ok(Some(results))
    }

    /// Computes a single key, or returns its cached result.
    pub fn lookup(&self, key: &ComputationKey) -> Result<ComputationResult, CacheError> {
        let results = self.lookup_several(std::slice::from_ref(key), true, true)?;
        results
            .and_then(|results| results.into_iter().next())
            .ok_or_else(|| CacheError::Internal("blocking lookup returned no result".into()))
    }

    /// Forgets all finished results. Computations in flight keep running and their
    /// waiters are still served, but their results are not retained.
    pub fn flush(&self) {
        let mut state = self.shared.lock_state();
        let dropped = state.finished.len();
        state.finished.clear();
        state.epoch += 1;
        tracing::debug!(dropped, epoch = state.epoch, "flushed finished computations");
    }

    /// The accumulated step time of a finished key.
    pub fn finished_elapsed(&self, key: &ComputationKey) -> Option<Duration> {
        let state = self.shared.lock_state();
        state.finished.get(key).map(|entry| entry.elapsed)
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.shared.counters;
        let state = self.shared.lock_state();
        let (queued, awaiting) = state.census();
        CacheStats {
            finished: state.finished.len(),
            intermediates: state.nodes.len(),
            running: state.running.len(),
            queued,
            awaiting,
            lookups: counters.lookups.load(Ordering::Relaxed),
            computations: counters.computations.load(Ordering::Relaxed),
            steps: counters.steps.load(Ordering::Relaxed),
            splits: counters.splits.load(Ordering::Relaxed),
            cycles_broken: counters.cycles_broken.load(Ordering::Relaxed),
            data_loads: counters.data_loads.load(Ordering::Relaxed),
        }
    }

    /// Stops all workers and wakes every waiting caller with [`CacheError::ShutDown`].
    ///
    /// Workers finish the step they are in before exiting. Calling this more than once is
    /// harmless.
    pub fn teardown(&self) {
        {
            let mut state = self.shared.lock_state();
            if !mem::replace(&mut state.accepting, false) {
                return;
            }
        }
        self.shared.stop.store(true, Ordering::Release);

        let workers = mem::take(&mut *self.lock_workers());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }

        let (watchers, slots) = self.shared.lock_state().shutdown();
        let cancelled = watchers.iter().filter(|watcher| watcher.cancel()).count();
        let mut released = slots.len();
        drop(slots);

        self.shared.queue.drain();
        released += self.shared.pool.close();
        drop(
            self.shared
                .io_pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        tracing::info!(cancelled, released, "computation cache torn down");
    }
}

impl<E: Engine> Drop for ComputationCache<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}
