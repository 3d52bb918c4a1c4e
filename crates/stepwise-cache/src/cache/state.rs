//! Everything guarded by the global lock, and the transitions between node states.
//!
//! Every method here runs with the lock held and must not call into the engine.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::engine::{Engine, InterruptFlag};
use crate::graph::{DependencyGraph, NodeId};
use crate::pool::{ContextPool, Slot};
use crate::queue::CompletableQueue;
use crate::requests::{CacheCall, combine_call_results};
use crate::types::{ComputationKey, ComputationResult, Snapshot, VectorRef};
use crate::watcher::Watcher;

/// Input handed to a context before its next step.
#[derive(Debug)]
pub(super) enum Supply {
    Data(VectorRef, Bytes),
    Result(ComputationResult),
}

/// Where a suspended node will read the outcome of one sub-computation from.
#[derive(Debug)]
pub(super) enum Dependency {
    /// The result was already in the finished table when it was requested.
    Known(ComputationResult),
    Pending(Arc<Watcher>),
}

impl Dependency {
    fn outcome(&self) -> Option<ComputationResult> {
        match self {
            Self::Known(result) => Some(result.clone()),
            Self::Pending(watcher) => watcher.result(),
        }
    }
}

pub(super) enum NodeState<C> {
    Queued,
    Ready {
        slot: Slot<C>,
        supplies: Vec<Supply>,
    },
    Running,
    AwaitingDependencies {
        slot: Slot<C>,
        calls: Vec<Dependency>,
    },
    AwaitingSplit {
        slot: Slot<C>,
        children: Vec<Dependency>,
    },
    AwaitingData {
        slot: Slot<C>,
        supplies: Vec<Supply>,
        outstanding: usize,
    },
}

impl<C> NodeState<C> {
    fn into_slot(self) -> Option<Slot<C>> {
        match self {
            Self::Queued | Self::Running => None,
            Self::Ready { slot, .. }
            | Self::AwaitingDependencies { slot, .. }
            | Self::AwaitingSplit { slot, .. }
            | Self::AwaitingData { slot, .. } => Some(slot),
        }
    }
}

pub(super) struct Node<C> {
    pub key: ComputationKey,
    pub watcher: Arc<Watcher>,
    pub state: NodeState<C>,
    /// Summed duration of all steps taken so far.
    pub elapsed: Duration,
    /// The flush epoch the node was registered in.
    epoch: u64,
}

#[derive(Debug, Clone)]
pub(super) struct FinishedEntry {
    pub result: ComputationResult,
    pub elapsed: Duration,
}

pub(super) struct RunningEntry {
    /// When the node entered `Running`, or when it was last asked to split.
    pub since: Instant,
    pub interrupt: InterruptFlag,
}

/// A node checked out for one step.
pub(super) struct Job<C> {
    pub slot: Slot<C>,
    /// Set when the computation still has to be placed into the context.
    pub place: Option<ComputationKey>,
    pub supplies: Vec<Supply>,
    /// Step time accumulated before this step.
    pub elapsed: Duration,
}

pub(super) enum Begin<C> {
    /// The node is gone or not in a steppable state.
    Stale,
    /// The node is about to start and there is no free context. One has to be created
    /// outside the lock and passed to the next `begin`.
    NeedsContext,
    /// The node finished without stepping. The slots go back to the pool.
    Finished(Vec<Slot<C>>),
    Step(Job<C>),
}

pub(super) struct State<C> {
    /// Key lookup for every in-flight node.
    pub keys: FxHashMap<ComputationKey, NodeId>,
    pub nodes: FxHashMap<NodeId, Node<C>>,
    pub graph: DependencyGraph,
    pub finished: FxHashMap<ComputationKey, FinishedEntry>,
    pub running: FxHashMap<NodeId, RunningEntry>,
    /// External fetches dispatched and not yet completed.
    pub pending_loads: usize,
    /// Bumped by every flush. Nodes from older epochs do not enter the finished table.
    pub epoch: u64,
    pub accepting: bool,
    next_id: u64,
}

impl<C> State<C> {
    pub fn new() -> Self {
        Self {
            keys: FxHashMap::default(),
            nodes: FxHashMap::default(),
            graph: DependencyGraph::new(),
            finished: FxHashMap::default(),
            running: FxHashMap::default(),
            pending_loads: 0,
            epoch: 0,
            accepting: true,
            next_id: 1,
        }
    }

    /// Returns the node computing `key`, creating and enqueueing it if there is none.
    pub fn register(&mut self, key: &ComputationKey, queue: &CompletableQueue) -> (NodeId, Arc<Watcher>) {
        if let Some(&id) = self.keys.get(key) {
            if let Some(node) = self.nodes.get(&id) {
                return (id, Arc::clone(&node.watcher));
            }
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;

        let watcher = Arc::new(Watcher::new());
        self.keys.insert(key.clone(), id);
        self.nodes.insert(
            id,
            Node {
                key: key.clone(),
                watcher: Arc::clone(&watcher),
                state: NodeState::Queued,
                elapsed: Duration::ZERO,
                epoch: self.epoch,
            },
        );
        queue.push(id);

        tracing::debug!(%id, ?key, "registered computation");
        (id, watcher)
    }

    /// How a suspended node will learn the outcome of `key`, and the node to block on if
    /// it is not finished yet.
    fn dependency_on(
        &mut self,
        key: &ComputationKey,
        queue: &CompletableQueue,
    ) -> (Option<NodeId>, Dependency) {
        if let Some(entry) = self.finished.get(key) {
            return (None, Dependency::Known(entry.result.clone()));
        }
        let (id, watcher) = self.register(key, queue);
        (Some(id), Dependency::Pending(watcher))
    }

    /// Moves a node into its terminal state and wakes everyone waiting for it.
    ///
    /// Returns the context the node was holding, if any.
    pub fn finish(
        &mut self,
        id: NodeId,
        result: ComputationResult,
        queue: &CompletableQueue,
    ) -> Option<Slot<C>> {
        let node = self.nodes.remove(&id)?;
        if self.keys.get(&node.key) == Some(&id) {
            self.keys.remove(&node.key);
        }
        self.running.remove(&id);
        let unblocked = self.graph.remove_node(id);

        tracing::debug!(%id, key = ?node.key, ?result, "finished computation");

        // split pieces are only ever read by their parent, through the watcher
        let resumed = matches!(node.key, ComputationKey::Resumed(_));
        if !result.is_failure() && !resumed && node.epoch == self.epoch {
            self.finished.insert(
                node.key,
                FinishedEntry {
                    result: result.clone(),
                    elapsed: node.elapsed,
                },
            );
        }
        node.watcher.set(result);

        for dependent in unblocked {
            queue.push(dependent);
        }
        node.state.into_slot()
    }

    /// Checks out the node `id` for a step.
    ///
    /// A node that has not started yet takes `fresh` if given, or a free context from the
    /// pool. `fresh` is left untouched when it is not needed.
    pub fn begin<E>(
        &mut self,
        id: NodeId,
        fresh: &mut Option<Slot<C>>,
        pool: &ContextPool<E>,
        queue: &CompletableQueue,
    ) -> Begin<C>
    where
        E: Engine<Context = C>,
    {
        if self.graph.is_blocked(id) {
            tracing::error!(%id, "dequeued a node that is still blocked");
            return Begin::Stale;
        }
        let Some(node) = self.nodes.get_mut(&id) else {
            tracing::trace!(%id, "skipping finished node");
            return Begin::Stale;
        };

        let (slot, place, supplies) = match mem::replace(&mut node.state, NodeState::Running) {
            NodeState::Queued => match fresh.take().or_else(|| pool.take_free()) {
                Some(slot) => (slot, Some(node.key.clone()), Vec::new()),
                None => {
                    node.state = NodeState::Queued;
                    return Begin::NeedsContext;
                }
            },
            NodeState::Ready { slot, supplies } => (slot, None, supplies),
            NodeState::AwaitingDependencies { slot, calls } => match outcomes(id, &calls) {
                Ok(results) => match combine_call_results(results) {
                    result @ ComputationResult::Failure(_) => {
                        return self.finish_early(id, slot, result, queue);
                    }
                    result => (slot, None, vec![Supply::Result(result)]),
                },
                Err(failure) => return self.finish_early(id, slot, failure, queue),
            },
            NodeState::AwaitingSplit { slot, children } => match outcomes(id, &children) {
                Ok(results) => {
                    if let Some(failed) = results.iter().find(|result| !result.is_result()) {
                        let failed = failed.clone();
                        return self.finish_early(id, slot, failed, queue);
                    }
                    let supplies = results.into_iter().map(Supply::Result).collect();
                    (slot, None, supplies)
                }
                Err(failure) => return self.finish_early(id, slot, failure, queue),
            },
            other @ (NodeState::Running | NodeState::AwaitingData { .. }) => {
                node.state = other;
                tracing::trace!(%id, "skipping node that is not ready");
                return Begin::Stale;
            }
        };

        // a split requested during an earlier step is stale now
        slot.interrupt.reset();
        let elapsed = node.elapsed;
        self.running.insert(
            id,
            RunningEntry {
                since: Instant::now(),
                interrupt: slot.interrupt.clone(),
            },
        );

        Begin::Step(Job {
            slot,
            place,
            supplies,
            elapsed,
        })
    }

    fn finish_early(
        &mut self,
        id: NodeId,
        slot: Slot<C>,
        result: ComputationResult,
        queue: &CompletableQueue,
    ) -> Begin<C> {
        let mut released = vec![slot];
        released.extend(self.finish(id, result, queue));
        Begin::Finished(released)
    }

    pub fn requeue(&mut self, id: NodeId, slot: Slot<C>, supplies: Vec<Supply>, queue: &CompletableQueue) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = NodeState::Ready { slot, supplies };
            queue.push(id);
        }
    }

    /// Suspends a node on the sub-computations of a cache request.
    pub fn await_calls(&mut self, id: NodeId, slot: Slot<C>, calls: Vec<CacheCall>, queue: &CompletableQueue) {
        let mut dependencies = Vec::with_capacity(calls.len());
        let mut blocking = Vec::new();
        for call in &calls {
            let (blocker, dependency) = self.dependency_on(&call.key(), queue);
            blocking.extend(blocker);
            dependencies.push(dependency);
        }

        if blocking.is_empty() {
            // everything was cached already, answer right away
            let supply = match outcomes(id, &dependencies) {
                Ok(results) => Supply::Result(combine_call_results(results)),
                Err(failure) => Supply::Result(failure),
            };
            self.requeue(id, slot, vec![supply], queue);
            return;
        }

        tracing::debug!(%id, calls = calls.len(), blocking = blocking.len(), "awaiting cache calls");
        self.graph.set_dependencies(id, blocking);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = NodeState::AwaitingDependencies {
                slot,
                calls: dependencies,
            };
        }
    }

    /// Suspends a node until all pieces it was split into are finished.
    pub fn await_split(&mut self, id: NodeId, slot: Slot<C>, pieces: Vec<Snapshot>, queue: &CompletableQueue) {
        let mut children = Vec::with_capacity(pieces.len());
        let mut blocking = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let (child, watcher) = self.register(&ComputationKey::Resumed(piece), queue);
            blocking.push(child);
            children.push(Dependency::Pending(watcher));
        }

        tracing::debug!(%id, children = ?blocking, "split computation");
        self.graph.set_dependencies(id, blocking);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = NodeState::AwaitingSplit { slot, children };
        }
    }

    /// Suspends a node on `outstanding` external fetches.
    pub fn await_data(&mut self, id: NodeId, slot: Slot<C>, supplies: Vec<Supply>, outstanding: usize) {
        self.pending_loads += outstanding;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = NodeState::AwaitingData {
                slot,
                supplies,
                outstanding,
            };
        }
    }

    /// Hands the bytes of one completed fetch to a node, enqueueing it once nothing is
    /// outstanding anymore.
    pub fn data_arrived(&mut self, id: NodeId, supply: Supply, queue: &CompletableQueue) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let NodeState::AwaitingData {
            supplies,
            outstanding,
            ..
        } = &mut node.state
        else {
            return;
        };

        supplies.push(supply);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding > 0 {
            return;
        }

        if let NodeState::AwaitingData { slot, supplies, .. } =
            mem::replace(&mut node.state, NodeState::Running)
        {
            node.state = NodeState::Ready { slot, supplies };
            queue.push(id);
        }
    }

    pub fn is_awaiting_data(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(&id).map(|node| &node.state),
            Some(NodeState::AwaitingData { .. })
        )
    }

    /// Removes every in-flight node, returning their watchers and held contexts.
    pub fn shutdown(&mut self) -> (Vec<Arc<Watcher>>, Vec<Slot<C>>) {
        self.keys.clear();
        self.running.clear();
        self.graph = DependencyGraph::new();

        let mut watchers = Vec::with_capacity(self.nodes.len());
        let mut slots = Vec::new();
        for (_, node) in self.nodes.drain() {
            watchers.push(node.watcher);
            slots.extend(node.state.into_slot());
        }
        (watchers, slots)
    }

    /// Counts of in-flight nodes: `(queued, awaiting)`.
    pub fn census(&self) -> (usize, usize) {
        let mut queued = 0;
        let mut awaiting = 0;
        for node in self.nodes.values() {
            match node.state {
                NodeState::Queued | NodeState::Ready { .. } => queued += 1,
                NodeState::Running => {}
                _ => awaiting += 1,
            }
        }
        (queued, awaiting)
    }
}

/// Reads the outcomes of all dependencies of a node that was just unblocked.
///
/// A missing outcome means the node was woken too early. That is reported as a failure
/// instead of hanging the computation.
fn outcomes(id: NodeId, dependencies: &[Dependency]) -> Result<Vec<ComputationResult>, ComputationResult> {
    dependencies
        .iter()
        .map(|dependency| {
            dependency.outcome().ok_or_else(|| {
                tracing::error!(%id, "dependency outcome missing after wakeup");
                ComputationResult::failure("dependency outcome missing after wakeup")
            })
        })
        .collect()
}
