use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::state::{Begin, Job, Supply};
use super::{Counters, Shared, Transition, maintenance};
use crate::data::resolve_dataset;
use crate::engine::{Engine, ExecutionContext, StepStatus, panic_message};
use crate::graph::NodeId;
use crate::metric;
use crate::pool::Slot;
use crate::requests::CacheRequest;
use crate::types::{ComputationResult, Value, VectorRef};

/// The body of a worker thread.
pub(super) fn run<E: Engine>(shared: Arc<Shared<E>>) {
    tracing::debug!("worker started");
    let wakeup = shared.config.worker_wakeup_interval;

    while !shared.stopping() {
        match shared.queue.pop_timeout(wakeup) {
            Some(id) => step(&shared, id),
            None => maintenance::run(&shared),
        }
    }

    tracing::debug!("worker stopped");
}

/// Advances the node `id` by one engine step.
fn step<E: Engine>(shared: &Arc<Shared<E>>, id: NodeId) {
    let mut fresh = None;
    let job = loop {
        let begin = shared.lock_state().begin(id, &mut fresh, &shared.pool, &shared.queue);
        // a context created for a node that was finished in the meantime
        shared.release(fresh.take());

        match begin {
            Begin::Stale => return,
            Begin::Finished(released) => {
                shared.release(released);
                return;
            }
            Begin::NeedsContext => match shared.pool.create() {
                Ok(slot) => fresh = Some(slot),
                Err(message) => {
                    tracing::error!(%id, %message, "engine panicked while creating a context");
                    let failure = ComputationResult::failure(format!("engine panicked: {message}"));
                    let released = shared.lock_state().finish(id, failure, &shared.queue);
                    shared.release(released);
                    return;
                }
            },
            Begin::Step(job) => break job,
        }
    };
    let Job {
        mut slot,
        place,
        supplies,
        elapsed,
    } = job;

    if place.is_some() {
        Counters::bump(&shared.counters.computations, 1);
        metric!(counter("cache.computation") += 1);
    }
    Counters::bump(&shared.counters.steps, 1);
    metric!(counter("worker.step") += 1);

    let started = Instant::now();
    let status = panic::catch_unwind(AssertUnwindSafe(|| {
        let context = &mut slot.context;
        if let Some(key) = &place {
            context.place(key);
        }
        for supply in supplies {
            match supply {
                Supply::Data(vector, bytes) => context.supply_external_data(&vector, bytes),
                Supply::Result(result) => context.supply_cache_result(result),
            }
        }
        context.step(&slot.interrupt)
    }));
    let spent = started.elapsed();
    metric!(timer("worker.step.duration") = spent);

    let transition = match status {
        Ok(StepStatus::Finished(result)) => Transition::Finish(result),
        Ok(StepStatus::Interrupted) => interrupted(shared, &mut slot, elapsed + spent),
        Ok(StepStatus::VectorLoad(vectors)) => vector_load(shared, vectors),
        Ok(StepStatus::CacheRequest(request)) => cache_request(shared, &request),
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::error!(%id, %message, "engine panicked during step");
            Transition::Abandon(ComputationResult::failure(format!("engine panicked: {message}")))
        }
    };
    tracing::trace!(%id, ?spent, "stepped computation");

    shared.complete(id, spent, slot, transition);
}

/// Decides whether an interrupted computation is split or simply continued later.
fn interrupted<E: Engine>(shared: &Shared<E>, slot: &mut Slot<E::Context>, elapsed: Duration) -> Transition {
    let requested = slot.interrupt.take_split_request();
    if !requested || shared.config.disable_splitting || elapsed < shared.config.min_split_interval {
        return Transition::Requeue(Vec::new());
    }

    match panic::catch_unwind(AssertUnwindSafe(|| slot.context.attempt_split())) {
        Ok(Some(pieces)) if !pieces.is_empty() => Transition::Split(pieces),
        Ok(_) => Transition::Requeue(Vec::new()),
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::error!(%message, "engine panicked while splitting");
            Transition::Abandon(ComputationResult::failure(format!("engine panicked: {message}")))
        }
    }
}

/// Collects the requested vectors from the paged store, or schedules fetches for them.
fn vector_load<E: Engine>(shared: &Shared<E>, vectors: Vec<VectorRef>) -> Transition {
    let mut supplies = Vec::with_capacity(vectors.len());
    let mut fetches = Vec::new();

    for vector in vectors {
        if let Some(bytes) = shared.store.load_if_present(vector.page) {
            supplies.push(Supply::Data(vector, bytes));
        } else if vector.source.is_some() {
            fetches.push(vector);
        } else {
            return Transition::Finish(ComputationResult::exception(format!(
                "contents of {} are lost",
                vector.page
            )));
        }
    }

    if fetches.is_empty() {
        Transition::Requeue(supplies)
    } else {
        Transition::AwaitData { supplies, fetches }
    }
}

fn cache_request<E: Engine>(shared: &Shared<E>, request: &Value) -> Transition {
    match CacheRequest::decode(request) {
        Ok(CacheRequest::Dataset(locator)) => {
            let result = resolve_dataset(&*shared.loader, &locator, shared.config.dataset_chunk_size);
            Transition::Requeue(vec![Supply::Result(result)])
        }
        Ok(CacheRequest::Calls(calls)) => Transition::AwaitCalls(calls),
        Err(err) => {
            tracing::debug!(error = %err, "malformed cache request");
            Transition::Finish(ComputationResult::exception(err.to_string()))
        }
    }
}
