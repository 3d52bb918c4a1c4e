//! Work an idle worker does when the queue runs dry.

use std::time::Instant;

use super::state::State;
use super::{Counters, Shared};
use crate::engine::Engine;
use crate::metric;
use crate::pool::Slot;
use crate::queue::CompletableQueue;
use crate::types::ComputationResult;

pub(super) const CYCLE_MESSAGE: &str = "cyclic dependency detected";

pub(super) fn run<E: Engine>(shared: &Shared<E>) {
    let released = {
        let mut state = shared.lock_state();
        metric!(gauge("cache.intermediates") = state.nodes.len() as u64);
        metric!(gauge("cache.finished") = state.finished.len() as u64);

        if !shared.config.disable_splitting {
            request_splits(&mut state, shared);
        }
        break_cycle(&mut state, shared)
    };
    shared.release(released);
}

/// Asks every computation that has been running for too long to yield for a split.
fn request_splits<E: Engine>(state: &mut State<E::Context>, shared: &Shared<E>) {
    let now = Instant::now();
    let min_split_interval = shared.config.min_split_interval;

    for (id, entry) in state.running.iter_mut() {
        if now.duration_since(entry.since) >= min_split_interval {
            tracing::trace!(%id, "requesting split");
            entry.interrupt.request_split();
            entry.since = now;
        }
    }
}

/// Finishes the members of one dependency cycle with an exception, if the system is
/// stuck on one.
///
/// Only a system with no possible progress is inspected: nothing running, nothing queued,
/// no fetch in flight, and still work pending.
fn break_cycle<E: Engine>(state: &mut State<E::Context>, shared: &Shared<E>) -> Vec<Slot<E::Context>> {
    let stuck = !state.nodes.is_empty()
        && state.running.is_empty()
        && state.pending_loads == 0
        && shared.queue.is_empty();
    if !stuck {
        return Vec::new();
    }
    let Some(cycle) = state.graph.find_cycle() else {
        return Vec::new();
    };

    tracing::warn!(members = ?cycle, "breaking dependency cycle");
    Counters::bump(&shared.counters.cycles_broken, 1);
    metric!(counter("cache.cycle_broken") += 1);

    finish_cycle(state, &cycle, &shared.queue)
}

fn finish_cycle<C>(
    state: &mut State<C>,
    cycle: &[crate::graph::NodeId],
    queue: &CompletableQueue,
) -> Vec<Slot<C>> {
    // drop the edges first, so finishing one member does not wake another
    for &id in cycle {
        state.graph.clear_dependencies(id);
    }
    cycle
        .iter()
        .filter_map(|&id| state.finish(id, ComputationResult::exception(CYCLE_MESSAGE), queue))
        .collect()
}
