//! A small interpreter with a fixed set of agents, for driving the cache in tests.
//!
//! | agent | arguments | behavior |
//! |---|---|---|
//! | `square` | `n[, sleep_ms]` | `n * n`, optionally sleeping first |
//! | `sum` | `lo, hi` | [`Digest`] of `lo..hi`, in budgeted steps, splittable |
//! | `fib` | `n` | fibonacci via cache calls of `fib(n-1)` and `fib(n-2)` |
//! | `ping` / `pong` | `n` | calls the other one, forming a cycle |
//! | `selfish` | `n` | calls itself |
//! | `throw` | `message` | an exception |
//! | `fail` | `message` | an engine failure |
//! | `panic` | `message` | panics inside the step |
//! | `delayed` | `ms, value` | sleeps, then returns `value` |
//! | `delayed_throw` | `ms, message` | sleeps, then throws |
//! | `bundle` | encoded calls | issues all calls as one request, returns the combined answer |
//! | `raw` | `request` | issues `request` verbatim, returns the answer |
//! | `load` | `bucket, key` | resolves a dataset and returns its concatenated bytes |
//! | `page` | `id` | returns the bytes of a store-only page |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stepwise_cache::requests::{calls_request, dataset_request};
use stepwise_cache::{
    ComputationKey, ComputationResult, DatasetLocator, Engine, ExecutionContext, InterruptFlag,
    PageId, Snapshot, StepStatus, Value, VectorRef,
};

use crate::call;
use crate::digest::Digest;

/// Pieces smaller than this are not split any further.
const MIN_PIECE: i64 = 256;

/// How often a running `sum` looks at its interrupt flag.
const POLL_EVERY: i64 = 64;

#[derive(Debug)]
struct Options {
    sum_budget: i64,
    step_delay: Duration,
    seed: Option<u64>,
    /// The 0-based creation attempt that panics.
    panic_on_create: Option<u64>,
    panic_on_reset: bool,
}

#[derive(Debug, Default)]
struct Counters {
    calls: Mutex<HashMap<String, usize>>,
    steps: AtomicUsize,
    create_attempts: AtomicU64,
    contexts: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    options: Options,
    counters: Counters,
}

/// The toy [`Engine`]. Clones share their counters.
#[derive(Debug, Clone)]
pub struct ToyEngine {
    inner: Arc<Inner>,
}

impl Default for ToyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ToyEngine {
    pub fn new() -> Self {
        Self::build(Options {
            sum_budget: 1_000,
            step_delay: Duration::ZERO,
            seed: None,
            panic_on_create: None,
            panic_on_reset: false,
        })
    }

    fn build(options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                counters: Counters::default(),
            }),
        }
    }

    fn with_options(self, f: impl FnOnce(&mut Options)) -> Self {
        let mut options = Options {
            sum_budget: self.inner.options.sum_budget,
            step_delay: self.inner.options.step_delay,
            seed: self.inner.options.seed,
            panic_on_create: self.inner.options.panic_on_create,
            panic_on_reset: self.inner.options.panic_on_reset,
        };
        f(&mut options);
        Self::build(options)
    }

    /// Randomizes step budgets and inserts short sleeps, seeded per context.
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_options(|o| o.seed = Some(seed))
    }

    /// Sleeps this long at the end of every `sum` step.
    pub fn with_step_delay(self, delay: Duration) -> Self {
        self.with_options(|o| o.step_delay = delay)
    }

    /// Number of integers a `sum` digests per step.
    pub fn with_sum_budget(self, budget: i64) -> Self {
        self.with_options(|o| o.sum_budget = budget.max(1))
    }

    /// Panics in the `attempt`-th call to `create_context`, counting from zero.
    pub fn with_panicking_create(self, attempt: u64) -> Self {
        self.with_options(|o| o.panic_on_create = Some(attempt))
    }

    /// Panics whenever a context is reset.
    pub fn with_panicking_reset(self) -> Self {
        self.with_options(|o| o.panic_on_reset = true)
    }

    /// How often computations of `agent` were placed. Split pieces count as `sum.piece`.
    pub fn calls(&self, agent: &str) -> usize {
        let calls = self.inner.counters.calls.lock().unwrap();
        calls.get(agent).copied().unwrap_or(0)
    }

    pub fn total_steps(&self) -> usize {
        self.inner.counters.steps.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> u64 {
        self.inner.counters.contexts.load(Ordering::SeqCst)
    }

    /// Contexts created and not dropped yet.
    pub fn live_contexts(&self) -> u64 {
        let counters = &self.inner.counters;
        let dropped = counters.dropped.load(Ordering::SeqCst);
        counters.contexts.load(Ordering::SeqCst).saturating_sub(dropped)
    }
}

impl Engine for ToyEngine {
    type Context = ToyContext;

    fn create_context(&self) -> ToyContext {
        let attempt = self.inner.counters.create_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.options.panic_on_create == Some(attempt) {
            panic!("create_context boom");
        }

        let ordinal = self.inner.counters.contexts.fetch_add(1, Ordering::SeqCst);
        let rng = self
            .inner
            .options
            .seed
            .map(|seed| StdRng::seed_from_u64(seed.wrapping_add(ordinal)));
        ToyContext {
            inner: Arc::clone(&self.inner),
            rng,
            task: Task::Idle,
            received: Vec::new(),
            data: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct SumPiece {
    lo: i64,
    hi: i64,
}

#[derive(Debug)]
enum LoadPhase {
    Resolve,
    AwaitVector,
    AwaitBytes(Vec<VectorRef>),
}

#[derive(Debug)]
enum Task {
    Idle,
    Immediate(ComputationResult),
    Sleep(Duration, ComputationResult),
    Panic(String),
    Sum {
        next: i64,
        hi: i64,
        digest: Digest,
    },
    /// Waiting for the digests of the split pieces, to be appended to `prefix`.
    Join {
        prefix: Digest,
        pieces: usize,
    },
    Request {
        request: Value,
        sent: bool,
        finish: fn(ComputationResult) -> ComputationResult,
    },
    Load {
        locator: DatasetLocator,
        phase: LoadPhase,
    },
    Page {
        page: PageId,
        requested: bool,
    },
}

/// An execution context of the [`ToyEngine`].
#[derive(Debug)]
pub struct ToyContext {
    inner: Arc<Inner>,
    rng: Option<StdRng>,
    task: Task,
    received: Vec<ComputationResult>,
    data: Vec<(VectorRef, Bytes)>,
}

fn unchanged(result: ComputationResult) -> ComputationResult {
    result
}

/// Unwraps the single value of a one-call request.
fn single(result: ComputationResult) -> ComputationResult {
    match &result {
        ComputationResult::Result(Value::Tuple(values)) if values.len() == 1 => {
            ComputationResult::Result(values[0].clone())
        }
        _ => result,
    }
}

fn add_pair(result: ComputationResult) -> ComputationResult {
    match &result {
        ComputationResult::Result(Value::Tuple(values)) => match &values[..] {
            [Value::Int(a), Value::Int(b)] => ComputationResult::Result(Value::Int(a + b)),
            _ => ComputationResult::failure("fib expects two integers"),
        },
        _ => result,
    }
}

fn request(calls: &[stepwise_cache::requests::CacheCall], finish: fn(ComputationResult) -> ComputationResult) -> Task {
    Task::Request {
        request: calls_request(calls),
        sent: false,
        finish,
    }
}

fn parse(agent: &str, args: &[Value]) -> Task {
    use ComputationResult::{Exception, Result};

    match (agent, args) {
        ("square", [Value::Int(n)]) => Task::Immediate(Result(Value::Int(n * n))),
        ("square", [Value::Int(n), Value::Int(ms)]) => {
            Task::Sleep(Duration::from_millis(*ms as u64), Result(Value::Int(n * n)))
        }
        ("sum", [Value::Int(lo), Value::Int(hi)]) => Task::Sum {
            next: *lo,
            hi: (*hi).max(*lo),
            digest: Digest::EMPTY,
        },
        ("fib", [Value::Int(n)]) if *n < 2 => Task::Immediate(Result(Value::Int(*n))),
        ("fib", [Value::Int(n)]) => request(
            &[
                call("fib", [Value::Int(n - 1)]),
                call("fib", [Value::Int(n - 2)]),
            ],
            add_pair,
        ),
        ("ping", [n]) => request(&[call("pong", [n.clone()])], single),
        ("pong", [n]) => request(&[call("ping", [n.clone()])], single),
        ("selfish", [n]) => request(&[call("selfish", [n.clone()])], single),
        ("throw", [message]) => Task::Immediate(Exception(message.clone())),
        ("fail", [Value::Str(message)]) => Task::Immediate(ComputationResult::failure(message)),
        ("panic", [Value::Str(message)]) => Task::Panic(message.to_string()),
        ("delayed", [Value::Int(ms), value]) => {
            Task::Sleep(Duration::from_millis(*ms as u64), Result(value.clone()))
        }
        ("delayed_throw", [Value::Int(ms), message]) => {
            Task::Sleep(Duration::from_millis(*ms as u64), Exception(message.clone()))
        }
        ("bundle", calls) => Task::Request {
            request: Value::tuple(calls.iter().cloned()),
            sent: false,
            finish: unchanged,
        },
        ("raw", [request]) => Task::Request {
            request: request.clone(),
            sent: false,
            finish: unchanged,
        },
        ("load", [Value::Str(bucket), Value::Str(key)]) => Task::Load {
            locator: DatasetLocator::new(bucket, key),
            phase: LoadPhase::Resolve,
        },
        ("page", [Value::Int(page)]) => Task::Page {
            page: PageId(*page as u64),
            requested: false,
        },
        _ => Task::Immediate(ComputationResult::failure(format!(
            "cannot apply {agent} to {args:?}"
        ))),
    }
}

impl ToyContext {
    fn count(&self, agent: &str) {
        let mut calls = self.inner.counters.calls.lock().unwrap();
        *calls.entry(agent.to_owned()).or_default() += 1;
    }

    /// The budget of the next `sum` step, sleeping a little at random when seeded.
    fn jitter(&mut self) -> i64 {
        let budget = self.inner.options.sum_budget;
        let Some(rng) = &mut self.rng else {
            return budget;
        };
        if rng.random_ratio(1, 4) {
            thread::sleep(Duration::from_micros(rng.random_range(0..200)));
        }
        rng.random_range((budget / 4).max(1)..=budget * 2)
    }

    fn step_sum(next: &mut i64, hi: i64, digest: &mut Digest, budget: i64, interrupt: &InterruptFlag) -> bool {
        let end = (*next + budget).min(hi);
        while *next < end {
            if (*next % POLL_EVERY) == 0 && interrupt.is_raised() {
                return false;
            }
            digest.push(*next);
            *next += 1;
        }
        *next == hi
    }

    fn join(&mut self, prefix: Digest, pieces: usize) -> ComputationResult {
        if self.received.len() != pieces {
            return ComputationResult::failure(format!(
                "expected {pieces} split results, got {}",
                self.received.len()
            ));
        }
        let mut digest = prefix;
        for piece in self.received.drain(..) {
            match piece.value().and_then(Digest::from_value) {
                Some(part) => digest = digest.combine(part),
                None => return ComputationResult::failure("malformed split result"),
            }
        }
        ComputationResult::Result(digest.to_value())
    }

    fn concat(&self, refs: &[VectorRef]) -> ComputationResult {
        let mut buf = BytesMut::new();
        for vector in refs {
            match self.data.iter().find(|(supplied, _)| supplied == vector) {
                Some((_, bytes)) => buf.extend_from_slice(bytes),
                None => return ComputationResult::failure(format!("{} was not supplied", vector.page)),
            }
        }
        ComputationResult::Result(Value::Bytes(buf.freeze()))
    }
}

impl ExecutionContext for ToyContext {
    fn place(&mut self, key: &ComputationKey) {
        self.received.clear();
        self.data.clear();
        self.task = match key {
            ComputationKey::Resumed(snapshot) => match snapshot.downcast_ref::<SumPiece>() {
                Some(piece) => {
                    self.count("sum.piece");
                    Task::Sum {
                        next: piece.lo,
                        hi: piece.hi,
                        digest: Digest::EMPTY,
                    }
                }
                None => Task::Immediate(ComputationResult::failure("unknown snapshot")),
            },
            ComputationKey::Apply(values) => match values.split_first() {
                Some((Value::Symbol(agent), args)) => {
                    self.count(agent);
                    parse(agent, args)
                }
                _ => Task::Immediate(ComputationResult::failure("missing agent")),
            },
        };
    }

    fn step(&mut self, interrupt: &InterruptFlag) -> StepStatus {
        self.inner.counters.steps.fetch_add(1, Ordering::SeqCst);
        let budget = self.jitter();
        let step_delay = self.inner.options.step_delay;

        match &mut self.task {
            Task::Idle => StepStatus::Finished(ComputationResult::failure("nothing was placed")),
            Task::Immediate(result) => StepStatus::Finished(result.clone()),
            Task::Sleep(duration, result) => {
                thread::sleep(*duration);
                StepStatus::Finished(result.clone())
            }
            Task::Panic(message) => panic!("{message}"),
            Task::Sum { next, hi, digest } => {
                let done = Self::step_sum(next, *hi, digest, budget, interrupt);
                if !step_delay.is_zero() {
                    thread::sleep(step_delay);
                }
                if done {
                    StepStatus::Finished(ComputationResult::Result(digest.to_value()))
                } else {
                    StepStatus::Interrupted
                }
            }
            &mut Task::Join { prefix, pieces } => StepStatus::Finished(self.join(prefix, pieces)),
            Task::Request {
                request,
                sent,
                finish,
            } => {
                if !*sent {
                    *sent = true;
                    return StepStatus::CacheRequest(request.clone());
                }
                let finish = *finish;
                match self.received.pop() {
                    Some(result) => StepStatus::Finished(finish(result)),
                    None => StepStatus::Finished(ComputationResult::failure("no answer supplied")),
                }
            }
            Task::Load { locator, phase } => match phase {
                LoadPhase::Resolve => {
                    *phase = LoadPhase::AwaitVector;
                    StepStatus::CacheRequest(dataset_request(locator))
                }
                LoadPhase::AwaitVector => match self.received.pop() {
                    Some(ComputationResult::Result(Value::Vector(refs))) => {
                        *phase = LoadPhase::AwaitBytes(refs.to_vec());
                        StepStatus::VectorLoad(refs.to_vec())
                    }
                    Some(ComputationResult::Result(other)) => StepStatus::Finished(
                        ComputationResult::failure(format!("expected a vector, got {other:?}")),
                    ),
                    Some(outcome) => StepStatus::Finished(outcome),
                    None => StepStatus::Finished(ComputationResult::failure("no dataset supplied")),
                },
                LoadPhase::AwaitBytes(refs) => {
                    let refs = std::mem::take(refs);
                    StepStatus::Finished(self.concat(&refs))
                }
            },
            Task::Page { page, requested } => {
                if !*requested {
                    *requested = true;
                    return StepStatus::VectorLoad(vec![VectorRef::page(*page)]);
                }
                let refs = [VectorRef::page(*page)];
                StepStatus::Finished(self.concat(&refs))
            }
        }
    }

    fn supply_external_data(&mut self, vector: &VectorRef, bytes: Bytes) {
        self.data.push((vector.clone(), bytes));
    }

    fn supply_cache_result(&mut self, result: ComputationResult) {
        self.received.push(result);
    }

    fn attempt_split(&mut self) -> Option<Vec<Snapshot>> {
        let Task::Sum { next, hi, digest } = self.task else {
            return None;
        };
        if hi - next < 2 * MIN_PIECE {
            return None;
        }

        let mid = next + (hi - next) / 2;
        self.received.clear();
        self.task = Task::Join {
            prefix: digest,
            pieces: 2,
        };
        Some(vec![
            Snapshot::new(SumPiece { lo: next, hi: mid }),
            Snapshot::new(SumPiece { lo: mid, hi }),
        ])
    }

    fn reset(&mut self) {
        if self.inner.options.panic_on_reset {
            panic!("reset boom");
        }
        self.task = Task::Idle;
        self.received.clear();
        self.data.clear();
    }
}

impl Drop for ToyContext {
    fn drop(&mut self) {
        self.inner.counters.dropped.fetch_add(1, Ordering::SeqCst);
    }
}
