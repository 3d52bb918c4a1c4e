use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use stepwise_cache::{ComputationCache, ComputationKey, ComputationResult, Value};
use stepwise_test::ToyEngine;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Evict the result after every operation, so the next one computes it again.
    ///
    /// Without this, every operation after the warmup is a cache hit.
    #[serde(default)]
    pub fresh: bool,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Square {
        n: i64,
        #[serde(default)]
        sleep_ms: i64,
    },
    Sum {
        lo: i64,
        hi: i64,
    },
    Fib(i64),
    /// Two computations requesting each other.
    Cycle(i64),
    Dataset {
        bucket: String,
        key: String,
    },
}

#[derive(Debug, Clone)]
pub struct ParsedPayload {
    pub key: ComputationKey,
    pub fresh: bool,
}

fn key(agent: &str, args: impl IntoIterator<Item = Value>) -> ComputationKey {
    ComputationKey::apply(std::iter::once(Value::symbol(agent)).chain(args))
}

pub fn prepare_payload(workload: &Workload) -> ParsedPayload {
    let key = match &workload.payload {
        Payload::Square { n, sleep_ms: 0 } => key("square", [Value::Int(*n)]),
        Payload::Square { n, sleep_ms } => key("square", [Value::Int(*n), Value::Int(*sleep_ms)]),
        Payload::Sum { lo, hi } => key("sum", [Value::Int(*lo), Value::Int(*hi)]),
        Payload::Fib(n) => key("fib", [Value::Int(*n)]),
        Payload::Cycle(n) => key("ping", [Value::Int(*n)]),
        Payload::Dataset { bucket, key: name } => {
            key("load", [Value::str(bucket), Value::str(name)])
        }
    };

    ParsedPayload {
        key,
        fresh: workload.fresh,
    }
}

pub fn process_payload(
    cache: &ComputationCache<ToyEngine>,
    payload: &ParsedPayload,
) -> Result<ComputationResult> {
    let results = cache.lookup_several(std::slice::from_ref(&payload.key), true, !payload.fresh)?;
    results
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| anyhow!("blocking lookup returned nothing"))
}
