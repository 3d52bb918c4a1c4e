//! Decoding of the values engines hand out with [`StepStatus::CacheRequest`].
//!
//! A request is either a dataset request:
//!
//! ```text
//! (#Dataset, "bucket", "key")
//! ```
//!
//! or a tuple of calls, each `(agent, (args...))` with an optional third element that is
//! a placement hint and is ignored here.
//!
//! [`StepStatus::CacheRequest`]: crate::StepStatus::CacheRequest

use std::sync::Arc;

use thiserror::Error;

use crate::types::{ComputationKey, ComputationResult, DatasetLocator, Value};

/// The symbol heading a dataset request.
pub const DATASET_SYMBOL: &str = "Dataset";

/// A decoded cache request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRequest {
    Dataset(DatasetLocator),
    Calls(Vec<CacheCall>),
}

/// One apply-call inside a cache request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCall {
    pub agent: Value,
    pub args: Vec<Value>,
}

impl CacheCall {
    pub fn new(agent: Value, args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            agent,
            args: args.into_iter().collect(),
        }
    }

    pub fn key(&self) -> ComputationKey {
        ComputationKey::apply(std::iter::once(self.agent.clone()).chain(self.args.iter().cloned()))
    }

    fn encode(&self) -> Value {
        Value::tuple([self.agent.clone(), Value::tuple(self.args.iter().cloned())])
    }
}

/// Why a cache request value could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidCacheCall {
    #[error("cache-call argument must be a tuple")]
    NotATuple,
    #[error("cache-call tuple must contain two or three elements")]
    WrongArity,
    #[error("cache-call arguments must be a tuple")]
    ArgumentsNotATuple,
    #[error("Badly formed dataset request: {0:?}")]
    BadDataset(Value),
}

impl CacheRequest {
    pub fn decode(request: &Value) -> Result<Self, InvalidCacheCall> {
        let entries = request.as_tuple().ok_or(InvalidCacheCall::NotATuple)?;

        if let Some(head) = entries.first().and_then(Value::as_symbol) {
            if head == DATASET_SYMBOL {
                return match entries {
                    [_, Value::Str(bucket), Value::Str(key)] => Ok(Self::Dataset(DatasetLocator {
                        bucket: Arc::clone(bucket),
                        key: Arc::clone(key),
                    })),
                    _ => Err(InvalidCacheCall::BadDataset(request.clone())),
                };
            }
        }

        entries
            .iter()
            .map(decode_call)
            .collect::<Result<_, _>>()
            .map(Self::Calls)
    }
}

fn decode_call(entry: &Value) -> Result<CacheCall, InvalidCacheCall> {
    let parts = entry.as_tuple().ok_or(InvalidCacheCall::NotATuple)?;
    let (agent, args) = match parts {
        [agent, args] | [agent, args, _] => (agent, args),
        _ => return Err(InvalidCacheCall::WrongArity),
    };
    let args = args.as_tuple().ok_or(InvalidCacheCall::ArgumentsNotATuple)?;

    Ok(CacheCall::new(agent.clone(), args.iter().cloned()))
}

/// Builds the request value for a list of calls.
pub fn calls_request<'a>(calls: impl IntoIterator<Item = &'a CacheCall>) -> Value {
    Value::tuple(calls.into_iter().map(CacheCall::encode))
}

/// Builds the request value for a dataset.
pub fn dataset_request(locator: &DatasetLocator) -> Value {
    Value::tuple([
        Value::symbol(DATASET_SYMBOL),
        Value::Str(Arc::clone(&locator.bucket)),
        Value::Str(Arc::clone(&locator.key)),
    ])
}

/// Folds sub-call outcomes, given in call order, into the answer for the whole request.
///
/// A failure anywhere wins. Otherwise the first exception in call order wins, no matter
/// which sub-call finished first. Otherwise all values are returned as one tuple.
pub fn combine_call_results(results: impl IntoIterator<Item = ComputationResult>) -> ComputationResult {
    let mut values = Vec::new();
    let mut first_exception = None;

    for result in results {
        match result {
            ComputationResult::Failure(_) => return result,
            ComputationResult::Exception(_) => {
                first_exception.get_or_insert(result);
            }
            ComputationResult::Result(value) => values.push(value),
        }
    }

    first_exception.unwrap_or_else(|| ComputationResult::Result(Value::tuple(values)))
}
