//! Values, keys and results flowing between callers, the scheduler and the engine.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use rustc_hash::FxHasher;

use crate::error::EngineFailure;

/// An immutable value the engine computes with.
///
/// Cloning is cheap: every variant with heap data is reference counted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Nothing,
    Int(i64),
    Str(Arc<str>),
    Symbol(Arc<str>),
    Tuple(Arc<[Value]>),
    Bytes(Bytes),
    Vector(Arc<[VectorRef]>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Self::Str(s.into())
    }

    pub fn symbol(s: &str) -> Self {
        Self::Symbol(s.into())
    }

    pub fn tuple(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Tuple(values.into_iter().collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(values) => Some(values),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::str(s)
    }
}

/// Identifies one page in the [`PagedStore`](crate::data::PagedStore).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// A `bucket`/`key` pair naming an object in an external dataset.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatasetLocator {
    pub bucket: Arc<str>,
    pub key: Arc<str>,
}

impl DatasetLocator {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for DatasetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// The byte range `low..high` of an external object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExternalSlice {
    pub locator: DatasetLocator,
    pub low: u64,
    pub high: u64,
}

impl ExternalSlice {
    pub fn len(&self) -> u64 {
        self.high.saturating_sub(self.low)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ExternalSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{}]", self.locator, self.low, self.high)
    }
}

/// A reference to a piece of vector data.
///
/// When `source` is present the bytes can be recovered from the external loader if the
/// paged store no longer holds the page.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VectorRef {
    pub page: PageId,
    pub source: Option<ExternalSlice>,
}

impl VectorRef {
    /// A page that only lives in the paged store.
    pub fn page(page: PageId) -> Self {
        Self { page, source: None }
    }

    /// A page backed by an external slice. The page id is derived from the slice, so the
    /// same slice always maps onto the same page.
    pub fn external(slice: ExternalSlice) -> Self {
        let mut hasher = FxHasher::default();
        slice.hash(&mut hasher);
        // the high bit keeps derived ids apart from engine-assigned ones
        let page = PageId(hasher.finish() | (1 << 63));
        Self {
            page,
            source: Some(slice),
        }
    }
}

static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque piece of suspended engine state produced by splitting.
///
/// Two snapshots are equal only if they are clones of the same snapshot.
#[derive(Clone)]
pub struct Snapshot {
    id: u64,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Snapshot {
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            id: NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed),
            payload: Arc::new(payload),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.payload).downcast_ref::<T>()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Snapshot {}

impl Hash for Snapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshot(#{})", self.id)
    }
}

/// The identity of one computation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ComputationKey {
    /// Invoke the agent in the first position with the remaining values as arguments.
    Apply(Arc<[Value]>),
    /// Continue from a snapshot produced by a split.
    Resumed(Snapshot),
}

impl ComputationKey {
    pub fn apply(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Apply(values.into_iter().collect())
    }

    /// The agent of an apply key.
    pub fn agent(&self) -> Option<&Value> {
        match self {
            Self::Apply(values) => values.first(),
            Self::Resumed(_) => None,
        }
    }
}

/// The outcome of a computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputationResult {
    Result(Value),
    Exception(Value),
    /// The engine could not produce a value. Never cached.
    Failure(EngineFailure),
}

impl ComputationResult {
    /// An exception carrying a string message.
    pub fn exception(message: impl AsRef<str>) -> Self {
        Self::Exception(Value::str(message.as_ref()))
    }

    pub fn failure(message: impl AsRef<str>) -> Self {
        Self::Failure(EngineFailure::new(message.as_ref()))
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// The value of a successful result.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Result(value) => Some(value),
            _ => None,
        }
    }
}
