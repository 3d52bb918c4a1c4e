//! Vector data: the paged store, external loaders and dataset resolution.

use bytes::{Bytes, BytesMut};

use crate::error::LoadError;
use crate::types::{ComputationResult, DatasetLocator, ExternalSlice, PageId, Value, VectorRef};

mod filesystem;
mod memory;

pub use filesystem::FilesystemLoader;
pub use memory::MemoryPageStore;

/// Holds vector pages in memory. May forget any page at any time.
pub trait PagedStore: Send + Sync + 'static {
    fn load_if_present(&self, page: PageId) -> Option<Bytes>;

    fn store(&self, page: PageId, bytes: Bytes);
}

/// Reads objects from an external dataset.
pub trait ExternalLoader: Send + Sync + 'static {
    /// Reads the bytes `low..high` of an object.
    fn fetch_range(&self, locator: &DatasetLocator, low: u64, high: u64) -> Result<Bytes, LoadError>;

    /// The size of an object, or `None` if it does not exist.
    fn key_size(&self, locator: &DatasetLocator) -> Result<Option<u64>, LoadError>;

    /// All keys in `bucket` starting with `prefix`, with their sizes.
    fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, u64)>, LoadError>;
}

/// Cuts `size` bytes into consecutive `(low, high)` ranges of `chunk_size` bytes.
///
/// A final chunk shorter than half the chunk size is merged into its predecessor.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if size == 0 {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);

    let mut chunks: Vec<(u64, u64)> = (0..size)
        .step_by(chunk_size as usize)
        .map(|low| (low, (low + chunk_size).min(size)))
        .collect();

    if let [.., (_, previous_high), (low, high)] = chunks[..] {
        if high - low < chunk_size / 2 {
            chunks.pop();
            if let Some(last) = chunks.last_mut() {
                debug_assert_eq!(last.1, previous_high);
                last.1 = high;
            }
        }
    }
    chunks
}

/// Fetches a slice in requests of at most `max_chunk` bytes and concatenates them.
pub fn fetch_chunked(
    loader: &dyn ExternalLoader,
    slice: &ExternalSlice,
    max_chunk: u64,
) -> Result<Bytes, LoadError> {
    let max_chunk = max_chunk.max(1);
    if slice.len() <= max_chunk {
        let bytes = loader.fetch_range(&slice.locator, slice.low, slice.high)?;
        return check_length(slice, bytes);
    }

    let mut buf = BytesMut::with_capacity(slice.len() as usize);
    let mut low = slice.low;
    while low < slice.high {
        let high = (low + max_chunk).min(slice.high);
        let piece = loader.fetch_range(&slice.locator, low, high)?;
        if piece.len() as u64 != high - low {
            return Err(short_read(slice, low + piece.len() as u64));
        }
        buf.extend_from_slice(&piece);
        low = high;
    }
    Ok(buf.freeze())
}

fn check_length(slice: &ExternalSlice, bytes: Bytes) -> Result<Bytes, LoadError> {
    if bytes.len() as u64 == slice.len() {
        Ok(bytes)
    } else {
        Err(short_read(slice, slice.low + bytes.len() as u64))
    }
}

fn short_read(slice: &ExternalSlice, reached: u64) -> LoadError {
    LoadError::Malformed(format!("expected {slice}, data ended at {reached}"))
}

/// The objects backing a dataset, in order.
///
/// That is the exact key if it exists, otherwise every `key_<index>` ordered by index.
fn dataset_members(
    loader: &dyn ExternalLoader,
    locator: &DatasetLocator,
) -> Result<Vec<(DatasetLocator, u64)>, LoadError> {
    if let Some(size) = loader.key_size(locator)? {
        return Ok(vec![(locator.clone(), size)]);
    }

    let prefix = format!("{}_", locator.key);
    let mut indexed: Vec<_> = loader
        .list_keys(&locator.bucket, &prefix)?
        .into_iter()
        .filter_map(|(key, size)| {
            let index: u64 = key.strip_prefix(&prefix)?.parse().ok()?;
            Some((index, key, size))
        })
        .collect();
    indexed.sort_unstable();

    Ok(indexed
        .into_iter()
        .map(|(_, key, size)| (DatasetLocator::new(&locator.bucket, &key), size))
        .collect())
}

/// Answers a dataset request with one external [`VectorRef`] per chunk of the dataset.
pub fn resolve_dataset(
    loader: &dyn ExternalLoader,
    locator: &DatasetLocator,
    chunk_size: u64,
) -> ComputationResult {
    let members = match dataset_members(loader, locator) {
        Ok(members) => members,
        Err(err) => return ComputationResult::exception(format!("failed to list {locator}: {err}")),
    };
    if members.is_empty() {
        return ComputationResult::exception(format!("no keys matching {locator}"));
    }

    let refs: Vec<_> = members
        .into_iter()
        .flat_map(|(locator, size)| {
            plan_chunks(size, chunk_size)
                .into_iter()
                .map(move |(low, high)| {
                    VectorRef::external(ExternalSlice {
                        locator: locator.clone(),
                        low,
                        high,
                    })
                })
        })
        .collect();

    tracing::debug!(%locator, chunks = refs.len(), "resolved dataset");
    ComputationResult::Result(Value::Vector(refs.into()))
}

/// A loader that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoader;

impl ExternalLoader for NoLoader {
    fn fetch_range(&self, _locator: &DatasetLocator, _low: u64, _high: u64) -> Result<Bytes, LoadError> {
        Err(LoadError::NotFound)
    }

    fn key_size(&self, _locator: &DatasetLocator) -> Result<Option<u64>, LoadError> {
        Ok(None)
    }

    fn list_keys(&self, _bucket: &str, _prefix: &str) -> Result<Vec<(String, u64)>, LoadError> {
        Ok(Vec::new())
    }
}
