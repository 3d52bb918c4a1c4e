use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;

use stepwise_cache::data::ExternalLoader;
use stepwise_cache::{DatasetLocator, LoadError};

/// An [`ExternalLoader`] serving objects from memory, counting every fetch.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, bytes: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_owned(), key.to_owned()), bytes.into());
    }

    /// Number of `fetch_range` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Makes every following fetch fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ExternalLoader for MemoryLoader {
    fn fetch_range(&self, locator: &DatasetLocator, low: u64, high: u64) -> Result<Bytes, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LoadError::Io("connection reset".into()));
        }

        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(&(locator.bucket.to_string(), locator.key.to_string()))
            .ok_or(LoadError::NotFound)?;
        let low = (low as usize).min(object.len());
        let high = (high as usize).clamp(low, object.len());
        Ok(object.slice(low..high))
    }

    fn key_size(&self, locator: &DatasetLocator) -> Result<Option<u64>, LoadError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&(locator.bucket.to_string(), locator.key.to_string()))
            .map(|object| object.len() as u64))
    }

    fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, u64)>, LoadError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((b, key), _)| b == bucket && key.starts_with(prefix))
            .map(|((_, key), object)| (key.clone(), object.len() as u64))
            .collect())
    }
}
