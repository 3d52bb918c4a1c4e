use bytes::Bytes;
use moka::sync::Cache;

use super::PagedStore;
use crate::types::PageId;

/// A [`PagedStore`] bounded by the total byte length of the pages it holds.
///
/// Which pages are evicted once it is full is left to the underlying cache.
#[derive(Clone)]
pub struct MemoryPageStore {
    pages: Cache<PageId, Bytes>,
}

impl std::fmt::Debug for MemoryPageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPageStore")
            .field("entries", &self.pages.entry_count())
            .field("weighted_size", &self.pages.weighted_size())
            .finish()
    }
}

impl MemoryPageStore {
    pub fn new(capacity: u64) -> Self {
        let pages = Cache::builder()
            .max_capacity(capacity)
            .name("page-store")
            .weigher(|_page: &PageId, bytes: &Bytes| bytes.len().try_into().unwrap_or(u32::MAX))
            .build();
        Self { pages }
    }

    /// The summed byte length of all held pages, as of the last maintenance run.
    pub fn weighted_size(&self) -> u64 {
        self.pages.run_pending_tasks();
        self.pages.weighted_size()
    }
}

impl PagedStore for MemoryPageStore {
    fn load_if_present(&self, page: PageId) -> Option<Bytes> {
        self.pages.get(&page)
    }

    fn store(&self, page: PageId, bytes: Bytes) {
        self.pages.insert(page, bytes);
    }
}
