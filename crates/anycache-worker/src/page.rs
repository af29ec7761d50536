//! Page-level read cache
//!
//! A bounded LRU of fixed-size pages keyed by `(file, page index)`. Misses
//! are served through an installed fetcher that models a read from the
//! backing store. A reverse index `file → cached page indices` makes
//! whole-file invalidation cheap; it has its own mutex so invalidation
//! bookkeeping does not contend with the hot cache path.

use anycache_common::{Error, FileId, PageKey, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Reads one page from the backing store into `buf`, returning bytes read.
pub type PageFetcher = Box<dyn Fn(FileId, u64, &mut [u8]) -> Result<usize> + Send + Sync>;

struct PageEntry {
    data: Bytes,
    dirty: bool,
    seq: u64,
}

struct PageCache {
    entries: HashMap<PageKey, PageEntry>,
    /// Recency order: ascending seq = least recently used first
    order: BTreeMap<u64, PageKey>,
    next_seq: u64,
}

impl PageCache {
    fn touch(&mut self, key: PageKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(&key) {
            self.order.remove(&entry.seq);
            entry.seq = seq;
            self.order.insert(seq, key);
        }
    }

    fn insert(&mut self, key: PageKey, data: Bytes, dirty: bool, max_entries: usize) {
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.seq);
        }
        while self.entries.len() >= max_entries {
            let Some((&seq, &victim)) = self.order.iter().next() else {
                break;
            };
            self.order.remove(&seq);
            self.entries.remove(&victim);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, PageEntry { data, dirty, seq });
        self.order.insert(seq, key);
    }

    fn remove(&mut self, key: &PageKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.seq);
        }
    }
}

/// Thread-safe LRU cache of fixed-size pages.
pub struct PageStore {
    page_size: usize,
    max_pages: usize,
    cache: Mutex<PageCache>,
    fetcher: RwLock<Option<PageFetcher>>,
    /// file → page indices cached for that file. May retain indices of
    /// already-evicted pages; invalidation tolerates the stale entries.
    file_index: Mutex<HashMap<FileId, HashSet<u64>>>,
}

impl PageStore {
    #[must_use]
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        Self {
            page_size,
            max_pages,
            cache: Mutex::new(PageCache {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            fetcher: RwLock::new(None),
            file_index: Mutex::new(HashMap::new()),
        }
    }

    /// Install the fetcher used to load missing pages.
    pub fn set_page_fetcher(&self, fetcher: PageFetcher) {
        *self.fetcher.write() = Some(fetcher);
    }

    /// Read a page through the cache. On a miss the installed fetcher loads
    /// it; without a fetcher the read fails `Internal`. Returns bytes read.
    pub fn read_page(&self, file_id: FileId, page_index: u64, buf: &mut [u8]) -> Result<usize> {
        let key = PageKey::new(file_id, page_index);

        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.entries.get(&key) {
                let data = entry.data.clone();
                cache.touch(key);
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                return Ok(n);
            }
        }

        let data = self.fetch_page(file_id, page_index)?;
        self.cache
            .lock()
            .insert(key, data.clone(), false, self.max_pages);
        self.track_page(file_id, page_index);

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Insert a page with caller-provided contents, marked dirty. Flushing
    /// dirty pages is the caller's responsibility.
    pub fn write_page(&self, file_id: FileId, page_index: u64, data: &[u8]) {
        let key = PageKey::new(file_id, page_index);
        self.cache
            .lock()
            .insert(key, Bytes::copy_from_slice(data), true, self.max_pages);
        self.track_page(file_id, page_index);
    }

    /// Best-effort synchronous prefetch of not-yet-cached pages.
    pub fn prefetch_pages(&self, file_id: FileId, start_page: u64, count: u32) {
        for i in 0..u64::from(count) {
            let page_index = start_page + i;
            let key = PageKey::new(file_id, page_index);
            if self.cache.lock().entries.contains_key(&key) {
                continue;
            }
            if let Ok(data) = self.fetch_page(file_id, page_index) {
                self.cache.lock().insert(key, data, false, self.max_pages);
                self.track_page(file_id, page_index);
            }
        }
    }

    /// Drop the `count` least-recently-used pages.
    pub fn evict(&self, count: usize) {
        let mut cache = self.cache.lock();
        for _ in 0..count {
            let Some((&seq, &victim)) = cache.order.iter().next() else {
                break;
            };
            cache.order.remove(&seq);
            cache.entries.remove(&victim);
        }
    }

    /// Remove every cached page of a file.
    pub fn invalidate_file(&self, file_id: FileId) {
        let Some(pages) = self.file_index.lock().remove(&file_id) else {
            return;
        };
        let count = pages.len();
        let mut cache = self.cache.lock();
        for page_index in pages {
            cache.remove(&PageKey::new(file_id, page_index));
        }
        debug!(file = %file_id, pages = count, "invalidated cached pages");
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn cached_page_count(&self) -> usize {
        self.cache.lock().entries.len()
    }

    fn fetch_page(&self, file_id: FileId, page_index: u64) -> Result<Bytes> {
        let fetcher = self.fetcher.read();
        let fetcher = fetcher
            .as_ref()
            .ok_or_else(|| Error::internal("no page fetcher configured"))?;
        let mut data = vec![0u8; self.page_size];
        let fetched = fetcher(file_id, page_index, &mut data)?;
        data.truncate(fetched);
        Ok(Bytes::from(data))
    }

    fn track_page(&self, file_id: FileId, page_index: u64) {
        self.file_index
            .lock()
            .entry(file_id)
            .or_default()
            .insert(page_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anycache_common::InodeId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fid(n: u64) -> FileId {
        InodeId::new(n)
    }

    /// Fetcher producing pages filled with the low byte of the page index,
    /// counting invocations.
    fn counting_fetcher(page_size: usize, hits: Arc<AtomicUsize>) -> PageFetcher {
        Box::new(move |_file, page_index, buf| {
            hits.fetch_add(1, Ordering::SeqCst);
            let fill = page_index as u8;
            for b in buf.iter_mut() {
                *b = fill;
            }
            Ok(page_size)
        })
    }

    #[test]
    fn test_miss_fetches_then_hits() {
        let store = PageStore::new(64, 10);
        let fetches = Arc::new(AtomicUsize::new(0));
        store.set_page_fetcher(counting_fetcher(64, fetches.clone()));

        let mut buf = [0u8; 64];
        assert_eq!(store.read_page(fid(1), 3, &mut buf).unwrap(), 64);
        assert_eq!(buf[0], 3);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // Second read is served from cache
        assert_eq!(store.read_page(fid(1), 3, &mut buf).unwrap(), 64);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_without_fetcher_fails_internal() {
        let store = PageStore::new(64, 10);
        let mut buf = [0u8; 64];
        assert!(matches!(
            store.read_page(fid(1), 0, &mut buf).unwrap_err(),
            Error::Internal(_)
        ));
    }

    #[test]
    fn test_write_page_dirty_and_lru_eviction() {
        let store = PageStore::new(8, 2);
        store.write_page(fid(1), 0, b"aaaa");
        store.write_page(fid(1), 1, b"bbbb");

        // Touch page 0 so page 1 is the LRU victim
        let mut buf = [0u8; 8];
        store.read_page(fid(1), 0, &mut buf).unwrap();

        store.write_page(fid(1), 2, b"cccc");
        assert_eq!(store.cached_page_count(), 2);
        assert!(store.cache.lock().entries[&PageKey::new(fid(1), 0)].dirty);
        assert!(!store
            .cache
            .lock()
            .entries
            .contains_key(&PageKey::new(fid(1), 1)));
    }

    #[test]
    fn test_prefetch_skips_cached() {
        let store = PageStore::new(16, 10);
        let fetches = Arc::new(AtomicUsize::new(0));
        store.set_page_fetcher(counting_fetcher(16, fetches.clone()));

        let mut buf = [0u8; 16];
        store.read_page(fid(2), 0, &mut buf).unwrap();
        store.prefetch_pages(fid(2), 0, 4);

        // Page 0 was already cached; only 3 extra fetches
        assert_eq!(fetches.load(Ordering::SeqCst), 4);
        assert_eq!(store.cached_page_count(), 4);
    }

    #[test]
    fn test_evict_n() {
        let store = PageStore::new(4, 100);
        for i in 0..5 {
            store.write_page(fid(1), i, b"data");
        }
        store.evict(3);
        assert_eq!(store.cached_page_count(), 2);
        // The survivors are the two most recently inserted pages
        assert!(store
            .cache
            .lock()
            .entries
            .contains_key(&PageKey::new(fid(1), 4)));
    }

    #[test]
    fn test_invalidate_file() {
        let store = PageStore::new(4, 100);
        for i in 0..3 {
            store.write_page(fid(1), i, b"one!");
        }
        store.write_page(fid(2), 0, b"two!");

        store.invalidate_file(fid(1));
        assert_eq!(store.cached_page_count(), 1);
        assert!(store
            .cache
            .lock()
            .entries
            .contains_key(&PageKey::new(fid(2), 0)));

        // Invalidating an unknown file is a no-op
        store.invalidate_file(fid(7));
        assert_eq!(store.cached_page_count(), 1);
    }
}
