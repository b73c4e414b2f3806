use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use crate::{BlobAttributes, BlobId, ContentMetrics, Headers};

/// In-process handle for one blob id.
///
/// The handle's async lock serializes every mutation of the id. Cached
/// attributes are only trusted while the handle is not stale; a fresh handle
/// is read without taking the lock.
pub struct LiveBlob {
    id: BlobId,
    lock: Mutex<()>,
    stale: AtomicBool,
    attributes: RwLock<Option<BlobAttributes>>,
}

impl LiveBlob {
    fn new(id: BlobId) -> Self {
        Self {
            id,
            lock: Mutex::new(()),
            stale: AtomicBool::new(true),
            attributes: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &BlobId {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Replace the cached attributes and mark the handle fresh
    pub fn refresh(&self, attributes: BlobAttributes) {
        *self.attributes.write() = Some(attributes);
        self.stale.store(false, Ordering::Release);
    }

    pub fn attributes(&self) -> Option<BlobAttributes> {
        self.attributes.read().clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.attributes
            .read()
            .as_ref()
            .map(|a| a.deleted)
            .unwrap_or(false)
    }
}

/// A blob as returned to callers. Holding it keeps the id's handle cached.
#[derive(Clone)]
pub struct Blob {
    handle: Arc<LiveBlob>,
}

impl Blob {
    pub(crate) fn new(handle: Arc<LiveBlob>) -> Self {
        Self { handle }
    }

    pub fn id(&self) -> &BlobId {
        self.handle.id()
    }

    pub fn headers(&self) -> Headers {
        self.handle
            .attributes
            .read()
            .as_ref()
            .map(|a| a.headers.clone())
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> Option<ContentMetrics> {
        self.handle.attributes.read().as_ref().map(|a| a.metrics.clone())
    }

    /// Whether the cached view may be outdated by a later mutation
    pub fn is_stale(&self) -> bool {
        self.handle.is_stale()
    }

    pub fn is_deleted(&self) -> bool {
        self.handle.is_deleted()
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("id", self.id())
            .field("stale", &self.is_stale())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Concurrent map of live handles. The first caller for an id creates its
/// handle; entries are evicted once only the cache still references them.
#[derive(Default)]
pub struct LiveBlobCache {
    handles: DashMap<BlobId, Arc<LiveBlob>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LiveBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: &BlobId) -> Arc<LiveBlob> {
        match self.handles.entry(id.clone()) {
            Entry::Occupied(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                entry.insert(Arc::new(LiveBlob::new(id.clone()))).clone()
            }
        }
    }

    pub fn get(&self, id: &BlobId) -> Option<Arc<LiveBlob>> {
        self.handles.get(id).map(|h| h.value().clone())
    }

    /// Mark the id's handle stale and drop it if nobody else holds it
    pub fn invalidate(&self, id: &BlobId) {
        if let Some(handle) = self.handles.get(id) {
            handle.mark_stale();
        }
        if self
            .handles
            .remove_if(id, |_, handle| Arc::strong_count(handle) == 1)
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict every handle no caller references any more
    pub fn purge(&self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|_, handle| Arc::strong_count(handle) > 1);
        let evicted = before.saturating_sub(self.handles.len());
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.handles.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes() -> BlobAttributes {
        BlobAttributes::new(Headers::new(), ContentMetrics::now("00", 1))
    }

    #[test]
    fn first_caller_creates_handle() {
        let cache = LiveBlobCache::new();
        let id = BlobId::new();

        let first = cache.get_or_create(&id);
        let second = cache.get_or_create(&id);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_stale());
        let stats = cache.stats();
        assert_eq!((stats.size, stats.hits, stats.misses), (1, 1, 1));
    }

    #[test]
    fn refresh_clears_staleness() {
        let cache = LiveBlobCache::new();
        let handle = cache.get_or_create(&BlobId::new());

        handle.refresh(attributes());
        assert!(!handle.is_stale());
        assert_eq!(Blob::new(handle.clone()).metrics().map(|m| m.content_size), Some(1));

        handle.mark_stale();
        assert!(handle.is_stale());
    }

    #[test]
    fn invalidate_keeps_handles_still_in_use() {
        let cache = LiveBlobCache::new();
        let id = BlobId::new();
        let held = cache.get_or_create(&id);
        held.refresh(attributes());

        cache.invalidate(&id);
        assert!(held.is_stale());
        assert_eq!(cache.len(), 1);

        drop(held);
        cache.invalidate(&id);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn purge_drops_unreferenced_handles() {
        let cache = LiveBlobCache::new();
        let kept = cache.get_or_create(&BlobId::new());
        for _ in 0..3 {
            cache.get_or_create(&BlobId::new());
        }

        assert_eq!(cache.purge(), 3);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(kept.id()).is_some());
    }

    #[tokio::test]
    async fn lock_serializes_holders() {
        let cache = LiveBlobCache::new();
        let id = BlobId::new();
        let handle = cache.get_or_create(&id);
        let other = cache.get_or_create(&id);

        let guard = handle.lock().await;
        let mut contender = tokio_test::task::spawn(other.lock());
        tokio_test::assert_pending!(contender.poll());

        drop(guard);
        assert!(contender.is_woken());
        let _guard = tokio_test::assert_ready!(contender.poll());
    }
}
