//! Bounded cache of chunk buffers in front of the remote client.
//!
//! - One fetch per chunk: concurrent `get`s for a missing chunk share a single
//!   download through a shared future.
//! - Soft limit: once the number of entries exceeds it, a background pass
//!   evicts least-recently-used chunks, uploading dirty ones first.
//! - Hard limit: every entry holds a semaphore permit, so a new entry waits
//!   for a slot when the cache is full.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::buffer::CachedChunk;
use super::chunk::FileChunk;
use crate::cadapter::client::RemoteClient;
use crate::cadapter::error::BlobError;
use crate::cadapter::queue::Priority;

const EVICTION_BACKOFF: Duration = Duration::from_millis(100);

// Buffer references owned by the cache itself: `loaded` and the output kept
// by `pending`.
const CACHE_HELD_REFS: usize = 2;

pub type SharedBlobError = Arc<BlobError>;
pub type ChunkResult = Result<Arc<CachedChunk>, SharedBlobError>;
type PendingChunk = Shared<BoxFuture<'static, ChunkResult>>;
type Slot = Arc<Mutex<Option<OwnedSemaphorePermit>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub soft_limit: usize,
    pub hard_limit: usize,
    /// How many entries one eviction round looks at.
    pub simultaneous_evictions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            soft_limit: 50,
            hard_limit: 200,
            simultaneous_evictions: 5,
        }
    }
}

#[derive(Error, Debug)]
#[error("{failed} chunk upload(s) failed during flush, first error: {first}")]
pub struct FlushError {
    pub failed: usize,
    pub first: BlobError,
}

struct CacheEntry {
    chunk: Arc<FileChunk>,
    pending: PendingChunk,
    loaded: Arc<OnceLock<Arc<CachedChunk>>>,
    // 持有 hard limit 的 permit，条目释放时随之归还
    slot: Slot,
    fetch: Option<AbortHandle>,
}

impl CacheEntry {
    fn ready(chunk: Arc<FileChunk>, cached: Arc<CachedChunk>, slot: Slot) -> Self {
        let value: ChunkResult = Ok(cached.clone());
        Self {
            chunk,
            pending: futures::future::ready(value).boxed().shared(),
            loaded: Arc::new(OnceLock::from(cached)),
            slot,
            fetch: None,
        }
    }

    fn cached(&self) -> Option<Arc<CachedChunk>> {
        self.loaded.get().cloned()
    }

    fn holds(&self, cached: &Arc<CachedChunk>) -> bool {
        self.loaded.get().is_some_and(|c| Arc::ptr_eq(c, cached))
    }

    /// Some caller still awaits `pending`.
    fn has_waiters(&self) -> bool {
        self.pending.strong_count().is_some_and(|n| n > 1)
    }

    /// A caller is waiting for the buffer or still holds it and may write.
    fn in_use(&self) -> bool {
        self.has_waiters()
            || self
                .loaded
                .get()
                .is_some_and(|c| Arc::strong_count(c) > CACHE_HELD_REFS)
    }

    /// Whether dropping the entry loses nothing. Must be evaluated under the
    /// shard lock so that no new caller can pick the buffer up meanwhile.
    fn removable(&self) -> bool {
        if self.chunk.is_dropped() {
            return true;
        }
        !self.in_use() && self.loaded.get().is_none_or(|c| c.is_clean())
    }

    fn evictable(&self) -> bool {
        !self.in_use() && self.loaded.get().is_none_or(|c| !c.is_uploading())
    }
}

struct Candidate {
    last_use: u64,
    entry: Arc<CacheEntry>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.last_use
            .cmp(&other.last_use)
            .then_with(|| self.entry.chunk.id().cmp(&other.entry.chunk.id()))
    }
}

struct CacheInner {
    remote: Arc<RemoteClient>,
    entries: DashMap<Uuid, Arc<CacheEntry>>,
    slots: Arc<Semaphore>,
    config: CacheConfig,
    evicting: AtomicBool,
}

#[derive(Clone)]
pub struct ChunkCache {
    inner: Arc<CacheInner>,
}

impl ChunkCache {
    pub fn new(remote: Arc<RemoteClient>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                remote,
                entries: DashMap::new(),
                slots: Arc::new(Semaphore::new(config.hard_limit)),
                config,
                evicting: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    pub fn remote(&self) -> &Arc<RemoteClient> {
        &self.inner.remote
    }

    /// Returns the buffer for `chunk`, downloading it on a miss. A chunk that
    /// was never uploaded yields an empty buffer.
    pub async fn get(&self, chunk: &Arc<FileChunk>) -> ChunkResult {
        self.get_async(chunk, Priority::High).await
    }

    /// Starts fetching `chunk` in the background at low priority.
    pub fn prefetch(&self, chunk: &Arc<FileChunk>) {
        if !chunk.is_uploaded() {
            return;
        }
        let _ = self.get_async(chunk, Priority::Low);
    }

    fn get_async(&self, chunk: &Arc<FileChunk>, priority: Priority) -> PendingChunk {
        chunk.touch();
        let pending = match self.inner.entries.entry(chunk.id()) {
            Entry::Occupied(entry) => {
                debug!(chunk = %chunk.id(), "cache hit");
                return entry.get().pending.clone();
            }
            Entry::Vacant(vacant) => {
                debug!(chunk = %chunk.id(), ?priority, "cache miss");
                let slot: Slot = Arc::new(Mutex::new(None));
                let loaded = Arc::new(OnceLock::new());
                let task = tokio::spawn(CacheInner::load(
                    self.inner.clone(),
                    chunk.clone(),
                    priority,
                    slot.clone(),
                    loaded.clone(),
                ));
                let fetch = task.abort_handle();
                let pending = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(_) => Err(Arc::new(BlobError::Cancelled)),
                    }
                }
                .boxed()
                .shared();
                vacant.insert(Arc::new(CacheEntry {
                    chunk: chunk.clone(),
                    pending: pending.clone(),
                    loaded,
                    slot,
                    fetch: Some(fetch),
                }));
                pending
            }
        };
        self.inner.schedule_eviction();
        pending
    }

    /// Records that `cached` holds the current data of `chunk`, bumping its
    /// recency. Installs the entry if the map lost it meanwhile, waiting for
    /// a slot when the cache is at its hard limit. A dropped chunk is ignored.
    pub async fn touch(&self, chunk: &Arc<FileChunk>, cached: &Arc<CachedChunk>) -> Result<(), BlobError> {
        if chunk.is_dropped() {
            debug!(chunk = %chunk.id(), "chunk left its file, not caching");
            return Ok(());
        }
        chunk.touch();
        let mut permit = None;
        while !self.inner.try_install(chunk, cached, &mut permit) {
            let acquired = self
                .inner
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BlobError::Shutdown)?;
            permit = Some(acquired);
        }
        self.inner.schedule_eviction();
        Ok(())
    }

    /// Forgets `chunk` without uploading it, cancelling a fetch in progress.
    pub fn drop_chunk(&self, chunk: &FileChunk) {
        chunk.mark_dropped();
        if let Some((id, entry)) = self.inner.entries.remove(&chunk.id()) {
            if let Some(fetch) = &entry.fetch {
                fetch.abort();
            }
            debug!(chunk = %id, "dropped chunk from cache");
        }
    }

    /// The buffer of `chunk` if it is cached and fully loaded.
    pub fn peek(&self, chunk: &FileChunk) -> Option<Arc<CachedChunk>> {
        self.inner.entries.get(&chunk.id()).and_then(|e| e.cached())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Free hard-limit slots.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Uploads every dirty chunk and waits for uploads already running.
    /// Entries still being fetched hold no unsaved data and are skipped.
    /// Returns the number of chunks uploaded.
    pub async fn flush(&self) -> Result<usize, FlushError> {
        let entries: Vec<Arc<CacheEntry>> = self
            .inner
            .entries
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut jobs = Vec::new();
        for entry in entries {
            let Some(cached) = entry.cached() else {
                continue;
            };
            if cached.is_clean() || entry.chunk.is_dropped() {
                continue;
            }
            let inner = self.inner.clone();
            jobs.push(tokio::spawn(async move {
                cached.wait_idle().await;
                match cached.begin_upload() {
                    Some(data) => inner.upload(&entry.chunk, &cached, data).await.map(|_| true),
                    None => Ok(false),
                }
            }));
        }

        let mut uploaded = 0;
        let mut failed = 0;
        let mut first = None;
        for outcome in join_all(jobs).await {
            match outcome {
                Ok(Ok(true)) => uploaded += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    first.get_or_insert(e);
                }
                Err(_) => {
                    failed += 1;
                    first.get_or_insert(BlobError::Cancelled);
                }
            }
        }
        self.inner.schedule_eviction();
        match first {
            None => {
                info!(uploaded, "chunk cache flushed");
                Ok(uploaded)
            }
            Some(first) => Err(FlushError { failed, first }),
        }
    }
}

impl CacheInner {
    async fn load(
        self: Arc<Self>,
        chunk: Arc<FileChunk>,
        priority: Priority,
        slot: Slot,
        loaded: Arc<OnceLock<Arc<CachedChunk>>>,
    ) -> ChunkResult {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Arc::new(BlobError::Shutdown))?;
        *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(permit);

        let capacity = self.remote.max_chunk_size() as usize;
        let cached = if chunk.is_uploaded() {
            match self.remote.download(&chunk, priority).await {
                Ok(blob) => CachedChunk::from_remote(&blob, capacity, chunk.size()),
                Err(e) => {
                    warn!(chunk = %chunk.id(), error = %e, "chunk fetch failed");
                    self.entries
                        .remove_if(&chunk.id(), |_, entry| Arc::ptr_eq(&entry.loaded, &loaded));
                    return Err(Arc::new(e));
                }
            }
        } else {
            CachedChunk::empty(capacity)
        };
        let cached = Arc::new(cached);
        let _ = loaded.set(cached.clone());
        if chunk.is_dropped() {
            self.entries
                .remove_if(&chunk.id(), |_, entry| Arc::ptr_eq(&entry.loaded, &loaded));
        }
        chunk.touch();
        Ok(cached)
    }

    /// Makes `cached` the entry of `chunk`. Returns false when the chunk has
    /// no entry and no permit is at hand yet.
    fn try_install(
        &self,
        chunk: &Arc<FileChunk>,
        cached: &Arc<CachedChunk>,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> bool {
        match self.entries.entry(chunk.id()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.holds(cached) {
                    return true;
                }
                if current.has_waiters() || current.cached().is_some_and(|c| !c.is_clean()) {
                    error!(chunk = %chunk.id(), "chunk is cached with another buffer holding unsaved data, keeping it");
                    return true;
                }
                // 复用旧条目的 slot
                let slot = occupied.get().slot.clone();
                occupied.insert(Arc::new(CacheEntry::ready(chunk.clone(), cached.clone(), slot)));
                true
            }
            Entry::Vacant(vacant) => match permit.take() {
                Some(p) => {
                    let slot = Arc::new(Mutex::new(Some(p)));
                    vacant.insert(Arc::new(CacheEntry::ready(chunk.clone(), cached.clone(), slot)));
                    true
                }
                None => false,
            },
        }
    }

    async fn upload(&self, chunk: &FileChunk, cached: &CachedChunk, data: Bytes) -> Result<(), BlobError> {
        match self.remote.upload(chunk, data).await {
            Ok(blob_id) => {
                chunk.set_remote_blob_id(blob_id);
                cached.finish_upload(true);
                Ok(())
            }
            Err(e) => {
                cached.finish_upload(false);
                Err(e)
            }
        }
    }

    fn over_soft_limit(&self) -> bool {
        self.entries.len() > self.config.soft_limit
    }

    fn schedule_eviction(self: &Arc<Self>) {
        if !self.over_soft_limit() || self.evicting.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.run_eviction().await });
    }

    async fn run_eviction(self: Arc<Self>) {
        loop {
            while self.over_soft_limit() {
                let excess = self.entries.len().saturating_sub(self.config.soft_limit);
                let batch = self.config.simultaneous_evictions.max(1).min(excess);
                let victims = self.oldest_entries(batch);
                let outcomes = join_all(victims.into_iter().map(|entry| self.evict(entry))).await;
                let removed = outcomes.into_iter().filter(|removed| *removed).count();
                debug!(removed, remaining = self.entries.len(), "eviction round done");
                if removed == 0 {
                    warn!(entries = self.entries.len(), "eviction made no progress, backing off");
                    tokio::time::sleep(EVICTION_BACKOFF).await;
                }
            }
            self.evicting.store(false, Ordering::Release);
            // 释放标志后再检查一次，避免错过并发触发
            if !self.over_soft_limit() || self.evicting.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }

    fn oldest_entries(&self, k: usize) -> Vec<Arc<CacheEntry>> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        for item in self.entries.iter() {
            let entry = item.value();
            if !entry.evictable() {
                continue;
            }
            heap.push(Candidate {
                last_use: entry.chunk.last_use(),
                entry: entry.clone(),
            });
            if heap.len() > k {
                heap.pop();
            }
        }
        heap.into_sorted_vec().into_iter().map(|c| c.entry).collect()
    }

    /// Tries to remove one entry. Returns whether it left the cache.
    async fn evict(&self, entry: Arc<CacheEntry>) -> bool {
        let id = entry.chunk.id();
        let Some(cached) = entry.cached() else {
            // 无人等待的加载（预取）
            if !self.remove_if_removable(&entry) {
                return false;
            }
            debug!(chunk = %id, "evicted incomplete entry");
            if let Some(fetch) = &entry.fetch {
                fetch.abort();
            }
            return true;
        };
        if cached.is_uploading() {
            return false;
        }
        if !cached.is_dirty() {
            debug!(chunk = %id, "evicting clean chunk");
            drop(cached);
            return self.remove_if_removable(&entry);
        }
        let Some(data) = cached.begin_upload() else {
            return false;
        };
        debug!(chunk = %id, buffer = %cached.id(), bytes = data.len(), "uploading dirty chunk before eviction");
        if let Err(e) = self.upload(&entry.chunk, &cached, data).await {
            warn!(chunk = %id, error = %e, "upload during eviction failed, keeping chunk cached");
            return false;
        }
        drop(cached);
        self.remove_if_removable(&entry)
    }

    // Runs the removability check under the shard lock. `get` hands out
    // buffers under the same lock, so a buffer a caller can still write to is
    // never dropped from the map.
    fn remove_if_removable(&self, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .remove_if(&entry.chunk.id(), |_, current| {
                Arc::ptr_eq(current, entry) && current.removable()
            })
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::client::ClientConfig;
    use crate::cadapter::memory::MemoryBackend;
    use crate::cadapter::retry::RetryPolicy;
    use crate::cadapter::error::TransportError;
    use std::time::Instant;

    fn remote(backend: &Arc<MemoryBackend>) -> Arc<RemoteClient> {
        let policy = RetryPolicy {
            max_attempts: Some(2),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Some(Duration::from_secs(5)),
        };
        Arc::new(RemoteClient::start(
            backend.clone(),
            ClientConfig {
                download_workers: 3,
                upload_workers: 2,
                download_retry: policy,
                upload_retry: policy,
            },
        ))
    }

    fn cache(backend: &Arc<MemoryBackend>, soft: usize, hard: usize) -> ChunkCache {
        ChunkCache::new(
            remote(backend),
            CacheConfig {
                soft_limit: soft,
                hard_limit: hard,
                simultaneous_evictions: 2,
            },
        )
    }

    fn uploaded_chunk(backend: &MemoryBackend, data: &[u8]) -> Arc<FileChunk> {
        let blob = backend.insert(Bytes::copy_from_slice(data));
        Arc::new(FileChunk::restore(Uuid::new_v4(), Some(blob), data.len()))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_download() {
        let backend = Arc::new(MemoryBackend::new(16).with_latency(Duration::from_millis(30)));
        let cache = cache(&backend, 8, 16);
        let chunk = uploaded_chunk(&backend, b"shared");

        let gets: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let chunk = chunk.clone();
                tokio::spawn(async move { cache.get(&chunk).await })
            })
            .collect();
        let mut buffers = Vec::new();
        for get in gets {
            buffers.push(get.await.unwrap().unwrap());
        }
        assert_eq!(backend.downloads(), 1);
        assert!(buffers.iter().all(|b| Arc::ptr_eq(b, &buffers[0])));
        assert_eq!(buffers[0].size(), 6);
    }

    #[tokio::test]
    async fn test_never_uploaded_chunk_is_empty() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 8, 16);
        let chunk = Arc::new(FileChunk::new());
        let cached = cache.get(&chunk).await.unwrap();
        assert_eq!(cached.size(), 0);
        assert_eq!(cached.capacity(), 16);
        assert_eq!(backend.download_attempts(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 8, 16);
        let chunk = uploaded_chunk(&backend, b"data");
        backend.fail_next_downloads(1, TransportError::Fatal("boom".into()));

        assert!(cache.get(&chunk).await.is_err());
        let cached = cache.get(&chunk).await.unwrap();
        assert_eq!(cached.size(), 4);
    }

    #[tokio::test]
    async fn test_flush_uploads_dirty_once() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 8, 16);
        let chunk = Arc::new(FileChunk::new());

        let cached = cache.get(&chunk).await.unwrap();
        cached.write(0, b"dirty");
        chunk.grow_to(5);
        cache.touch(&chunk, &cached).await.unwrap();

        assert_eq!(cache.flush().await.unwrap(), 1);
        let blob = chunk.remote_blob_id().unwrap();
        assert_eq!(&backend.get(&blob).unwrap()[..], b"dirty");
        assert!(cached.is_clean());

        assert_eq!(cache.flush().await.unwrap(), 0);
        assert_eq!(backend.uploads(), 1);
    }

    #[tokio::test]
    async fn test_flush_reports_failures_and_keeps_dirty() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 8, 16);
        let chunk = Arc::new(FileChunk::new());
        let cached = cache.get(&chunk).await.unwrap();
        cached.write(0, b"x");
        backend.fail_next_uploads(1, TransportError::Fatal("denied".into()));

        let err = cache.flush().await.unwrap_err();
        assert_eq!(err.failed, 1);
        assert!(cached.is_dirty());
        assert!(chunk.remote_blob_id().is_none());

        assert_eq!(cache.flush().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hard_limit_blocks_new_entries() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 2, 2);

        let first = Arc::new(FileChunk::new());
        let second = Arc::new(FileChunk::new());
        let third = Arc::new(FileChunk::new());
        for chunk in [&first, &second] {
            let cached = Arc::new(CachedChunk::empty(16));
            cached.write(0, b"a");
            cache.touch(chunk, &cached).await.unwrap();
        }
        assert_eq!(cache.available_slots(), 0);

        let blocked = Arc::new(CachedChunk::empty(16));
        let attempt = tokio::time::timeout(Duration::from_millis(50), cache.touch(&third, &blocked)).await;
        assert!(attempt.is_err(), "third entry must wait for a slot");

        cache.drop_chunk(&first);
        assert_eq!(cache.available_slots(), 1);
        tokio::time::timeout(Duration::from_secs(1), cache.touch(&third, &blocked))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eviction_uploads_dirty_and_drops_oldest() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 1, 8);

        let mut chunks = Vec::new();
        for i in 0..4u8 {
            let chunk = Arc::new(FileChunk::new());
            let cached = cache.get(&chunk).await.unwrap();
            cached.write(0, &[i; 3]);
            chunk.grow_to(3);
            cache.touch(&chunk, &cached).await.unwrap();
            chunks.push(chunk);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        wait_until(|| cache.len() <= 1).await;
        wait_until(|| cache.available_slots() == 7).await;
        // the most recently used chunk survives
        assert!(cache.peek(&chunks[3]).is_some());
        for (i, chunk) in chunks.iter().take(3).enumerate() {
            let blob = chunk.remote_blob_id().expect("evicted dirty chunk was uploaded");
            assert_eq!(&backend.get(&blob).unwrap()[..], &[i as u8; 3]);
        }

        // evicted chunk comes back from the remote
        let again = cache.get(&chunks[0]).await.unwrap();
        let mut out = Vec::new();
        again.read_into(0, 3, &mut out);
        assert_eq!(out, vec![0u8; 3]);
    }

    #[tokio::test]
    async fn test_drop_chunk_releases_slot() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 4, 4);
        let chunk = Arc::new(FileChunk::new());
        let cached = cache.get(&chunk).await.unwrap();
        cached.write(0, b"gone");
        assert_eq!(cache.available_slots(), 3);

        cache.drop_chunk(&chunk);
        assert_eq!(cache.available_slots(), 4);
        assert!(cache.peek(&chunk).is_none());
        assert_eq!(cache.flush().await.unwrap(), 0);
        assert_eq!(backend.upload_attempts(), 0);
    }

    #[tokio::test]
    async fn test_touch_ignores_dropped_chunk() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 4, 4);
        let chunk = Arc::new(FileChunk::new());
        let cached = cache.get(&chunk).await.unwrap();
        cache.drop_chunk(&chunk);

        // a write that raced the unlink must not bring the chunk back
        cached.write(0, b"late");
        cache.touch(&chunk, &cached).await.unwrap();
        assert!(cache.peek(&chunk).is_none());
        assert_eq!(cache.available_slots(), 4);
        assert_eq!(cache.flush().await.unwrap(), 0);
        assert_eq!(backend.upload_attempts(), 0);
    }

    #[tokio::test]
    async fn test_held_buffer_is_not_evicted() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 8, 8);
        let chunk = uploaded_chunk(&backend, b"..........");

        let first = cache.get(&chunk).await.unwrap();
        let entry = cache.inner.entries.get(&chunk.id()).unwrap().value().clone();
        assert!(!cache.inner.evict(entry).await);

        let second = cache.get(&chunk).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        first.write(0, b"A");
        cache.touch(&chunk, &first).await.unwrap();
        second.write(5, b"B");
        cache.touch(&chunk, &second).await.unwrap();
        drop(first);
        drop(second);

        assert_eq!(cache.flush().await.unwrap(), 1);
        let blob = chunk.remote_blob_id().unwrap();
        assert_eq!(&backend.get(&blob).unwrap()[..], b"A....B....");

        // nobody holds it any more
        let entry = cache.inner.entries.get(&chunk.id()).unwrap().value().clone();
        assert!(cache.inner.evict(entry).await);
        assert!(cache.peek(&chunk).is_none());
    }

    #[tokio::test]
    async fn test_touch_keeps_dirty_buffer_of_other_writer() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 8, 8);
        let chunk = Arc::new(FileChunk::new());
        let current = cache.get(&chunk).await.unwrap();
        current.write(0, b"kept");

        let stray = Arc::new(CachedChunk::empty(16));
        stray.write(0, b"lost");
        cache.touch(&chunk, &stray).await.unwrap();
        assert!(Arc::ptr_eq(&cache.peek(&chunk).unwrap(), &current));
    }

    #[tokio::test]
    async fn test_get_waits_for_a_free_slot() {
        let backend = Arc::new(MemoryBackend::new(16));
        let cache = cache(&backend, 2, 2);

        let first = Arc::new(FileChunk::new());
        let second = Arc::new(FileChunk::new());
        let mut held = Vec::new();
        for chunk in [&first, &second] {
            let cached = cache.get(chunk).await.unwrap();
            cached.write(0, b"full");
            chunk.grow_to(4);
            cache.touch(chunk, &cached).await.unwrap();
            held.push(cached);
        }
        assert_eq!(cache.available_slots(), 0);

        let remote_chunk = uploaded_chunk(&backend, b"remote");
        let attempt = tokio::time::timeout(Duration::from_millis(50), cache.get(&remote_chunk)).await;
        assert!(attempt.is_err(), "get must wait while the cache is full");

        cache.drop_chunk(&first);
        let cached = tokio::time::timeout(Duration::from_secs(1), cache.get(&remote_chunk))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.size(), 6);
        assert_eq!(backend.downloads(), 1);
    }
}
