//! Chunk 布局与文件块元数据。
//!
//! A file's bytes are stored as a sequence of fixed-capacity chunks. Chunk `i`
//! covers file bytes `[i*M, (i+1)*M)` where `M` is the backend's maximum chunk
//! size. Only the last chunk of a file may be partially filled.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Instant;

use uuid::Uuid;

use crate::cadapter::client::BlobId;

/// Default chunk capacity: 20 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

/// 布局参数：每个 chunk 的最大字节数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub max_chunk_size: u64,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// How to cut the chunk list of a file shrunk to a non-zero size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkPlan {
    /// Index of the chunk that becomes the file's last one.
    pub last_chunk_index: u64,
    /// Valid byte count of that chunk after the shrink.
    pub last_chunk_len: u64,
}

impl ChunkLayout {
    pub fn new(max_chunk_size: u64) -> Self {
        debug_assert!(max_chunk_size > 0, "chunk size must be positive");
        Self { max_chunk_size }
    }

    #[inline]
    pub fn chunk_index_of(&self, file_offset: u64) -> u64 {
        file_offset / self.max_chunk_size
    }

    #[inline]
    pub fn within_chunk_offset(&self, file_offset: u64) -> u64 {
        file_offset % self.max_chunk_size
    }

    /// Inclusive range of chunk indices touched by `[offset, offset+len)`.
    /// Empty ranges touch nothing.
    pub fn chunk_range(&self, offset: u64, len: u64) -> Option<RangeInclusive<u64>> {
        if len == 0 {
            return None;
        }
        let first = self.chunk_index_of(offset);
        let end_exclusive = (offset + len).div_ceil(self.max_chunk_size);
        Some(first..=end_exclusive - 1)
    }

    /// Number of chunks a file of `size` bytes needs.
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.max_chunk_size)
    }

    /// 截断到 `new_size` 后保留的最后一个 chunk；`new_size == 0` 时没有 chunk 保留。
    pub fn shrink_plan(&self, new_size: u64) -> Option<ShrinkPlan> {
        if new_size == 0 {
            return None;
        }
        let last_chunk_index = (new_size - 1) / self.max_chunk_size;
        let rem = new_size % self.max_chunk_size;
        let last_chunk_len = if rem == 0 { self.max_chunk_size } else { rem };
        Some(ShrinkPlan {
            last_chunk_index,
            last_chunk_len,
        })
    }
}

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds on a process-wide monotonic clock.
pub fn monotonic_micros() -> u64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Descriptor of one chunk of a file.
///
/// `remote_blob_id` is `None` until the chunk's data reaches the remote store
/// for the first time; every later upload replaces it with the new blob's id.
/// `last_use` is runtime-only recency information for eviction.
#[derive(Debug)]
pub struct FileChunk {
    id: Uuid,
    remote_blob_id: RwLock<Option<BlobId>>,
    size: AtomicUsize,
    last_use: AtomicU64,
    // 已从文件中移除：缓存不再收留它的数据
    dropped: AtomicBool,
}

impl FileChunk {
    pub fn new() -> Self {
        Self::restore(Uuid::new_v4(), None, 0)
    }

    /// Rebuilds a chunk from its persisted form.
    pub fn restore(id: Uuid, remote_blob_id: Option<BlobId>, size: usize) -> Self {
        Self {
            id,
            remote_blob_id: RwLock::new(remote_blob_id),
            size: AtomicUsize::new(size),
            last_use: AtomicU64::new(monotonic_micros()),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_blob_id(&self) -> Option<BlobId> {
        self.remote_blob_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_remote_blob_id(&self, blob_id: BlobId) {
        *self
            .remote_blob_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(blob_id);
    }

    pub fn is_uploaded(&self) -> bool {
        self.remote_blob_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    /// Raises the size to at least `size`.
    pub fn grow_to(&self, size: usize) {
        self.size.fetch_max(size, Ordering::AcqRel);
    }

    pub fn last_use(&self) -> u64 {
        self.last_use.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_use.store(monotonic_micros(), Ordering::Relaxed);
    }

    /// Marks the chunk as no longer part of any file.
    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

impl Default for FileChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for FileChunk {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FileChunk {}

impl std::hash::Hash for FileChunk {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
