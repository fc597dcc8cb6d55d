//! In-memory buffer of one chunk.
//!
//! The buffer is allocated at full chunk capacity; `size` is the number of
//! valid bytes. `dirty` means the buffer holds writes the remote has not seen.
//! While an upload runs, `uploading` is set and the dirty flag has already
//! been cleared, so a write racing the upload marks the chunk dirty again.

use std::pin::pin;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::Notify;
use uuid::Uuid;

struct ChunkData {
    bytes: Vec<u8>,
    size: usize,
}

pub struct CachedChunk {
    // 仅用于日志
    id: Uuid,
    data: RwLock<ChunkData>,
    dirty: AtomicBool,
    uploading: AtomicBool,
    idle: Notify,
}

impl CachedChunk {
    pub fn empty(capacity: usize) -> Self {
        Self::with_data(vec![0; capacity], 0)
    }

    /// Builds a buffer from downloaded blob contents. `size` comes from the
    /// chunk descriptor; bytes past the blob's end read as zero.
    pub fn from_remote(blob: &[u8], capacity: usize, size: usize) -> Self {
        let mut bytes = vec![0; capacity];
        let n = blob.len().min(capacity);
        bytes[..n].copy_from_slice(&blob[..n]);
        Self::with_data(bytes, size.min(capacity))
    }

    fn with_data(bytes: Vec<u8>, size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            data: RwLock::new(ChunkData { bytes, size }),
            dirty: AtomicBool::new(false),
            uploading: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    fn read_data(&self) -> std::sync::RwLockReadGuard<'_, ChunkData> {
        self.data.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_data(&self) -> std::sync::RwLockWriteGuard<'_, ChunkData> {
        self.data.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn size(&self) -> usize {
        self.read_data().size
    }

    pub fn capacity(&self) -> usize {
        self.read_data().bytes.len()
    }

    /// Appends bytes `[start, end)` of the buffer to `out`.
    pub fn read_into(&self, start: usize, end: usize, out: &mut Vec<u8>) {
        let data = self.read_data();
        out.extend_from_slice(&data.bytes[start..end]);
    }

    /// Copies `src` to `offset` and marks the chunk dirty.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let mut data = self.write_data();
        let end = offset + src.len();
        data.bytes[offset..end].copy_from_slice(src);
        data.size = data.size.max(end);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Zeroes `[start, end)`, extends the valid size to `end` and marks the
    /// chunk dirty.
    pub fn zero_fill(&self, start: usize, end: usize) {
        let mut data = self.write_data();
        data.bytes[start..end].fill(0);
        data.size = data.size.max(end);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Shrinks the valid size. Bytes past it keep their old values until a
    /// later grow zeroes them.
    pub fn truncate(&self, size: usize) {
        let mut data = self.write_data();
        data.size = data.size.min(size);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::SeqCst)
    }

    /// Neither dirty nor being uploaded.
    pub fn is_clean(&self) -> bool {
        !self.is_uploading() && !self.is_dirty()
    }

    /// Claims the upload of a dirty chunk. Returns a snapshot of the valid
    /// bytes, or `None` when the chunk is clean or another upload holds the claim.
    pub fn begin_upload(&self) -> Option<Bytes> {
        if self
            .uploading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let data = self.read_data();
        if !self.dirty.swap(false, Ordering::SeqCst) {
            drop(data);
            self.release_upload();
            return None;
        }
        Some(Bytes::copy_from_slice(&data.bytes[..data.size]))
    }

    /// Ends an upload claimed with `begin_upload`. A failed upload leaves the
    /// chunk dirty again.
    pub fn finish_upload(&self, succeeded: bool) {
        if !succeeded {
            self.dirty.store(true, Ordering::SeqCst);
        }
        self.release_upload();
    }

    fn release_upload(&self) {
        self.uploading.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    /// Waits until no upload is running.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if !self.is_uploading() {
                return;
            }
            notified.await;
        }
    }
}
