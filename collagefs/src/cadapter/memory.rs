//! In-memory blob backend for tests and local experiments.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use super::client::{BlobBackend, BlobId};
use super::error::TransportError;

#[derive(Default)]
struct Faults {
    uploads: Vec<TransportError>,
    downloads: Vec<TransportError>,
}

/// Keeps blobs in a map and counts calls. Failures can be scripted with
/// `fail_next_uploads` / `fail_next_downloads`.
pub struct MemoryBackend {
    blobs: DashMap<BlobId, Bytes>,
    max_chunk_size: u64,
    latency: Option<Duration>,
    faults: Mutex<Faults>,
    upload_attempts: AtomicUsize,
    download_attempts: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(max_chunk_size: u64) -> Self {
        Self {
            blobs: DashMap::new(),
            max_chunk_size,
            latency: None,
            faults: Mutex::new(Faults::default()),
            upload_attempts: AtomicUsize::new(0),
            download_attempts: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Stores a blob directly, bypassing counters.
    pub fn insert(&self, data: Bytes) -> BlobId {
        let id = Uuid::new_v4().simple().to_string();
        self.blobs.insert(id.clone(), data);
        id
    }

    pub fn get(&self, blob_id: &str) -> Option<Bytes> {
        self.blobs.get(blob_id).map(|b| b.value().clone())
    }

    pub fn contains(&self, blob_id: &str) -> bool {
        self.blobs.contains_key(blob_id)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn fail_next_uploads(&self, count: usize, err: TransportError) {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        faults.uploads.extend(std::iter::repeat_n(err, count));
    }

    pub fn fail_next_downloads(&self, count: usize, err: TransportError) {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        faults.downloads.extend(std::iter::repeat_n(err, count));
    }

    /// Successful uploads.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Successful downloads.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn upload_attempts(&self) -> usize {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    pub fn download_attempts(&self) -> usize {
        self.download_attempts.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn scripted_failure(&self, upload: bool) -> Option<TransportError> {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        let queue = if upload {
            &mut faults.uploads
        } else {
            &mut faults.downloads
        };
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn upload(&self, _name: &str, data: Bytes) -> Result<BlobId, TransportError> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        if let Some(err) = self.scripted_failure(true) {
            return Err(err);
        }
        if data.len() as u64 > self.max_chunk_size {
            return Err(TransportError::Fatal(format!(
                "blob of {} bytes exceeds limit {}",
                data.len(),
                self.max_chunk_size
            )));
        }
        let id = self.insert(data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn download(&self, blob_id: &str) -> Result<Bytes, TransportError> {
        self.download_attempts.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        if let Some(err) = self.scripted_failure(false) {
            return Err(err);
        }
        let data = self
            .get(blob_id)
            .ok_or_else(|| TransportError::Fatal(format!("no such blob: {blob_id}")))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }
}
