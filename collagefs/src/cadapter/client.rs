//! Remote blob client.
//!
//! Downloads and uploads are queued and executed by fixed-size worker pools,
//! so the number of simultaneous backend requests never exceeds the
//! configured worker counts. Callers await a oneshot reply.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{BlobError, BlobOp, TransportError};
use super::queue::{Priority, PriorityQueue};
use super::retry::{RetryPolicy, execute_with_retry};
use crate::chuck::chunk::FileChunk;

/// Opaque identifier the remote assigns to an uploaded blob.
pub type BlobId = String;

/// A store of immutable blobs. Each upload creates a new blob.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Stores `data` and returns the id of the new blob. `name` is a hint
    /// only; backends may ignore it.
    async fn upload(&self, name: &str, data: Bytes) -> Result<BlobId, TransportError>;

    async fn download(&self, blob_id: &str) -> Result<Bytes, TransportError>;

    /// Largest blob the backend accepts. Fixes the chunk size of the filesystem.
    fn max_chunk_size(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub download_workers: usize,
    pub upload_workers: usize,
    pub download_retry: RetryPolicy,
    pub upload_retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_workers: 3,
            upload_workers: 2,
            download_retry: RetryPolicy::default(),
            upload_retry: RetryPolicy {
                max_attempts: None,
                ..RetryPolicy::default()
            },
        }
    }
}

struct DownloadJob {
    chunk: Uuid,
    blob_id: BlobId,
    reply: oneshot::Sender<Result<Bytes, BlobError>>,
}

struct UploadJob {
    chunk: Uuid,
    data: Bytes,
    reply: oneshot::Sender<Result<BlobId, BlobError>>,
}

pub struct RemoteClient {
    downloads: Arc<PriorityQueue<DownloadJob>>,
    uploads: Arc<PriorityQueue<UploadJob>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_chunk_size: u64,
}

impl RemoteClient {
    /// Spawns the worker pools. Must be called from inside a tokio runtime.
    pub fn start(backend: Arc<dyn BlobBackend>, config: ClientConfig) -> Self {
        let downloads = Arc::new(PriorityQueue::new());
        let uploads = Arc::new(PriorityQueue::new());
        let mut workers = Vec::with_capacity(config.download_workers + config.upload_workers);

        for worker_id in 0..config.download_workers {
            workers.push(tokio::spawn(download_worker(
                worker_id,
                backend.clone(),
                downloads.clone(),
                config.download_retry,
            )));
        }
        for worker_id in 0..config.upload_workers {
            workers.push(tokio::spawn(upload_worker(
                worker_id,
                backend.clone(),
                uploads.clone(),
                config.upload_retry,
            )));
        }
        info!(
            download_workers = config.download_workers,
            upload_workers = config.upload_workers,
            "remote client started"
        );

        Self {
            downloads,
            uploads,
            workers: Mutex::new(workers),
            max_chunk_size: backend.max_chunk_size(),
        }
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    /// Fetches the current remote contents of `chunk`.
    pub async fn download(&self, chunk: &FileChunk, priority: Priority) -> Result<Bytes, BlobError> {
        let blob_id = chunk
            .remote_blob_id()
            .ok_or(BlobError::NotUploaded(chunk.id()))?;
        let (reply, rx) = oneshot::channel();
        let job = DownloadJob {
            chunk: chunk.id(),
            blob_id,
            reply,
        };
        self.downloads
            .push(priority, job)
            .map_err(|_| BlobError::Shutdown)?;
        rx.await.map_err(|_| BlobError::Shutdown)?
    }

    /// Uploads `data` as a new blob for `chunk` and returns its id. The
    /// chunk's recorded blob id is left for the caller to update.
    pub async fn upload(&self, chunk: &FileChunk, data: Bytes) -> Result<BlobId, BlobError> {
        let (reply, rx) = oneshot::channel();
        let job = UploadJob {
            chunk: chunk.id(),
            data,
            reply,
        };
        self.uploads
            .push(Priority::High, job)
            .map_err(|_| BlobError::Shutdown)?;
        rx.await.map_err(|_| BlobError::Shutdown)?
    }

    /// Stops accepting work, lets workers finish what is queued and waits for them.
    pub async fn shutdown(&self) {
        self.downloads.close();
        self.uploads.close();
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            let _ = worker.await;
        }
        info!("remote client stopped");
    }
}

async fn download_worker(
    worker_id: usize,
    backend: Arc<dyn BlobBackend>,
    queue: Arc<PriorityQueue<DownloadJob>>,
    policy: RetryPolicy,
) {
    while let Some(job) = queue.pop().await {
        if job.reply.is_closed() {
            debug!(worker_id, chunk = %job.chunk, "download no longer wanted, skipping");
            continue;
        }
        debug!(worker_id, chunk = %job.chunk, blob = %job.blob_id, "downloading chunk");
        let backend = &*backend;
        let blob_id = job.blob_id.as_str();
        let result = execute_with_retry(&policy, BlobOp::Download, job.chunk, move || {
            backend.download(blob_id)
        })
        .await;
        if let Ok(data) = &result {
            debug!(worker_id, chunk = %job.chunk, bytes = data.len(), "downloaded chunk");
        }
        let _ = job.reply.send(result);
    }
    debug!(worker_id, "download worker exiting");
}

async fn upload_worker(
    worker_id: usize,
    backend: Arc<dyn BlobBackend>,
    queue: Arc<PriorityQueue<UploadJob>>,
    policy: RetryPolicy,
) {
    while let Some(job) = queue.pop().await {
        debug!(worker_id, chunk = %job.chunk, bytes = job.data.len(), "uploading chunk");
        let backend = &*backend;
        let name = job.chunk.to_string();
        let name = name.as_str();
        let data = &job.data;
        let result = execute_with_retry(&policy, BlobOp::Upload, job.chunk, move || {
            backend.upload(name, data.clone())
        })
        .await;
        if let Ok(blob_id) = &result {
            debug!(worker_id, chunk = %job.chunk, blob = %blob_id, "uploaded chunk");
        }
        let _ = job.reply.send(result);
    }
    debug!(worker_id, "upload worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryBackend;
    use std::time::Duration;

    fn fast_config(download_workers: usize) -> ClientConfig {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Some(Duration::from_secs(5)),
        };
        ClientConfig {
            download_workers,
            upload_workers: 1,
            download_retry: policy,
            upload_retry: policy,
        }
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let backend = Arc::new(MemoryBackend::new(64));
        let client = RemoteClient::start(backend.clone(), fast_config(2));
        let chunk = FileChunk::new();

        let blob_id = client.upload(&chunk, Bytes::from_static(b"hello")).await.unwrap();
        assert!(chunk.remote_blob_id().is_none());
        chunk.set_remote_blob_id(blob_id);

        let data = client.download(&chunk, Priority::High).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(backend.uploads(), 1);
        assert_eq!(backend.downloads(), 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_without_blob_fails_fast() {
        let backend = Arc::new(MemoryBackend::new(64));
        let client = RemoteClient::start(backend.clone(), fast_config(1));
        let err = client.download(&FileChunk::new(), Priority::High).await.unwrap_err();
        assert!(matches!(err, BlobError::NotUploaded(_)));
        assert_eq!(backend.downloads(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = Arc::new(MemoryBackend::new(64));
        let client = RemoteClient::start(backend.clone(), fast_config(1));
        backend.fail_next_uploads(2, TransportError::Server("502 bad gateway".into()));

        let blob_id = client.upload(&FileChunk::new(), Bytes::from_static(b"x")).await.unwrap();
        assert!(backend.contains(&blob_id));
        assert_eq!(backend.upload_attempts(), 3);
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let backend = Arc::new(MemoryBackend::new(64).with_latency(Duration::from_millis(20)));
        let client = Arc::new(RemoteClient::start(backend.clone(), fast_config(2)));

        let mut chunks = Vec::new();
        for i in 0..6u8 {
            let chunk = Arc::new(FileChunk::new());
            chunk.set_remote_blob_id(backend.insert(Bytes::from(vec![i; 4])));
            chunks.push(chunk);
        }
        let tasks: Vec<_> = chunks
            .iter()
            .map(|chunk| {
                let client = client.clone();
                let chunk = chunk.clone();
                tokio::spawn(async move { client.download(&chunk, Priority::High).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(backend.downloads(), 6);
        assert!(backend.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let backend = Arc::new(MemoryBackend::new(64));
        let client = RemoteClient::start(backend, fast_config(1));
        client.shutdown().await;
        let err = client
            .upload(&FileChunk::new(), Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Shutdown));
    }
}
