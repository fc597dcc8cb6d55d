//! Index persistence: load at startup, periodic flush-then-save, final save
//! on shutdown.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chuck::cache::{ChunkCache, FlushError};
use crate::meta::DirectoryIndex;
use crate::meta::record::{IndexSnapshot, RecordError};
use crate::vfs::Credentials;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("index file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed index file {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("cache flush failed, index not written: {0}")]
    Flush(#[from] FlushError),
    #[error("{} file(s) reference chunks that never reached the remote", .0.len())]
    Integrity(Vec<String>),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of reading the index file at startup.
pub struct LoadedIndex {
    pub index: DirectoryIndex,
    /// No index file existed; an empty root was created.
    pub created: bool,
}

/// Reads the index file, or starts an empty tree owned by `owner` if there is none.
pub async fn load_index(path: &Path, owner: Credentials) -> Result<LoadedIndex, PersistError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "index file not found, starting with an empty filesystem");
            return Ok(LoadedIndex {
                index: DirectoryIndex::empty(owner.uid, owner.gid),
                created: true,
            });
        }
        Err(e) => return Err(io_err(path)(e)),
    };
    let snapshot: IndexSnapshot = serde_json::from_slice(&bytes).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let index = snapshot.restore()?;
    info!(path = %path.display(), nodes = index.node_count(), "index loaded");
    Ok(LoadedIndex {
        index,
        created: false,
    })
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut f = tokio::fs::File::create(&tmp).await.map_err(io_err(&tmp))?;
    f.write_all(bytes).await.map_err(io_err(&tmp))?;
    f.flush().await.map_err(io_err(&tmp))?;
    f.sync_all().await.map_err(io_err(&tmp))?;
    drop(f);
    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))
}

pub struct PersistenceManager {
    index: Arc<DirectoryIndex>,
    cache: ChunkCache,
    index_file: PathBuf,
    save_interval: Duration,
    save_lock: Mutex<()>,
}

impl PersistenceManager {
    pub fn new(
        index: Arc<DirectoryIndex>,
        cache: ChunkCache,
        index_file: PathBuf,
        save_interval: Duration,
    ) -> Self {
        Self {
            index,
            cache,
            index_file,
            save_interval,
            save_lock: Mutex::new(()),
        }
    }

    /// Flushes the chunk cache, then writes the index. The index is only
    /// written when every dirty chunk reached the remote.
    pub async fn save(&self) -> Result<(), PersistError> {
        let _guard = self.save_lock.lock().await;
        info!("flushing chunk cache");
        let uploaded = self.cache.flush().await?;
        let snapshot = IndexSnapshot::capture(&self.index);
        let bytes = serde_json::to_vec(&snapshot).map_err(|source| PersistError::Json {
            path: self.index_file.clone(),
            source,
        })?;
        write_atomic(&self.index_file, &bytes).await?;
        info!(path = %self.index_file.display(), uploaded, bytes = bytes.len(), "index saved");
        Ok(())
    }

    /// Saves every interval until `shutdown` fires, then saves one last time.
    pub async fn run(&self, shutdown: CancellationToken, save_immediately: bool) {
        if save_immediately {
            if let Err(e) = self.save().await {
                error!(error = %e, "initial save failed");
            }
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.save_interval) => {
                    if let Err(e) = self.save().await {
                        error!(error = %e, "periodic save failed, will retry next cycle");
                    }
                }
            }
        }
        info!("shutdown requested, saving final state");
        if let Err(e) = self.save().await {
            error!(error = %e, "final save failed, state on disk may be stale");
        }
    }
}
