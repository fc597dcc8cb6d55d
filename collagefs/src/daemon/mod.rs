//! Daemon lifecycle
//!
//! Responsibilities:
//! - Load the directory index at startup and check it for files whose
//!   chunks never reached the remote.
//! - Wire the remote client, chunk cache and filesystem together.
//! - Run the periodic save loop and the final save on shutdown.
//!
//! Submodules:
//! - `persist`: index load/save and the save loop
//! - `integrity`: startup check for broken files
//! - `signal`: interrupt escalation
pub mod integrity;
pub mod persist;
pub mod signal;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cadapter::client::{BlobBackend, ClientConfig, RemoteClient};
use crate::chuck::cache::{CacheConfig, ChunkCache};
use crate::vfs::{CollageFs, Credentials};
use integrity::{BrokenFilePolicy, IntegrityReport};
use persist::{PersistError, PersistenceManager};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cache: CacheConfig,
    pub client: ClientConfig,
    pub prefetch_chunks: usize,
    pub index_file: PathBuf,
    pub save_interval: Duration,
    /// Owner of the root directory when no index exists yet.
    pub owner: Credentials,
}

/// A running filesystem: index, cache, remote workers and the save loop.
pub struct Engine {
    fs: Arc<CollageFs>,
    remote: Arc<RemoteClient>,
    persistence: Arc<PersistenceManager>,
    created: bool,
}

impl Engine {
    /// Loads the index and starts the remote workers. Must run inside a
    /// tokio runtime.
    pub async fn start(backend: Arc<dyn BlobBackend>, options: EngineOptions) -> Result<Self, PersistError> {
        let loaded = persist::load_index(&options.index_file, options.owner).await?;
        let index = Arc::new(loaded.index);
        let remote = Arc::new(RemoteClient::start(backend, options.client));
        let cache = ChunkCache::new(remote.clone(), options.cache);
        let fs = Arc::new(CollageFs::new(index.clone(), cache.clone(), options.prefetch_chunks));
        let persistence = Arc::new(PersistenceManager::new(
            index,
            cache,
            options.index_file,
            options.save_interval,
        ));
        info!(
            chunk_size = fs.layout().max_chunk_size,
            soft_limit = options.cache.soft_limit,
            hard_limit = options.cache.hard_limit,
            "engine started"
        );
        Ok(Self {
            fs,
            remote,
            persistence,
            created: loaded.created,
        })
    }

    pub fn fs(&self) -> &Arc<CollageFs> {
        &self.fs
    }

    /// True when the index file did not exist at startup.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn integrity_report(&self) -> IntegrityReport {
        integrity::check_integrity(self.fs.index())
    }

    /// Runs the startup check and applies `policy` to what it finds.
    pub fn check(&self, policy: BrokenFilePolicy) -> Result<IntegrityReport, PersistError> {
        let report = self.integrity_report();
        integrity::apply_policy(self.fs.index(), &report, policy)?;
        Ok(report)
    }

    pub async fn save(&self) -> Result<(), PersistError> {
        self.persistence.save().await
    }

    /// Runs the save loop until `shutdown` fires; the final save happens
    /// before this returns.
    pub async fn run_until(&self, shutdown: CancellationToken) {
        self.persistence.run(shutdown, self.created).await;
    }

    /// Final save, then stops the remote workers.
    pub async fn shutdown(self) -> Result<(), PersistError> {
        let saved = self.persistence.save().await;
        self.remote.shutdown().await;
        info!("engine stopped");
        saved
    }
}
