//! 配置文件：JSON，所有字段都有默认值。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cadapter::client::{BlobBackend, ClientConfig};
use crate::cadapter::localfs::LocalFsBackend;
use crate::cadapter::retry::RetryPolicy;
use crate::cadapter::s3::{S3Backend, S3Config};
use crate::chuck::cache::CacheConfig;
use crate::chuck::chunk::DEFAULT_MAX_CHUNK_SIZE;
use crate::daemon::EngineOptions;
use crate::vfs::Credentials;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where chunk blobs live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    LocalFs {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default = "default_region")]
        region: String,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("collagefs")
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::LocalFs {
            root: data_dir().join("blobs"),
        }
    }
}

impl BackendConfig {
    pub async fn connect(&self, max_chunk_size: u64) -> Arc<dyn BlobBackend> {
        match self {
            BackendConfig::LocalFs { root } => {
                info!(root = %root.display(), "using local blob directory");
                Arc::new(LocalFsBackend::new(root, max_chunk_size))
            }
            BackendConfig::S3 {
                bucket,
                endpoint,
                region,
            } => {
                let config = S3Config {
                    bucket: bucket.clone(),
                    endpoint: endpoint.clone(),
                    region: region.clone(),
                    max_chunk_size,
                    ..S3Config::default()
                };
                Arc::new(S3Backend::new(config).await)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index_file: PathBuf,
    pub save_interval_ms: u64,
    pub cache_soft_limit_chunks: usize,
    pub cache_hard_limit_chunks: usize,
    pub prefetch_chunks: usize,
    pub simultaneous_evictions: usize,
    pub max_chunk_size: u64,
    pub download_workers: usize,
    pub upload_workers: usize,
    /// Total attempts per download, the first one included; 0 never tries.
    pub download_retries: i32,
    /// Same as `download_retries`; -1 = unlimited
    pub upload_retries: i32,
    pub request_timeout_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Interrupts needed to force an exit while the final save runs.
    pub shutdown_signal_threshold: usize,
    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_file: data_dir().join("index.json"),
            save_interval_ms: 60_000,
            cache_soft_limit_chunks: 50,
            cache_hard_limit_chunks: 200,
            prefetch_chunks: 3,
            simultaneous_evictions: 5,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            download_workers: 3,
            upload_workers: 2,
            download_retries: 5,
            upload_retries: -1,
            request_timeout_ms: 120_000,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            shutdown_signal_threshold: 3,
            backend: BackendConfig::default(),
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("collagefs")
            .join("config.json")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_soft_limit_chunks > self.cache_hard_limit_chunks {
            return Err(ConfigError::Invalid(format!(
                "cache_soft_limit_chunks ({}) exceeds cache_hard_limit_chunks ({})",
                self.cache_soft_limit_chunks, self.cache_hard_limit_chunks
            )));
        }
        if self.cache_hard_limit_chunks == 0 {
            return Err(ConfigError::Invalid("cache_hard_limit_chunks must be positive".into()));
        }
        if self.download_workers == 0 || self.upload_workers == 0 {
            return Err(ConfigError::Invalid("worker counts must be positive".into()));
        }
        if self.max_chunk_size == 0 {
            return Err(ConfigError::Invalid("max_chunk_size must be positive".into()));
        }
        if self.download_retries < -1 || self.upload_retries < -1 {
            return Err(ConfigError::Invalid("retry counts must be -1 or more".into()));
        }
        Ok(())
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            soft_limit: self.cache_soft_limit_chunks,
            hard_limit: self.cache_hard_limit_chunks,
            simultaneous_evictions: self.simultaneous_evictions.max(1),
        }
    }

    fn retry_policy(&self, retries: i32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: RetryPolicy::attempts_from_config(retries),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            attempt_timeout: (self.request_timeout_ms > 0)
                .then(|| Duration::from_millis(self.request_timeout_ms)),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            download_workers: self.download_workers,
            upload_workers: self.upload_workers,
            download_retry: self.retry_policy(self.download_retries),
            upload_retry: self.retry_policy(self.upload_retries),
        }
    }

    pub fn engine_options(&self, owner: Credentials) -> EngineOptions {
        EngineOptions {
            cache: self.cache_config(),
            client: self.client_config(),
            prefetch_chunks: self.prefetch_chunks,
            index_file: self.index_file.clone(),
            save_interval: self.save_interval(),
            owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.client_config().upload_retry.max_attempts, None);
        assert_eq!(config.client_config().download_retry.max_attempts, Some(5));
    }

    #[test]
    fn test_retry_counts_are_total_attempts() {
        let config = Config {
            download_retries: 1,
            upload_retries: 0,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        let client = config.client_config();
        assert_eq!(client.download_retry.max_attempts, Some(1));
        assert_eq!(client.upload_retry.max_attempts, Some(0));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "cache_soft_limit_chunks": 4,
                "cache_hard_limit_chunks": 8,
                "backend": { "kind": "s3", "bucket": "b", "endpoint": "http://127.0.0.1:9000" }
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache_config().soft_limit, 4);
        assert_eq!(config.cache_config().hard_limit, 8);
        assert_eq!(config.upload_workers, 2);
        assert_eq!(
            config.backend,
            BackendConfig::S3 {
                bucket: "b".into(),
                endpoint: Some("http://127.0.0.1:9000".into()),
                region: "us-east-1".into(),
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            Config {
                cache_soft_limit_chunks: 10,
                cache_hard_limit_chunks: 5,
                ..Config::default()
            },
            Config {
                upload_workers: 0,
                ..Config::default()
            },
            Config {
                max_chunk_size: 0,
                ..Config::default()
            },
            Config {
                download_retries: -2,
                ..Config::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
