//! 本地文件目录后端：每个 blob 存为 root 下的一个文件。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use super::client::{BlobBackend, BlobId};
use super::error::TransportError;

pub struct LocalFsBackend {
    root: PathBuf,
    max_chunk_size: u64,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P, max_chunk_size: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_chunk_size,
        }
    }

    // blob id 为 32 位十六进制；按前两位分目录
    fn path_for(&self, blob_id: &str) -> Result<PathBuf, TransportError> {
        let valid = blob_id.len() == 32 && blob_id.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(TransportError::Fatal(format!("malformed blob id {blob_id:?}")));
        }
        Ok(self.root.join(&blob_id[..2]).join(blob_id))
    }
}

#[async_trait]
impl BlobBackend for LocalFsBackend {
    async fn upload(&self, _name: &str, data: Bytes) -> Result<BlobId, TransportError> {
        if data.len() as u64 > self.max_chunk_size {
            return Err(TransportError::Fatal(format!(
                "blob of {} bytes exceeds limit {}",
                data.len(),
                self.max_chunk_size
            )));
        }
        let blob_id = Uuid::new_v4().simple().to_string();
        let path = self.path_for(&blob_id)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("part");
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        f.sync_all().await?;
        drop(f);
        fs::rename(&tmp, &path).await?;
        Ok(blob_id)
    }

    async fn download(&self, blob_id: &str) -> Result<Bytes, TransportError> {
        let path = self.path_for(blob_id)?;
        let buf = fs::read(path).await?;
        Ok(Bytes::from(buf))
    }

    fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path(), 1024);

        let id = backend.upload("chunk", Bytes::from_static(b"abc")).await.unwrap();
        let got = backend.download(&id).await.unwrap();
        assert_eq!(&got[..], b"abc");
        assert!(dir.path().join(&id[..2]).join(&id).exists());
    }

    #[tokio::test]
    async fn test_missing_and_malformed_ids_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path(), 1024);

        let missing = Uuid::new_v4().simple().to_string();
        assert!(!backend.download(&missing).await.unwrap_err().is_retriable());
        assert!(!backend.download("../etc/passwd").await.unwrap_err().is_retriable());
    }

    #[tokio::test]
    async fn test_rejects_oversized_blob() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path(), 2);
        let err = backend.upload("chunk", Bytes::from_static(b"abc")).await.unwrap_err();
        assert!(matches!(err, TransportError::Fatal(_)));
    }
}
