//! S3 适配器：基于 aws-sdk-s3 的 blob 后端，单次 put/get，带 MD5 校验。
//!
//! Retries are not done here; the remote client decides based on the
//! classification returned by `classify_sdk_error`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use tracing::info;
use uuid::Uuid;

use super::client::{BlobBackend, BlobId};
use super::error::TransportError;

/// S3 后端配置选项
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Custom endpoint such as a MinIO server; `None` uses AWS.
    pub endpoint: Option<String>,
    pub region: String,
    /// Object key prefix for chunk blobs.
    pub prefix: String,
    pub max_chunk_size: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "collagefs".to_string(),
            endpoint: None,
            region: "us-east-1".to_string(),
            prefix: "chunks".to_string(),
            max_chunk_size: crate::chuck::chunk::DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

pub struct S3Backend {
    client: Client,
    config: S3Config,
}

impl S3Backend {
    /// Credentials come from the standard AWS provider chain.
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint.is_some())
            .build();
        info!(bucket = %config.bucket, endpoint = ?config.endpoint, "s3 backend ready");
        Self {
            client: Client::from_conf(s3_conf),
            config,
        }
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    fn object_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.config.prefix, name, Uuid::new_v4().simple())
    }
}

/// Maps an SDK failure onto the retry taxonomy.
fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>) -> TransportError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) => TransportError::TimedOut,
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            TransportError::Connection(message)
        }
        _ => match err.raw_response().map(|r| r.status().as_u16()) {
            Some(429) => TransportError::RateLimited { retry_after: None },
            // S3 answers SlowDown with 503
            Some(503) => TransportError::RateLimited { retry_after: None },
            Some(status) if status == 408 || status >= 500 => TransportError::Server(message),
            _ => TransportError::Fatal(message),
        },
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    async fn upload(&self, name: &str, data: Bytes) -> Result<BlobId, TransportError> {
        if data.len() as u64 > self.config.max_chunk_size {
            return Err(TransportError::Fatal(format!(
                "blob of {} bytes exceeds limit {}",
                data.len(),
                self.config.max_chunk_size
            )));
        }
        let key = self.object_key(name);
        let checksum = Self::md5_base64(&data);
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(key)
    }

    async fn download(&self, blob_id: &str) -> Result<Bytes, TransportError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(blob_id)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        let body = out
            .body
            .collect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(body.into_bytes())
    }

    fn max_chunk_size(&self) -> u64 {
        self.config.max_chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_base64() {
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert_eq!(S3Backend::md5_base64(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }
}
