//! Errors raised by blob backends and the remote client.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Outcome of a single failed backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    TimedOut,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("transient server error: {0}")]
    Server(String),
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    /// Rate limits, timeouts, connection drops and transient server errors
    /// are worth another attempt. Everything else fails immediately.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, TransportError::Fatal(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            TimedOut => TransportError::TimedOut,
            NotFound | PermissionDenied | InvalidInput | InvalidData | Unsupported | AlreadyExists => {
                TransportError::Fatal(e.to_string())
            }
            _ => TransportError::Connection(e.to_string()),
        }
    }
}

/// Which side of the remote client an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobOp {
    Download,
    Upload,
}

impl fmt::Display for BlobOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobOp::Download => f.write_str("download"),
            BlobOp::Upload => f.write_str("upload"),
        }
    }
}

/// Final outcome of a queued download or upload, after retries.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("{op} of chunk {chunk} failed: {source}")]
    Fatal {
        op: BlobOp,
        chunk: Uuid,
        #[source]
        source: TransportError,
    },
    #[error("{op} of chunk {chunk} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: BlobOp,
        chunk: Uuid,
        attempts: u32,
        last: TransportError,
    },
    #[error("{op} of chunk {chunk} not attempted, attempt limit is 0")]
    NoAttempts { op: BlobOp, chunk: Uuid },
    #[error("chunk {0} has no remote blob")]
    NotUploaded(Uuid),
    #[error("remote client is shut down")]
    Shutdown,
    #[error("operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(TransportError::TimedOut.is_retriable());
        assert!(TransportError::Server("502".into()).is_retriable());
        assert!(TransportError::RateLimited { retry_after: None }.is_retriable());
        assert!(!TransportError::Fatal("bad request".into()).is_retriable());
    }

    #[test]
    fn test_io_error_mapping() {
        let e: TransportError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(!e.is_retriable());
        let e: TransportError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(e.is_retriable());
        let e: TransportError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(e.is_retriable());
    }
}
