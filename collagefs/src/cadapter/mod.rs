//! Remote blob adapter (cAdapter)
//!
//! Submodules:
//! - `client`: the `BlobBackend` trait and the queued `RemoteClient`
//! - `queue`: two-lane priority queue feeding the worker pools
//! - `retry`: retry policy and backoff loop
//! - `error`: transport and client errors
//! - `localfs`: blobs as files in a local directory
//! - `s3`: S3-compatible backend
//! - `memory`: in-memory backend with call counters and fault injection
pub mod client;
pub mod error;
pub mod localfs;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod s3;
