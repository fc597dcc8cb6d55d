//! Chunk management (chuck)
//!
//! Responsibilities:
//! - Map file byte ranges onto fixed-capacity chunks.
//! - Describe each chunk of a file (`FileChunk`): identity, remote blob id,
//!   valid size and recency.
//! - Hold chunk contents in memory (`CachedChunk`) behind a bounded cache
//!   that fetches from and writes back to the remote blob store.
//!
//! Submodules:
//! - `chunk`: chunk layout arithmetic and `FileChunk`
//! - `util`: splitting file ranges into per-chunk spans
//! - `buffer`: in-memory chunk buffer with dirty/upload state
//! - `cache`: the chunk cache (single-flight fetch, soft/hard limits, flush)
pub mod buffer;
pub mod cache;
pub mod chunk;
pub mod util;
