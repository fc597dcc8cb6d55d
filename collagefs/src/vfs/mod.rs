//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Implement POSIX-style path operations on top of the directory index and
//!   the chunk cache.
//! - Translate failures into `VfsError`, which carries the errno a kernel
//!   adapter would return.
//!
//! Submodules:
//! - `fs`: `CollageFs`, the filesystem call surface
//! - `error`: `VfsError` and its errno mapping
pub mod error;
pub mod fs;

pub use error::VfsError;
pub use fs::{CollageFs, Credentials, DirEntry, FileAttr, FileType};
