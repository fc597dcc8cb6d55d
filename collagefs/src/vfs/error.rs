//! Errors of the filesystem call surface, each mapped to a POSIX errno.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::cadapter::error::BlobError;
use crate::meta::path::PathError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHint(Option<String>);

impl PathHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) if !path.is_empty() => write!(f, ": {path}"),
            _ => Ok(()),
        }
    }
}

impl From<&str> for PathHint {
    fn from(value: &str) -> Self {
        Self::some(value)
    }
}

impl From<String> for PathHint {
    fn from(value: String) -> Self {
        Self::some(value)
    }
}

#[derive(Error, Debug, Clone)]
pub enum VfsError {
    #[error("not found{path}")]
    NotFound { path: PathHint },

    #[error("already exists{path}")]
    AlreadyExists { path: PathHint },

    #[error("not a directory{path}")]
    NotADirectory { path: PathHint },

    #[error("is a directory{path}")]
    IsADirectory { path: PathHint },

    #[error("directory not empty{path}")]
    DirectoryNotEmpty { path: PathHint },

    #[error("invalid argument{path}")]
    InvalidArgument { path: PathHint },

    #[error("remote storage error: {0}")]
    Blob(#[from] Arc<BlobError>),
}

impl VfsError {
    pub fn not_found(path: impl Into<PathHint>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<PathHint>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn not_a_directory(path: impl Into<PathHint>) -> Self {
        Self::NotADirectory { path: path.into() }
    }

    pub fn is_a_directory(path: impl Into<PathHint>) -> Self {
        Self::IsADirectory { path: path.into() }
    }

    pub fn not_empty(path: impl Into<PathHint>) -> Self {
        Self::DirectoryNotEmpty { path: path.into() }
    }

    pub fn invalid(path: impl Into<PathHint>) -> Self {
        Self::InvalidArgument { path: path.into() }
    }

    /// POSIX error number for the kernel adapter.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound { .. } => libc::ENOENT,
            VfsError::AlreadyExists { .. } => libc::EEXIST,
            VfsError::NotADirectory { .. } => libc::ENOTDIR,
            VfsError::IsADirectory { .. } => libc::EISDIR,
            VfsError::DirectoryNotEmpty { .. } => libc::ENOTEMPTY,
            VfsError::InvalidArgument { .. } => libc::EINVAL,
            VfsError::Blob(_) => libc::EIO,
        }
    }
}

impl From<BlobError> for VfsError {
    fn from(e: BlobError) -> Self {
        VfsError::Blob(Arc::new(e))
    }
}

impl From<PathError> for VfsError {
    fn from(e: PathError) -> Self {
        match e {
            PathError::Invalid(path) => VfsError::invalid(path),
            PathError::Root => VfsError::invalid("/"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VfsError::not_found("/a").errno(), libc::ENOENT);
        assert_eq!(VfsError::not_empty("/d").errno(), libc::ENOTEMPTY);
        assert_eq!(VfsError::from(PathError::Root).errno(), libc::EINVAL);
        assert_eq!(VfsError::from(BlobError::Shutdown).errno(), libc::EIO);
    }

    #[test]
    fn test_display_carries_path() {
        assert_eq!(VfsError::is_a_directory("/d").to_string(), "is a directory: /d");
        assert_eq!(
            VfsError::NotFound { path: PathHint::none() }.to_string(),
            "not found"
        );
    }
}
