//! 路径工具：以 `/` 为根、`/` 分隔，不允许结尾斜杠或空路径段。

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid path {0:?}")]
    Invalid(String),
    #[error("the root directory has no parent")]
    Root,
}

pub const ROOT: &str = "/";

/// Splits an absolute path into its components. The root yields none.
pub fn components(path: &str) -> Result<Vec<&str>, PathError> {
    if path == ROOT {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PathError::Invalid(path.to_string()));
    };
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
        return Err(PathError::Invalid(path.to_string()));
    }
    Ok(parts)
}

/// `"/a/b"` -> `"/a"`, `"/a"` -> `"/"`.
pub fn parent_path(path: &str) -> Result<&str, PathError> {
    components(path)?;
    if path == ROOT {
        return Err(PathError::Root);
    }
    match path.rfind('/') {
        Some(0) => Ok(ROOT),
        Some(n) => Ok(&path[..n]),
        None => Err(PathError::Invalid(path.to_string())),
    }
}

/// Last component of the path.
pub fn node_name(path: &str) -> Result<&str, PathError> {
    components(path)?.last().copied().ok_or(PathError::Root)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Whether `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return path != ROOT;
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components() {
        assert_eq!(components("/").unwrap(), Vec::<&str>::new());
        assert_eq!(components("/a/b").unwrap(), vec!["a", "b"]);
        assert!(components("a/b").is_err());
        assert!(components("/a/").is_err());
        assert!(components("/a//b").is_err());
        assert!(components("").is_err());
        assert!(components("/a/../b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_path("/a/b").unwrap(), "/a");
        assert_eq!(parent_path("/a").unwrap(), "/");
        assert_eq!(parent_path("/"), Err(PathError::Root));
        assert!(parent_path("/a/").is_err());
        assert_eq!(node_name("/a/b").unwrap(), "b");
        assert_eq!(node_name("/"), Err(PathError::Root));
    }

    #[test]
    fn test_join_and_descendant() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert!(is_descendant("/a/b", "/a"));
        assert!(!is_descendant("/ab", "/a"));
        assert!(!is_descendant("/a", "/a"));
        assert!(is_descendant("/x", "/"));
    }
}
