//! In-memory directory index: a rooted tree of `Node`s resolved by path.

use std::sync::Arc;

use super::node::{Dir, File, Node};
use super::path::{self, PathError};

pub struct DirectoryIndex {
    root: Arc<Dir>,
}

impl DirectoryIndex {
    pub fn new(root: Arc<Dir>) -> Self {
        Self { root }
    }

    /// A tree holding only an empty root owned by `uid:gid`.
    pub fn empty(uid: u32, gid: u32) -> Self {
        Self::new(Arc::new(Dir::new(path::ROOT, 0o755, uid, gid)))
    }

    pub fn root(&self) -> &Arc<Dir> {
        &self.root
    }

    /// Resolves `path` by descending from the root. A file met before the
    /// path is exhausted means not found.
    pub fn lookup_node(&self, path: &str) -> Result<Option<Node>, PathError> {
        let mut current = Node::Dir(self.root.clone());
        for name in path::components(path)? {
            let Node::Dir(dir) = current else {
                return Ok(None);
            };
            match dir.child(name) {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// The directory that holds `path`'s last component, if it exists and is
    /// a directory. The root itself has no parent.
    pub fn lookup_parent(&self, path: &str) -> Result<Option<Arc<Dir>>, PathError> {
        let parent = path::parent_path(path)?;
        Ok(self
            .lookup_node(parent)?
            .and_then(|node| node.as_dir().cloned()))
    }

    /// Inserts `node` under its name, returning whatever it replaced.
    pub fn add_node(&self, parent: &Dir, node: Node) -> Option<Node> {
        parent.children_map().insert(node.name(), node)
    }

    /// Inserts `node` unless the name is taken. Returns false when taken.
    pub fn add_node_if_absent(&self, parent: &Dir, node: Node) -> bool {
        match parent.children_map().entry(node.name()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(node);
                true
            }
        }
    }

    /// Detaches `node` from `parent`. Does nothing if another node took its
    /// name meanwhile.
    pub fn remove_node(&self, parent: &Dir, node: &Node) -> bool {
        parent
            .children_map()
            .remove_if(&node.name(), |_, current| current.ptr_eq(node))
            .is_some()
    }

    /// Every file in the tree with its absolute path.
    pub fn walk_files(&self) -> Vec<(String, Arc<File>)> {
        let mut files = Vec::new();
        let mut stack = vec![(path::ROOT.to_string(), self.root.clone())];
        while let Some((dir_path, dir)) = stack.pop() {
            for child in dir.children() {
                let child_path = path::join(&dir_path, &child.name());
                match child {
                    Node::Dir(d) => stack.push((child_path, d)),
                    Node::File(f) => files.push((child_path, f)),
                }
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files
    }

    /// Number of nodes below the root.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for child in dir.children() {
                count += 1;
                if let Node::Dir(d) = child {
                    stack.push(d);
                }
            }
        }
        count
    }
}
