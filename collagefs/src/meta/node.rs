//! Directory tree nodes.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chuck::chunk::FileChunk;

pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(before) => {
                let d = before.duration();
                Self::new(-(d.as_secs() as i64), d.subsec_nanos())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttr {
    pub name: String,
    /// Mode bits including the file-type bits.
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    pub access_time: Timestamp,
    pub modification_time: Timestamp,
}

impl NodeAttr {
    pub fn new(name: impl Into<String>, permissions: u32, uid: u32, gid: u32) -> Self {
        let now = Timestamp::now();
        Self {
            name: name.into(),
            permissions,
            uid,
            gid,
            access_time: now,
            modification_time: now,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug)]
pub struct Dir {
    attr: RwLock<NodeAttr>,
    children: DashMap<String, Node>,
}

impl Dir {
    /// `mode` gets the directory type bit added.
    pub fn new(name: impl Into<String>, mode: u32, uid: u32, gid: u32) -> Self {
        Self::from_attr(NodeAttr::new(name, (mode & !S_IFMT) | S_IFDIR, uid, gid))
    }

    pub fn from_attr(attr: NodeAttr) -> Self {
        Self {
            attr: RwLock::new(attr),
            children: DashMap::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<Node> {
        self.children.get(name).map(|c| c.value().clone())
    }

    pub fn children(&self) -> Vec<Node> {
        self.children.iter().map(|c| c.value().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn children_map(&self) -> &DashMap<String, Node> {
        &self.children
    }
}

/// Logical size and chunk list of a file, guarded together.
#[derive(Debug, Default)]
pub struct FileContent {
    pub size: u64,
    pub chunks: Vec<Arc<FileChunk>>,
}

#[derive(Debug)]
pub struct File {
    id: Uuid,
    attr: RwLock<NodeAttr>,
    content: RwLock<FileContent>,
}

impl File {
    /// `mode` gets the regular-file type bit when it carries none.
    pub fn new(name: impl Into<String>, mode: u32, uid: u32, gid: u32) -> Self {
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        Self::restore(Uuid::new_v4(), NodeAttr::new(name, mode, uid, gid), FileContent::default())
    }

    pub fn restore(id: Uuid, attr: NodeAttr, content: FileContent) -> Self {
        Self {
            id,
            attr: RwLock::new(attr),
            content: RwLock::new(content),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn size(&self) -> u64 {
        read(&self.content).size
    }

    pub fn chunks(&self) -> Vec<Arc<FileChunk>> {
        read(&self.content).chunks.clone()
    }

    pub fn content(&self) -> RwLockReadGuard<'_, FileContent> {
        read(&self.content)
    }

    pub fn content_mut(&self) -> RwLockWriteGuard<'_, FileContent> {
        write(&self.content)
    }

    /// Chunks that have never reached the remote store.
    pub fn has_unuploaded_chunks(&self) -> bool {
        read(&self.content).chunks.iter().any(|c| !c.is_uploaded())
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Dir(Arc<Dir>),
    File(Arc<File>),
}

impl Node {
    fn attr_lock(&self) -> &RwLock<NodeAttr> {
        match self {
            Node::Dir(d) => &d.attr,
            Node::File(f) => &f.attr,
        }
    }

    pub fn attr(&self) -> NodeAttr {
        read(self.attr_lock()).clone()
    }

    pub fn update_attr(&self, f: impl FnOnce(&mut NodeAttr)) {
        f(&mut write(self.attr_lock()));
    }

    pub fn name(&self) -> String {
        read(self.attr_lock()).name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        write(self.attr_lock()).name = name.into();
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    pub fn as_dir(&self) -> Option<&Arc<Dir>> {
        match self {
            Node::Dir(d) => Some(d),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<File>> {
        match self {
            Node::File(f) => Some(f),
            Node::Dir(_) => None,
        }
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Dir(a), Node::Dir(b)) => Arc::ptr_eq(a, b),
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Dir> for Node {
    fn from(d: Dir) -> Self {
        Node::Dir(Arc::new(d))
    }
}

impl From<File> for Node {
    fn from(f: File) -> Self {
        Node::File(Arc::new(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_bits() {
        let dir = Node::from(Dir::new("d", 0o755, 1, 2));
        assert_eq!(dir.attr().permissions, S_IFDIR | 0o755);
        let file = Node::from(File::new("f", 0o644, 1, 2));
        assert_eq!(file.attr().permissions, S_IFREG | 0o644);
        assert!(dir.is_dir() && !file.is_dir());
    }

    #[test]
    fn test_rename_and_identity() {
        let node = Node::from(File::new("old", 0o644, 0, 0));
        let alias = node.clone();
        alias.set_name("new");
        assert_eq!(node.name(), "new");
        assert!(node.ptr_eq(&alias));
        assert!(!node.ptr_eq(&Node::from(File::new("new", 0o644, 0, 0))));
    }

    #[test]
    fn test_timestamp_from_system_time() {
        let t = UNIX_EPOCH + std::time::Duration::new(5, 7);
        assert_eq!(Timestamp::from(t), Timestamp::new(5, 7));
    }
}
