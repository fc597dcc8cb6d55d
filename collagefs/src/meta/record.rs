//! Serialized form of the directory index.
//!
//! ```json
//! {"format_version": 1,
//!  "root": {"type": "dir", "name": "/", "permissions": 16877, "uid": 0, "gid": 0,
//!           "access_time": {"secs": 0, "nanos": 0}, "modification_time": {...},
//!           "children": {"a.txt": {"type": "file", "id": "...", "size": 3,
//!                                   "chunks": [{"id": "...", "remote_blob_id": "...", "size": 3}], ...}}}}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::index::DirectoryIndex;
use super::node::{Dir, File, FileContent, Node, NodeAttr, Timestamp};
use crate::cadapter::client::BlobId;
use crate::chuck::chunk::FileChunk;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("unsupported index format version {0}")]
    UnsupportedVersion(u32),
    #[error("index root must be a directory")]
    RootNotDir,
    #[error("child key {key:?} does not match node name {name:?}")]
    NameMismatch { key: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_blob_id: Option<BlobId>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeRecord {
    Dir {
        name: String,
        permissions: u32,
        uid: u32,
        gid: u32,
        access_time: Timestamp,
        modification_time: Timestamp,
        #[serde(default)]
        children: BTreeMap<String, NodeRecord>,
    },
    File {
        name: String,
        permissions: u32,
        uid: u32,
        gid: u32,
        access_time: Timestamp,
        modification_time: Timestamp,
        id: Uuid,
        size: u64,
        #[serde(default)]
        chunks: Vec<ChunkRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub format_version: u32,
    pub root: NodeRecord,
}

impl IndexSnapshot {
    pub fn capture(index: &DirectoryIndex) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            root: NodeRecord::capture(&Node::Dir(index.root().clone())),
        }
    }

    pub fn restore(self) -> Result<DirectoryIndex, RecordError> {
        if self.format_version != FORMAT_VERSION {
            return Err(RecordError::UnsupportedVersion(self.format_version));
        }
        match self.root.restore()? {
            Node::Dir(root) => Ok(DirectoryIndex::new(root)),
            Node::File(_) => Err(RecordError::RootNotDir),
        }
    }
}

impl NodeRecord {
    pub fn capture(node: &Node) -> Self {
        let attr = node.attr();
        match node {
            Node::Dir(dir) => NodeRecord::Dir {
                name: attr.name,
                permissions: attr.permissions,
                uid: attr.uid,
                gid: attr.gid,
                access_time: attr.access_time,
                modification_time: attr.modification_time,
                children: dir
                    .children()
                    .iter()
                    .map(|child| (child.name(), NodeRecord::capture(child)))
                    .collect(),
            },
            Node::File(file) => {
                let content = file.content();
                NodeRecord::File {
                    name: attr.name,
                    permissions: attr.permissions,
                    uid: attr.uid,
                    gid: attr.gid,
                    access_time: attr.access_time,
                    modification_time: attr.modification_time,
                    id: file.id(),
                    size: content.size,
                    chunks: content
                        .chunks
                        .iter()
                        .map(|c| ChunkRecord {
                            id: c.id(),
                            remote_blob_id: c.remote_blob_id(),
                            size: c.size(),
                        })
                        .collect(),
                }
            }
        }
    }

    pub fn restore(self) -> Result<Node, RecordError> {
        match self {
            NodeRecord::Dir {
                name,
                permissions,
                uid,
                gid,
                access_time,
                modification_time,
                children,
            } => {
                let dir = Dir::from_attr(NodeAttr {
                    name,
                    permissions,
                    uid,
                    gid,
                    access_time,
                    modification_time,
                });
                for (key, record) in children {
                    let child = record.restore()?;
                    let name = child.name();
                    if name != key {
                        return Err(RecordError::NameMismatch { key, name });
                    }
                    dir.children_map().insert(key, child);
                }
                Ok(Node::Dir(Arc::new(dir)))
            }
            NodeRecord::File {
                name,
                permissions,
                uid,
                gid,
                access_time,
                modification_time,
                id,
                size,
                chunks,
            } => {
                let attr = NodeAttr {
                    name,
                    permissions,
                    uid,
                    gid,
                    access_time,
                    modification_time,
                };
                let content = FileContent {
                    size,
                    chunks: chunks
                        .into_iter()
                        .map(|c| Arc::new(FileChunk::restore(c.id, c.remote_blob_id, c.size)))
                        .collect(),
                };
                Ok(Node::File(Arc::new(File::restore(id, attr, content))))
            }
        }
    }
}
