//! 基于路径的文件系统调用面：create/mkdir/read/write/readdir/rename/truncate/unlink 等。
//!
//! Each call resolves its path in the directory index, maps the byte range
//! onto chunks and goes through the chunk cache for the data. Locks on file
//! content are never held across an await.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info};

use super::error::VfsError;
use crate::chuck::buffer::CachedChunk;
use crate::chuck::cache::ChunkCache;
use crate::chuck::chunk::{ChunkLayout, FileChunk};
use crate::chuck::util::{ChunkSpan, split_file_range_into_chunks};
use crate::meta::node::{Dir, File, Node, Timestamp};
use crate::meta::path;
use crate::meta::DirectoryIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: FileType,
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// Owner given to newly created nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

fn attr_of(node: &Node) -> FileAttr {
    let attr = node.attr();
    let (kind, size) = match node {
        Node::Dir(_) => (FileType::Dir, 0),
        Node::File(f) => (FileType::File, f.size()),
    };
    FileAttr {
        kind,
        mode: attr.permissions,
        size,
        uid: attr.uid,
        gid: attr.gid,
        atime: attr.access_time,
        mtime: attr.modification_time,
    }
}

pub struct CollageFs {
    index: Arc<DirectoryIndex>,
    cache: ChunkCache,
    layout: ChunkLayout,
    prefetch_chunks: usize,
}

impl CollageFs {
    /// The chunk size is taken from the cache's remote backend.
    pub fn new(index: Arc<DirectoryIndex>, cache: ChunkCache, prefetch_chunks: usize) -> Self {
        let layout = ChunkLayout::new(cache.remote().max_chunk_size());
        Self {
            index,
            cache,
            layout,
            prefetch_chunks,
        }
    }

    pub fn index(&self) -> &Arc<DirectoryIndex> {
        &self.index
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    fn lookup(&self, p: &str) -> Result<Node, VfsError> {
        self.index
            .lookup_node(p)?
            .ok_or_else(|| VfsError::not_found(p))
    }

    fn lookup_file(&self, p: &str) -> Result<Arc<File>, VfsError> {
        match self.lookup(p)? {
            Node::File(f) => Ok(f),
            Node::Dir(_) => Err(VfsError::is_a_directory(p)),
        }
    }

    // Parent directory of `p`: missing -> ENOENT, not a directory -> ENOTDIR.
    fn parent_of(&self, p: &str) -> Result<Arc<Dir>, VfsError> {
        let parent = path::parent_path(p)?;
        match self.index.lookup_node(parent)? {
            Some(Node::Dir(d)) => Ok(d),
            Some(Node::File(_)) => Err(VfsError::not_a_directory(parent)),
            None => Err(VfsError::not_found(parent)),
        }
    }

    fn insert_new(&self, p: &str, node: Node) -> Result<FileAttr, VfsError> {
        let parent = self.parent_of(p)?;
        let attr = attr_of(&node);
        if !self.index.add_node_if_absent(&parent, node) {
            return Err(VfsError::already_exists(p));
        }
        Ok(attr)
    }

    pub async fn create(&self, p: &str, mode: u32, owner: Credentials) -> Result<FileAttr, VfsError> {
        let name = path::node_name(p)?;
        let attr = self.insert_new(p, Node::from(File::new(name, mode, owner.uid, owner.gid)))?;
        debug!(path = p, "created file");
        Ok(attr)
    }

    pub async fn mkdir(&self, p: &str, mode: u32, owner: Credentials) -> Result<FileAttr, VfsError> {
        let name = path::node_name(p)?;
        let attr = self.insert_new(p, Node::from(Dir::new(name, mode, owner.uid, owner.gid)))?;
        debug!(path = p, "created directory");
        Ok(attr)
    }

    pub async fn getattr(&self, p: &str) -> Result<FileAttr, VfsError> {
        Ok(attr_of(&self.lookup(p)?))
    }

    /// Directory listing including `.` and `..`, sorted by name after those two.
    pub async fn readdir(&self, p: &str) -> Result<Vec<DirEntry>, VfsError> {
        let dir = match self.lookup(p)? {
            Node::Dir(d) => d,
            Node::File(_) => return Err(VfsError::not_a_directory(p)),
        };
        let mut children: Vec<DirEntry> = dir
            .children()
            .iter()
            .map(|child| DirEntry {
                name: child.name(),
                kind: if child.is_dir() { FileType::Dir } else { FileType::File },
            })
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = Vec::with_capacity(children.len() + 2);
        for dot in [".", ".."] {
            entries.push(DirEntry {
                name: dot.to_string(),
                kind: FileType::Dir,
            });
        }
        entries.extend(children);
        Ok(entries)
    }

    /// Reads up to `len` bytes at `offset`, stopping at the end of the file.
    pub async fn read(&self, p: &str, offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        let file = self.lookup_file(p)?;
        let (spans, ahead) = {
            let content = file.content();
            if offset >= content.size || len == 0 {
                return Ok(Vec::new());
            }
            let len = (len as u64).min(content.size - offset);
            let spans = split_file_range_into_chunks(self.layout, offset, len);
            let mut targets = Vec::with_capacity(spans.len());
            for span in spans {
                targets.push((span, content.chunks.get(span.chunk_index as usize).cloned()));
            }
            let next = targets.last().map_or(0, |(s, _)| s.chunk_index as usize + 1);
            let ahead: Vec<Arc<FileChunk>> = content
                .chunks
                .iter()
                .skip(next)
                .take(self.prefetch_chunks)
                .cloned()
                .collect();
            (targets, ahead)
        };

        for chunk in &ahead {
            self.cache.prefetch(chunk);
        }

        // 每个 chunk 读完即释放 buffer，缓存满时才能继续淘汰
        let pieces = try_join_all(spans.iter().map(|(span, chunk)| async move {
            let mut piece = Vec::with_capacity(span.len());
            match chunk {
                Some(chunk) => {
                    let buffer = self.cache.get(chunk).await?;
                    buffer.read_into(span.start, span.end, &mut piece);
                }
                None => piece.resize(span.len(), 0),
            }
            Ok::<_, VfsError>(piece)
        }))
        .await?;

        let out = pieces.concat();
        Node::File(file).update_attr(|a| a.access_time = Timestamp::now());
        Ok(out)
    }

    /// Writes `data` at `offset`. Writing past the end first zero-fills the gap.
    pub async fn write(&self, p: &str, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        let file = self.lookup_file(p)?;
        if data.is_empty() {
            return Ok(0);
        }
        if offset > file.size() {
            self.grow(&file, offset).await?;
        }
        let targets = {
            let mut content = file.content_mut();
            let spans = split_file_range_into_chunks(self.layout, offset, data.len() as u64);
            let targets = self.chunks_for(&mut content.chunks, spans);
            content.size = content.size.max(offset + data.len() as u64);
            targets
        };

        let mut pieces = Vec::with_capacity(targets.len());
        let mut cursor = 0;
        for (span, chunk) in targets {
            pieces.push((span, chunk, &data[cursor..cursor + span.len()]));
            cursor += span.len();
        }
        try_join_all(pieces.into_iter().map(|(span, chunk, bytes)| async move {
            let cached = self.cache.get(&chunk).await?;
            cached.write(span.start, bytes);
            chunk.grow_to(span.end);
            self.cache.touch(&chunk, &cached).await?;
            Ok::<_, VfsError>(())
        }))
        .await?;

        Node::File(file).update_attr(|a| a.modification_time = Timestamp::now());
        Ok(data.len())
    }

    /// Chunk descriptors for `spans`, appending new chunks where the list is short.
    fn chunks_for(
        &self,
        chunks: &mut Vec<Arc<FileChunk>>,
        spans: Vec<ChunkSpan>,
    ) -> Vec<(ChunkSpan, Arc<FileChunk>)> {
        spans
            .into_iter()
            .map(|span| {
                let index = span.chunk_index as usize;
                while chunks.len() <= index {
                    chunks.push(Arc::new(FileChunk::new()));
                }
                (span, chunks[index].clone())
            })
            .collect()
    }

    pub async fn truncate(&self, p: &str, size: u64) -> Result<(), VfsError> {
        let file = self.lookup_file(p)?;
        let current = file.size();
        if size > current {
            self.grow(&file, size).await?;
        } else if size < current {
            self.shrink(&file, size);
        }
        Node::File(file).update_attr(|a| a.modification_time = Timestamp::now());
        debug!(path = p, from = current, to = size, "truncated");
        Ok(())
    }

    // 扩展文件：新增区间写零
    async fn grow(&self, file: &File, new_size: u64) -> Result<(), VfsError> {
        let targets = {
            let mut content = file.content_mut();
            if new_size <= content.size {
                return Ok(());
            }
            let spans = split_file_range_into_chunks(self.layout, content.size, new_size - content.size);
            let targets = self.chunks_for(&mut content.chunks, spans);
            content.size = new_size;
            targets
        };
        try_join_all(targets.into_iter().map(|(span, chunk)| async move {
            let cached: Arc<CachedChunk> = self.cache.get(&chunk).await?;
            cached.zero_fill(span.start, span.end);
            chunk.grow_to(span.end);
            self.cache.touch(&chunk, &cached).await?;
            Ok::<_, VfsError>(())
        }))
        .await?;
        Ok(())
    }

    // 收缩文件：丢弃多余 chunk，最后一个 chunk 截断
    fn shrink(&self, file: &File, new_size: u64) {
        let (dropped, last) = {
            let mut content = file.content_mut();
            if new_size >= content.size {
                return;
            }
            let (dropped, last) = match self.layout.shrink_plan(new_size) {
                None => (std::mem::take(&mut content.chunks), None),
                Some(plan) => {
                    let keep = (plan.last_chunk_index as usize + 1).min(content.chunks.len());
                    let dropped = content.chunks.split_off(keep);
                    let last = content
                        .chunks
                        .get(plan.last_chunk_index as usize)
                        .cloned()
                        .map(|c| (c, plan.last_chunk_len as usize));
                    (dropped, last)
                }
            };
            content.size = new_size;
            (dropped, last)
        };
        for chunk in &dropped {
            self.cache.drop_chunk(chunk);
        }
        if let Some((chunk, len)) = last {
            if chunk.size() > len {
                chunk.set_size(len);
                if let Some(cached) = self.cache.peek(&chunk) {
                    cached.truncate(len);
                    cached.mark_dirty();
                }
            }
        }
    }

    pub async fn unlink(&self, p: &str) -> Result<(), VfsError> {
        let node = self.lookup(p)?;
        let Node::File(file) = &node else {
            return Err(VfsError::is_a_directory(p));
        };
        let parent = self.parent_of(p)?;
        if !self.index.remove_node(&parent, &node) {
            return Err(VfsError::not_found(p));
        }
        let dropped = self.release_chunks(file);
        info!(path = p, chunks = dropped, "unlinked file");
        Ok(())
    }

    pub async fn rmdir(&self, p: &str) -> Result<(), VfsError> {
        let node = self.lookup(p)?;
        let Node::Dir(dir) = &node else {
            return Err(VfsError::not_a_directory(p));
        };
        let parent = self.parent_of(p)?;
        if !dir.is_empty() {
            return Err(VfsError::not_empty(p));
        }
        if !self.index.remove_node(&parent, &node) {
            return Err(VfsError::not_found(p));
        }
        debug!(path = p, "removed directory");
        Ok(())
    }

    /// Moves `from` to `to`, replacing a file or an empty directory there.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), VfsError> {
        let node = self.lookup(from)?;
        let old_parent = self.parent_of(from)?;
        let new_parent = self.parent_of(to)?;
        if from == to {
            return Ok(());
        }
        if node.is_dir() && path::is_descendant(to, from) {
            return Err(VfsError::invalid(to));
        }
        let new_name = path::node_name(to)?;
        if let Some(existing) = new_parent.child(new_name) {
            if existing.ptr_eq(&node) {
                return Ok(());
            }
            match (&node, &existing) {
                (Node::Dir(_), Node::File(_)) => return Err(VfsError::not_a_directory(to)),
                (Node::File(_), Node::Dir(_)) => return Err(VfsError::is_a_directory(to)),
                (Node::Dir(_), Node::Dir(d)) if !d.is_empty() => return Err(VfsError::not_empty(to)),
                _ => {}
            }
        }

        if !self.index.remove_node(&old_parent, &node) {
            return Err(VfsError::not_found(from));
        }
        node.set_name(new_name);
        if let Some(Node::File(replaced)) = self.index.add_node(&new_parent, node) {
            self.release_chunks(&replaced);
        }
        debug!(from, to, "renamed");
        Ok(())
    }

    pub async fn utimens(
        &self,
        p: &str,
        atime: Option<Timestamp>,
        mtime: Option<Timestamp>,
    ) -> Result<(), VfsError> {
        let node = self.lookup(p)?;
        node.update_attr(|a| {
            if let Some(t) = atime {
                a.access_time = t;
            }
            if let Some(t) = mtime {
                a.modification_time = t;
            }
        });
        Ok(())
    }

    // Forgets the data of a file that left the tree.
    fn release_chunks(&self, file: &File) -> usize {
        let chunks = {
            let mut content = file.content_mut();
            content.size = 0;
            std::mem::take(&mut content.chunks)
        };
        for chunk in &chunks {
            self.cache.drop_chunk(chunk);
        }
        chunks.len()
    }
}
