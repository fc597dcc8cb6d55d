//! Directory index (meta)
//!
//! Responsibilities:
//! - Keep the namespace as an in-memory tree of directories and files.
//! - Resolve slash-separated absolute paths to nodes.
//! - Convert the tree to and from its persisted JSON form.
//!
//! Submodules:
//! - `node`: `Node`, `Dir`, `File` and their attributes
//! - `index`: path resolution and tree mutation
//! - `path`: path parsing helpers
//! - `record`: persisted snapshot format
pub mod index;
pub mod node;
pub mod path;
pub mod record;

pub use index::DirectoryIndex;
pub use node::{Dir, File, Node, NodeAttr, Timestamp};
