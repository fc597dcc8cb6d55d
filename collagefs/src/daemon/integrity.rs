//! 启动时完整性检查：找出引用了从未上传的 chunk 的文件。
//!
//! Such a file was written before a crash and its data never reached the
//! remote. What to do about it is the operator's call.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::persist::PersistError;
use crate::meta::DirectoryIndex;

/// What to do when the startup check finds broken files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BrokenFilePolicy {
    /// Refuse to start.
    #[default]
    Abort,
    /// Start anyway; unreadable ranges read as zeros.
    Mount,
    /// Detach the broken files from the tree, then start.
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Paths of files with at least one never-uploaded chunk, sorted.
    pub broken: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
    }
}

pub fn check_integrity(index: &DirectoryIndex) -> IntegrityReport {
    let broken: Vec<String> = index
        .walk_files()
        .into_iter()
        .filter(|(_, file)| file.has_unuploaded_chunks())
        .map(|(p, _)| p)
        .collect();
    for p in &broken {
        warn!(path = %p, "file references a chunk that was never uploaded");
    }
    IntegrityReport { broken }
}

/// Detaches every file listed in `report`. Returns how many were removed.
pub fn remove_broken(index: &DirectoryIndex, report: &IntegrityReport) -> usize {
    let mut removed = 0;
    for p in &report.broken {
        let (Ok(Some(node)), Ok(Some(parent))) = (index.lookup_node(p), index.lookup_parent(p)) else {
            continue;
        };
        if index.remove_node(&parent, &node) {
            warn!(path = %p, "removed broken file");
            removed += 1;
        }
    }
    removed
}

/// Applies `policy` to the findings of `check_integrity`.
pub fn apply_policy(
    index: &DirectoryIndex,
    report: &IntegrityReport,
    policy: BrokenFilePolicy,
) -> Result<(), PersistError> {
    if report.is_clean() {
        return Ok(());
    }
    match policy {
        BrokenFilePolicy::Abort => Err(PersistError::Integrity(report.broken.clone())),
        BrokenFilePolicy::Mount => {
            info!(broken = report.broken.len(), "continuing with broken files");
            Ok(())
        }
        BrokenFilePolicy::Remove => {
            let removed = remove_broken(index, report);
            info!(removed, "broken files removed");
            Ok(())
        }
    }
}
