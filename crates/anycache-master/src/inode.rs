//! In-memory inode representation

use anycache_common::{InodeId, DEFAULT_BLOCK_SIZE};
use std::collections::HashMap;

/// A namespace node: file or directory.
///
/// Every non-root inode appears in exactly one parent's `children` map under
/// its `name`, and `parent_id` points back at that parent. `children` is
/// populated only for directories.
#[derive(Clone, Debug)]
pub struct Inode {
    pub id: InodeId,
    pub parent_id: InodeId,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub mode: u32,
    pub owner: String,
    pub group: String,
    /// Per-file block size
    pub block_size: u64,
    pub creation_time_ms: i64,
    pub modification_time_ms: i64,
    /// False while the file is still being written; `size` may not reflect
    /// final bytes until completion.
    pub is_complete: bool,
    /// Directory: child name → inode id
    pub children: HashMap<String, InodeId>,
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            id: InodeId::INVALID,
            parent_id: InodeId::INVALID,
            name: String::new(),
            is_directory: false,
            size: 0,
            mode: 0o644,
            owner: String::new(),
            group: String::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            creation_time_ms: 0,
            modification_time_ms: 0,
            is_complete: true,
            children: HashMap::new(),
        }
    }
}

impl Inode {
    /// A new root directory inode.
    #[must_use]
    pub fn root(now_ms: i64) -> Self {
        Self {
            id: InodeId::ROOT,
            parent_id: InodeId::INVALID,
            name: String::new(),
            is_directory: true,
            mode: 0o755,
            creation_time_ms: now_ms,
            modification_time_ms: now_ms,
            ..Default::default()
        }
    }
}
