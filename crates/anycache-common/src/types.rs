//! Core type definitions for AnyCache
//!
//! This module defines the fundamental identifiers and block arithmetic
//! shared by the master and worker engines.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default block size: 64 MiB
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Default page size for the worker page cache: 1 MiB
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

/// Maximum supported block size: 512 MiB
pub const MAX_BLOCK_SIZE: u64 = 512 * 1024 * 1024;

/// Number of low bits of a [`BlockId`] holding the block index
pub const BLOCK_INDEX_BITS: u32 = 24;

/// Mask selecting the block-index bits of a [`BlockId`]
pub const BLOCK_INDEX_MASK: u64 = (1 << BLOCK_INDEX_BITS) - 1;

/// Largest inode id representable in a composite [`BlockId`] (40 bits)
pub const MAX_INODE_ID: u64 = (1 << 40) - 1;

/// Largest block index representable in a composite [`BlockId`] (24 bits)
pub const MAX_BLOCK_INDEX: u32 = (1 << BLOCK_INDEX_BITS) - 1;

/// Identifier of a namespace node (file or directory)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct InodeId(u64);

impl InodeId {
    /// Sentinel for "no inode" (root's parent)
    pub const INVALID: Self = Self(0);

    /// The root directory always has id 1
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeId({})", self.0)
    }
}

/// File identifier as seen by the page cache; files are addressed by their
/// inode id.
pub type FileId = InodeId;

/// Composite 64-bit block identifier.
///
/// Layout: `[InodeId (40 bits) | block index (24 bits)]`. Given an inode and
/// its size, every block id of the file is computable without any lookup.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct BlockId(u64);

impl BlockId {
    /// Sentinel for "no block"
    pub const INVALID: Self = Self(0);

    /// Compose a block id from an inode id and a block index within the file.
    #[must_use]
    pub const fn new(inode_id: InodeId, block_index: u32) -> Self {
        Self((inode_id.raw() << BLOCK_INDEX_BITS) | (block_index as u64 & BLOCK_INDEX_MASK))
    }

    /// The inode this block belongs to.
    #[must_use]
    pub const fn inode_id(self) -> InodeId {
        InodeId::new(self.0 >> BLOCK_INDEX_BITS)
    }

    /// Index of this block within its file.
    #[must_use]
    pub const fn block_index(self) -> u32 {
        (self.0 & BLOCK_INDEX_MASK) as u32
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Fixed 8-byte big-endian key encoding; lexicographic order over the
    /// encoded form equals numeric order over ids.
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockId({}:{})",
            self.inode_id().raw(),
            self.block_index()
        )
    }
}

/// Identifier of a registered worker
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct WorkerId(u64);

impl WorkerId {
    /// Sentinel for "no worker"
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

/// Milliseconds since the Unix epoch; the timestamp base for all metadata.
#[must_use]
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// How many blocks a file of `file_size` bytes occupies.
#[must_use]
pub fn block_count(file_size: u64, block_size: u64) -> u32 {
    if file_size == 0 {
        return 0;
    }
    file_size.div_ceil(block_size) as u32
}

/// Actual data length of block `block_index` in a file of `file_size` bytes.
/// The last block may be partial; indices past the end have length 0.
#[must_use]
pub fn block_length(file_size: u64, block_index: u32, block_size: u64) -> u64 {
    let start = u64::from(block_index) * block_size;
    if start >= file_size {
        return 0;
    }
    block_size.min(file_size - start)
}

/// Storage tier kind, ordered fastest to slowest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TierKind {
    Memory = 0,
    Ssd = 1,
    Hdd = 2,
}

impl TierKind {
    /// Short display name used in logs and worker status reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Memory => "MEM",
            Self::Ssd => "SSD",
            Self::Hdd => "HDD",
        }
    }

    /// The next faster tier, or `None` if already in memory.
    #[must_use]
    pub const fn faster(self) -> Option<Self> {
        match self {
            Self::Memory => None,
            Self::Ssd => Some(Self::Memory),
            Self::Hdd => Some(Self::Ssd),
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a cached copy of a block lives, as tracked by the master.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub block_id: BlockId,
    pub worker_id: WorkerId,
    pub worker_address: String,
    pub tier: TierKind,
}

/// Key of a cached page: `(file, page index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PageKey {
    #[must_use]
    pub const fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_roundtrip() {
        for (inode, idx) in [
            (1u64, 0u32),
            (42, 7),
            (MAX_INODE_ID, MAX_BLOCK_INDEX),
            (1 << 39, 1 << 23),
        ] {
            let id = BlockId::new(InodeId::new(inode), idx);
            assert_eq!(id.inode_id().raw(), inode);
            assert_eq!(id.block_index(), idx);
        }
    }

    #[test]
    fn test_block_id_be_key_order() {
        let a = BlockId::new(InodeId::new(1), 5);
        let b = BlockId::new(InodeId::new(2), 0);
        assert!(a.raw() < b.raw());
        assert!(a.to_be_bytes() < b.to_be_bytes());
        assert_eq!(BlockId::from_be_bytes(a.to_be_bytes()), a);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(0, DEFAULT_BLOCK_SIZE), 0);
        assert_eq!(block_count(1, DEFAULT_BLOCK_SIZE), 1);
        assert_eq!(block_count(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE), 1);
        assert_eq!(block_count(DEFAULT_BLOCK_SIZE + 1, DEFAULT_BLOCK_SIZE), 2);
        assert_eq!(block_count(3 * DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE), 3);
    }

    #[test]
    fn test_block_length() {
        let bs = 1024;
        assert_eq!(block_length(2500, 0, bs), 1024);
        assert_eq!(block_length(2500, 1, bs), 1024);
        assert_eq!(block_length(2500, 2, bs), 452);
        assert_eq!(block_length(2500, 3, bs), 0);
        assert_eq!(block_length(0, 0, bs), 0);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(TierKind::Memory < TierKind::Ssd);
        assert!(TierKind::Ssd < TierKind::Hdd);
        assert_eq!(TierKind::Hdd.faster(), Some(TierKind::Ssd));
        assert_eq!(TierKind::Ssd.faster(), Some(TierKind::Memory));
        assert_eq!(TierKind::Memory.faster(), None);
    }
}
