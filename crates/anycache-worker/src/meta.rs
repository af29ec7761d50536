//! Persistent block metadata
//!
//! The meta store is the worker's crash-recoverable index: a `BlockId` →
//! [`BlockMeta`] map persisted in redb. Keys are the fixed 8-byte big-endian
//! block id so a full scan visits blocks in id order. An in-memory fallback
//! backs environments without a durable store.

use anycache_common::{BlockId, Error, Result, TierKind};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// `BlockId` (8B big-endian) → encoded [`BlockMeta`]
const BLOCK_META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("block_meta");

/// Encoded size of [`BlockMeta`]: five u64 fields plus the tier byte.
const META_ENCODED_LEN: usize = 41;

/// Metadata of one cached block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub block_id: BlockId,
    /// Actual data length (allocation capacity)
    pub length: u64,
    /// Tier holding the block
    pub tier: TierKind,
    pub create_time_ms: i64,
    pub last_access_time_ms: i64,
    pub access_count: u64,
}

impl BlockMeta {
    /// Flat binary encoding: fixed-size fields concatenated.
    #[must_use]
    pub fn encode(&self) -> [u8; META_ENCODED_LEN] {
        let mut buf = [0u8; META_ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.block_id.raw().to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.create_time_ms.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_access_time_ms.to_le_bytes());
        buf[32..40].copy_from_slice(&self.access_count.to_le_bytes());
        buf[40] = self.tier as u8;
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < META_ENCODED_LEN {
            return Err(Error::io("block meta value truncated"));
        }
        let u64_at = |i: usize| u64::from_le_bytes(data[i..i + 8].try_into().unwrap());
        let tier = match data[40] {
            0 => TierKind::Memory,
            1 => TierKind::Ssd,
            2 => TierKind::Hdd,
            other => return Err(Error::io(format!("unknown tier tag {other}"))),
        };
        Ok(Self {
            block_id: BlockId::from(u64_at(0)),
            length: u64_at(8),
            tier,
            create_time_ms: u64_at(16) as i64,
            last_access_time_ms: u64_at(24) as i64,
            access_count: u64_at(32),
        })
    }
}

/// Persistent `BlockId` → [`BlockMeta`] map.
pub trait MetaStore: Send + Sync {
    fn put(&self, meta: &BlockMeta) -> Result<()>;

    /// Point lookup; `NotFound` if absent.
    fn get(&self, id: BlockId) -> Result<BlockMeta>;

    fn delete(&self, id: BlockId) -> Result<()>;

    /// Full scan in block-id order; used only at recovery.
    fn scan_all(&self) -> Result<Vec<BlockMeta>>;
}

/// Open the preferred durable store, falling back to the in-memory one if
/// `path` is `None` or the database cannot be opened.
pub fn open_meta_store(path: Option<&Path>) -> Box<dyn MetaStore> {
    if let Some(path) = path {
        match RedbMetaStore::open(path) {
            Ok(store) => {
                info!(path = %path.display(), "meta store: opened redb");
                return Box::new(store);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "meta store: redb open failed, falling back to in-memory");
            }
        }
    } else {
        info!("meta store: using in-memory store");
    }
    Box::new(MemMetaStore::default())
}

/// Durable meta store backed by redb.
pub struct RedbMetaStore {
    db: Database,
}

impl RedbMetaStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(Error::io)?;
        let wtx = db.begin_write().map_err(Error::io)?;
        wtx.open_table(BLOCK_META).map_err(Error::io)?;
        wtx.commit().map_err(Error::io)?;
        Ok(Self { db })
    }
}

impl MetaStore for RedbMetaStore {
    fn put(&self, meta: &BlockMeta) -> Result<()> {
        let wtx = self.db.begin_write().map_err(Error::io)?;
        {
            let mut table = wtx.open_table(BLOCK_META).map_err(Error::io)?;
            table
                .insert(meta.block_id.to_be_bytes().as_slice(), meta.encode().as_slice())
                .map_err(Error::io)?;
        }
        wtx.commit().map_err(Error::io)?;
        Ok(())
    }

    fn get(&self, id: BlockId) -> Result<BlockMeta> {
        let rtx = self.db.begin_read().map_err(Error::io)?;
        let table = rtx.open_table(BLOCK_META).map_err(Error::io)?;
        let value = table
            .get(id.to_be_bytes().as_slice())
            .map_err(Error::io)?
            .ok_or_else(|| Error::not_found(format!("block {id} not in meta store")))?;
        BlockMeta::decode(value.value())
    }

    fn delete(&self, id: BlockId) -> Result<()> {
        let wtx = self.db.begin_write().map_err(Error::io)?;
        {
            let mut table = wtx.open_table(BLOCK_META).map_err(Error::io)?;
            table
                .remove(id.to_be_bytes().as_slice())
                .map_err(Error::io)?;
        }
        wtx.commit().map_err(Error::io)?;
        Ok(())
    }

    fn scan_all(&self) -> Result<Vec<BlockMeta>> {
        let rtx = self.db.begin_read().map_err(Error::io)?;
        let table = rtx.open_table(BLOCK_META).map_err(Error::io)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(Error::io)? {
            let (_, value) = entry.map_err(Error::io)?;
            out.push(BlockMeta::decode(value.value())?);
        }
        Ok(out)
    }
}

/// In-memory fallback for environments without a durable store.
#[derive(Default)]
pub struct MemMetaStore {
    entries: Mutex<BTreeMap<u64, BlockMeta>>,
}

impl MetaStore for MemMetaStore {
    fn put(&self, meta: &BlockMeta) -> Result<()> {
        self.entries.lock().insert(meta.block_id.raw(), *meta);
        Ok(())
    }

    fn get(&self, id: BlockId) -> Result<BlockMeta> {
        self.entries
            .lock()
            .get(&id.raw())
            .copied()
            .ok_or_else(|| Error::not_found(format!("block {id} not in meta store")))
    }

    fn delete(&self, id: BlockId) -> Result<()> {
        self.entries.lock().remove(&id.raw());
        Ok(())
    }

    fn scan_all(&self) -> Result<Vec<BlockMeta>> {
        Ok(self.entries.lock().values().copied().collect())
    }
}
