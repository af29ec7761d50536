//! A single storage tier
//!
//! A tier is a homogeneous allocator, reader, and writer for block payloads:
//! the memory tier owns zero-filled heap regions, disk tiers (SSD/HDD) keep
//! one pre-allocated file per block under the tier root. Operations are
//! short (one memcpy or one pread/pwrite) and serialized by a per-tier
//! mutex; no per-block file handles are cached.

use anycache_common::{BlockId, Error, Result, TierKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Bookkeeping for one allocated block.
struct BlockHandle {
    capacity: u64,
    payload: Payload,
}

enum Payload {
    /// Memory tier: the block's heap region
    Memory(Vec<u8>),
    /// Disk tier: path of the block file
    Disk(PathBuf),
}

struct TierState {
    used_bytes: u64,
    blocks: HashMap<BlockId, BlockHandle>,
}

/// One homogeneous storage tier (memory, SSD, or HDD).
pub struct StorageTier {
    kind: TierKind,
    root: PathBuf,
    capacity: u64,
    state: Mutex<TierState>,
}

impl StorageTier {
    /// Create a tier. Disk tiers get their root directory created eagerly.
    pub fn new(kind: TierKind, root: impl Into<PathBuf>, capacity: u64) -> Result<Self> {
        let root = root.into();
        if kind != TierKind::Memory {
            fs::create_dir_all(&root)?;
        }
        info!(
            tier = %kind,
            root = %root.display(),
            capacity_mb = capacity / (1024 * 1024),
            "storage tier created"
        );
        Ok(Self {
            kind,
            root,
            capacity,
            state: Mutex::new(TierState {
                used_bytes: 0,
                blocks: HashMap::new(),
            }),
        })
    }

    /// Reserve `size` bytes for a block.
    pub fn allocate_block(&self, id: BlockId, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.blocks.contains_key(&id) {
            return Err(Error::already_exists(format!(
                "block {id} already allocated in tier {}",
                self.kind
            )));
        }
        if state.used_bytes + size > self.capacity {
            return Err(Error::resource_exhausted(format!(
                "tier {} capacity exceeded",
                self.kind
            )));
        }

        let payload = if self.kind == TierKind::Memory {
            Payload::Memory(vec![0u8; size as usize])
        } else {
            let path = self.block_file_path(id);
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            if let Err(e) = file.set_len(size) {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(e.into());
            }
            Payload::Disk(path)
        };

        state.blocks.insert(
            id,
            BlockHandle {
                capacity: size,
                payload,
            },
        );
        state.used_bytes += size;
        Ok(())
    }

    /// Read from a block at `offset`; reads past the allocated capacity are
    /// clamped. Returns the number of bytes read.
    pub fn read_block(&self, id: BlockId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let state = self.state.lock();
        let handle = state
            .blocks
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("block {id} not in tier {}", self.kind)))?;

        if offset >= handle.capacity {
            return Ok(0);
        }
        let len = buf.len().min((handle.capacity - offset) as usize);
        match &handle.payload {
            Payload::Memory(data) => {
                let start = offset as usize;
                buf[..len].copy_from_slice(&data[start..start + len]);
                Ok(len)
            }
            Payload::Disk(path) => {
                let file = fs::File::open(path)?;
                Ok(file.read_at(&mut buf[..len], offset)?)
            }
        }
    }

    /// Write to a block at `offset`; writes past the allocated capacity fail.
    pub fn write_block(&self, id: BlockId, buf: &[u8], offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        let handle = state
            .blocks
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("block {id} not in tier {}", self.kind)))?;

        if offset + buf.len() as u64 > handle.capacity {
            return Err(Error::invalid_argument(format!(
                "write exceeds capacity of block {id}"
            )));
        }
        match &mut handle.payload {
            Payload::Memory(data) => {
                let start = offset as usize;
                data[start..start + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            Payload::Disk(path) => {
                let file = OpenOptions::new().write(true).open(&*path)?;
                file.write_at(buf, offset)?;
                Ok(())
            }
        }
    }

    /// Release a block, freeing its full allocated capacity.
    pub fn remove_block(&self, id: BlockId) -> Result<()> {
        let mut state = self.state.lock();
        let handle = state
            .blocks
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("block {id} not in tier {}", self.kind)))?;
        state.used_bytes -= handle.capacity;
        if let Payload::Disk(path) = &handle.payload {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    /// Whether the tier currently holds the block.
    pub fn has_block(&self, id: BlockId) -> bool {
        self.state.lock().blocks.contains_key(&id)
    }

    /// Copy a block's full payload out (for tier migration).
    pub fn export_block(&self, id: BlockId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let handle = state
            .blocks
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("block {id} not in tier {}", self.kind)))?;
        match &handle.payload {
            Payload::Memory(data) => Ok(data.clone()),
            Payload::Disk(path) => {
                let file = fs::File::open(path)?;
                let mut data = vec![0u8; handle.capacity as usize];
                let n = file.read_at(&mut data, 0)?;
                data.truncate(n);
                Ok(data)
            }
        }
    }

    /// Allocate a block and fill it with `data` (for tier migration).
    pub fn import_block(&self, id: BlockId, data: &[u8]) -> Result<()> {
        self.allocate_block(id, data.len() as u64)?;
        self.write_block(id, data, 0)
    }

    /// Re-adopt a block whose file survived a restart. Memory tiers never
    /// recover blocks; disk tiers re-register the block file if it exists.
    /// Returns the block's allocated capacity.
    pub fn recover_block(&self, id: BlockId) -> Result<u64> {
        if self.kind == TierKind::Memory {
            return Err(Error::not_found(format!(
                "memory tier does not survive restart (block {id})"
            )));
        }
        let mut state = self.state.lock();
        if let Some(handle) = state.blocks.get(&id) {
            return Ok(handle.capacity);
        }
        let path = self.block_file_path(id);
        let meta = fs::metadata(&path)
            .map_err(|_| Error::not_found(format!("block file missing for {id}")))?;
        let capacity = meta.len();
        state.blocks.insert(
            id,
            BlockHandle {
                capacity,
                payload: Payload::Disk(path),
            },
        );
        state.used_bytes += capacity;
        Ok(capacity)
    }

    /// All block ids currently in the tier.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.state.lock().blocks.keys().copied().collect()
    }

    #[must_use]
    pub fn kind(&self) -> TierKind {
        self.kind
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.capacity - self.used_bytes()
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_file_path(&self, id: BlockId) -> PathBuf {
        self.root.join(format!("block_{}", id.raw()))
    }
}
