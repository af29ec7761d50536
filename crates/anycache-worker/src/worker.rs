//! Worker facade
//!
//! The semantic layer behind the worker's RPC surface: block and page I/O,
//! synchronous and asynchronous caching, persistence, and status reporting.
//! The transport layer wraps these calls one-to-one and relays location
//! reports to the master.

use crate::mover::DataMover;
use crate::page::PageStore;
use crate::store::BlockStore;
use anycache_common::{BlockId, FileId, Result, TierKind, WorkerConfig};
use anycache_ufs::UnderFileSystem;
use bytes::Bytes;
use std::sync::Arc;

/// Capacity and usage of one tier, as reported in worker status.
#[derive(Clone, Copy, Debug)]
pub struct TierStatus {
    pub kind: TierKind,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Snapshot of a worker's storage state.
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub tiers: Vec<TierStatus>,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub block_count: u64,
}

/// A worker node's block engine, page cache, and data mover.
pub struct Worker {
    block_store: Arc<BlockStore>,
    page_store: Arc<PageStore>,
    data_mover: DataMover,
}

impl Worker {
    /// Assemble a worker from its configuration. `default_ufs` (if any)
    /// serves data-mover tasks that do not carry their own UFS.
    pub fn new(
        config: &WorkerConfig,
        default_ufs: Option<Arc<dyn UnderFileSystem>>,
    ) -> Result<Self> {
        let block_store = Arc::new(BlockStore::new(config.block_store.clone())?);
        let page_store = Arc::new(PageStore::new(config.page_size, config.max_pages));
        let data_mover = DataMover::new(
            Arc::clone(&block_store),
            default_ufs,
            config.data_mover_threads,
        );
        Ok(Self {
            block_store,
            page_store,
            data_mover,
        })
    }

    /// Read `length` bytes of a cached block at `offset`.
    pub fn read_block(&self, id: BlockId, offset: u64, length: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; length as usize];
        let n = self.block_store.read_block(id, &mut buf, offset)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Write into a block at `offset`, creating the block if absent.
    /// Returns the tier the block resides in, for location reporting.
    pub fn write_block(&self, id: BlockId, offset: u64, data: &[u8]) -> Result<TierKind> {
        self.block_store.ensure_block(id, data.len() as u64)?;
        self.block_store.write_block(id, data, offset)?;
        Ok(self
            .block_store
            .block_tier(id)
            .unwrap_or(TierKind::Memory))
    }

    /// Synchronously preload a block from a UFS. Returns the number of
    /// bytes cached.
    pub fn cache_block(
        &self,
        id: BlockId,
        ufs: &dyn UnderFileSystem,
        ufs_path: &str,
        offset_in_ufs: u64,
        length: u64,
    ) -> Result<u64> {
        let file = ufs.open(ufs_path)?;
        let mut buf = vec![0u8; length as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read_at(&mut buf[read..], offset_in_ufs + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);

        self.block_store.ensure_block(id, read as u64)?;
        self.block_store.write_block(id, &buf, 0)?;
        Ok(read as u64)
    }

    /// Enqueue a preload on the data mover; returns as soon as the task is
    /// queued.
    pub fn async_cache_block(
        &self,
        id: BlockId,
        ufs_path: &str,
        offset_in_ufs: u64,
        length: u64,
    ) -> Result<()> {
        self.data_mover
            .submit_preload(id, ufs_path, offset_in_ufs, length)
    }

    /// Enqueue a persist of a cached block to the UFS.
    pub fn persist_block(&self, id: BlockId, ufs_path: &str, offset_in_ufs: u64) -> Result<()> {
        self.data_mover.submit_persist(id, ufs_path, offset_in_ufs)
    }

    /// Remove a block; removing an absent block is a no-op.
    pub fn remove_block(&self, id: BlockId) -> Result<()> {
        self.block_store.remove_block(id)
    }

    /// Read one page through the page cache.
    pub fn read_page(&self, file_id: FileId, page_index: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; self.page_store.page_size()];
        let n = self.page_store.read_page(file_id, page_index, &mut buf)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Per-tier and aggregate storage statistics.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        let mut tiers = Vec::new();
        let mut capacity_bytes = 0;
        let mut used_bytes = 0;
        for kind in [TierKind::Memory, TierKind::Ssd, TierKind::Hdd] {
            let capacity = self.block_store.tier_capacity(kind);
            if capacity == 0 {
                continue;
            }
            let used = self.block_store.tier_used_bytes(kind);
            tiers.push(TierStatus {
                kind,
                capacity_bytes: capacity,
                used_bytes: used,
            });
            capacity_bytes += capacity;
            used_bytes += used;
        }
        WorkerStatus {
            tiers,
            capacity_bytes,
            used_bytes,
            block_count: self.block_store.cached_block_count() as u64,
        }
    }

    #[must_use]
    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    #[must_use]
    pub fn page_store(&self) -> &Arc<PageStore> {
        &self.page_store
    }

    #[must_use]
    pub fn data_mover(&self) -> &DataMover {
        &self.data_mover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anycache_common::{BlockStoreConfig, InodeId, TierConfig};
    use anycache_ufs::{CreateOptions, LocalUfs};
    use tempfile::TempDir;

    fn worker_with_ufs() -> (TempDir, Worker, Arc<LocalUfs>) {
        let dir = TempDir::new().unwrap();
        let ufs = Arc::new(LocalUfs::new(dir.path().join("ufs")).unwrap());
        let config = WorkerConfig {
            block_store: BlockStoreConfig {
                tiers: vec![TierConfig::memory(1 << 20)],
                ..Default::default()
            },
            page_size: 64,
            max_pages: 16,
            ..Default::default()
        };
        let worker = Worker::new(&config, Some(ufs.clone())).unwrap();
        (dir, worker, ufs)
    }

    fn bid(inode: u64, idx: u32) -> BlockId {
        BlockId::new(InodeId::new(inode), idx)
    }

    #[test]
    fn test_write_then_read_block() {
        let (_dir, worker, _ufs) = worker_with_ufs();
        let id = bid(1, 0);

        let tier = worker.write_block(id, 0, b"hello world").unwrap();
        assert_eq!(tier, TierKind::Memory);

        let data = worker.read_block(id, 0, 11).unwrap();
        assert_eq!(&data[..], b"hello world");

        // Offset read
        let tail = worker.read_block(id, 6, 5).unwrap();
        assert_eq!(&tail[..], b"world");
    }

    #[test]
    fn test_cache_block_sync() {
        let (_dir, worker, ufs) = worker_with_ufs();
        let file = ufs.create("seed.dat", &CreateOptions::default()).unwrap();
        file.write_at(b"cached bytes", 0).unwrap();
        drop(file);

        let id = bid(2, 0);
        let cached = worker
            .cache_block(id, ufs.as_ref(), "seed.dat", 0, 12)
            .unwrap();
        assert_eq!(cached, 12);
        assert_eq!(&worker.read_block(id, 0, 12).unwrap()[..], b"cached bytes");
    }

    #[test]
    fn test_async_cache_and_persist_roundtrip() {
        let (_dir, worker, ufs) = worker_with_ufs();
        let file = ufs.create("in.dat", &CreateOptions::default()).unwrap();
        file.write_at(b"round trip", 0).unwrap();
        drop(file);

        let id = bid(3, 0);
        worker.async_cache_block(id, "in.dat", 0, 10).unwrap();
        worker.data_mover().wait_all();
        assert_eq!(&worker.read_block(id, 0, 10).unwrap()[..], b"round trip");

        worker.persist_block(id, "out.dat", 0).unwrap();
        worker.data_mover().wait_all();
        let out = ufs.open("out.dat").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(out.read_at(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"round trip");
    }

    #[test]
    fn test_status_reports_tiers() {
        let (_dir, worker, _ufs) = worker_with_ufs();
        worker.write_block(bid(1, 0), 0, &[0u8; 512]).unwrap();

        let status = worker.status();
        assert_eq!(status.tiers.len(), 1);
        assert_eq!(status.tiers[0].kind, TierKind::Memory);
        assert_eq!(status.capacity_bytes, 1 << 20);
        assert_eq!(status.used_bytes, 512);
        assert_eq!(status.block_count, 1);
    }

    #[test]
    fn test_read_page_through_fetcher() {
        let (_dir, worker, _ufs) = worker_with_ufs();
        worker.page_store().set_page_fetcher(Box::new(|_f, idx, buf| {
            buf.fill(idx as u8);
            Ok(buf.len())
        }));

        let page = worker.read_page(InodeId::new(1), 2).unwrap();
        assert_eq!(page.len(), 64);
        assert!(page.iter().all(|b| *b == 2));
    }
}
