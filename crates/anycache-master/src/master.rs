//! Master facade
//!
//! The top-level coordinator behind the master's RPC surface: it combines
//! the inode tree, the block-location map, the worker registry, and the
//! mount table. Failed operations never leave partial state: truncation
//! drops obsolete block locations before shrinking the inode, deletion
//! drops them before removing the inode, and mounts persist before they
//! install.

use crate::inode::Inode;
use crate::location::BlockLocationMap;
use crate::mount::{MountTable, UfsFactory};
use crate::store::InodeStore;
use crate::tree::InodeTree;
use crate::workers::{WorkerManager, WorkerState};
use anycache_common::{
    block_count, BlockId, BlockLocation, InodeId, MasterConfig, Result, TierKind, WorkerId,
};
use anycache_ufs::UnderFileSystem;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// The master node's metadata engine.
pub struct FileSystemMaster {
    tree: InodeTree,
    locations: BlockLocationMap,
    workers: WorkerManager,
    mounts: MountTable,
}

impl FileSystemMaster {
    /// Assemble the master from its configuration. With a metadata path the
    /// namespace is durable and recovered on start; without one it lives in
    /// memory only.
    pub fn new(config: &MasterConfig, ufs_factory: UfsFactory) -> Result<Self> {
        let tree = match &config.meta_db_path {
            Some(path) => {
                let store = Arc::new(InodeStore::open(path)?);
                InodeTree::open(store)?
            }
            None => InodeTree::new(),
        };

        let mounts = match &config.mount_db_path {
            Some(path) => MountTable::open(path, ufs_factory)?,
            None => MountTable::new(ufs_factory),
        };

        info!(directories = tree.dir_count(), "file system master initialized");
        Ok(Self {
            tree,
            locations: BlockLocationMap::new(),
            workers: WorkerManager::new(config.worker_heartbeat_timeout_ms),
            mounts,
        })
    }

    // ── File operations ───────────────────────────────────────────────────

    pub fn get_file_info(&self, path: &str) -> Result<Inode> {
        self.tree.get_inode_by_path(path)
    }

    /// Create a file and pick a write target. Worker selection is
    /// best-effort: with no live worker the create still succeeds and the
    /// client writes once one arrives.
    pub fn create_file(&self, path: &str, mode: u32) -> Result<(InodeId, Option<WorkerId>)> {
        let id = self.tree.create_file(path, mode)?;
        let worker = self.workers.select_worker_for_write().ok();
        Ok((id, worker))
    }

    pub fn complete_file(&self, file_id: InodeId, size: u64) -> Result<()> {
        self.tree.complete_file(file_id, size)
    }

    /// Delete a file or directory. A file's block locations are dropped
    /// before the inode so no dangling locations outlive the namespace
    /// entry.
    pub fn delete_file(&self, path: &str, recursive: bool) -> Result<()> {
        if let Ok(inode) = self.tree.get_inode_by_path(path) {
            if !inode.is_directory {
                for index in 0..block_count(inode.size, inode.block_size) {
                    self.locations.remove_block(BlockId::new(inode.id, index));
                }
            }
        }
        self.tree.delete(path, recursive)
    }

    pub fn rename_file(&self, src: &str, dst: &str) -> Result<()> {
        self.tree.rename(src, dst)
    }

    pub fn list_status(&self, path: &str) -> Result<Vec<Inode>> {
        self.tree.list_directory(path)
    }

    /// Create a directory; creating an existing one succeeds silently.
    pub fn mkdir(&self, path: &str, mode: u32, recursive: bool) -> Result<()> {
        match self.tree.create_directory(path, mode, recursive) {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Truncate a file. When shrinking, block locations past the new end
    /// are removed first; the reverse order would expose dangling blocks.
    pub fn truncate_file(&self, path: &str, new_size: u64) -> Result<()> {
        let inode = self.tree.get_inode_by_path(path)?;
        if inode.is_directory {
            return Err(anycache_common::Error::invalid_argument(
                "cannot truncate a directory",
            ));
        }

        if new_size < inode.size {
            let new_blocks = block_count(new_size, inode.block_size);
            let old_blocks = block_count(inode.size, inode.block_size);
            for index in new_blocks..old_blocks {
                self.locations.remove_block(BlockId::new(inode.id, index));
            }
        }
        self.tree.update_size(inode.id, new_size)
    }

    // ── Block operations ──────────────────────────────────────────────────

    pub fn get_block_locations(&self, block_ids: &[BlockId]) -> Vec<BlockLocation> {
        self.locations.get_block_locations(block_ids)
    }

    pub fn report_block_location(
        &self,
        block_id: BlockId,
        worker_id: WorkerId,
        address: &str,
        tier: TierKind,
    ) {
        self.locations
            .add_block_location(block_id, worker_id, address, tier);
    }

    // ── Worker management ─────────────────────────────────────────────────

    pub fn register_worker(&self, address: &str, capacity: u64, used: u64) -> WorkerId {
        self.workers.register_worker(address, capacity, used)
    }

    pub fn worker_heartbeat(&self, id: WorkerId, capacity: u64, used: u64) -> Result<()> {
        self.workers.heartbeat(id, capacity, used)
    }

    /// One pass of the periodic liveness check: workers whose heartbeat
    /// lapsed are marked dead and their block locations dropped. Returns
    /// the newly dead ids.
    pub fn check_heartbeats(&self) -> Vec<WorkerId> {
        let dead = self.workers.check_heartbeats();
        for worker_id in &dead {
            self.locations.remove_worker_blocks(*worker_id);
        }
        dead
    }

    pub fn get_worker(&self, id: WorkerId) -> Result<WorkerState> {
        self.workers.get_worker(id)
    }

    // ── Mount operations ──────────────────────────────────────────────────

    pub fn mount(&self, anycache_path: &str, ufs_uri: &str) -> Result<()> {
        self.mounts.mount(anycache_path, ufs_uri)
    }

    pub fn unmount(&self, anycache_path: &str) -> Result<()> {
        self.mounts.unmount(anycache_path)
    }

    pub fn mount_points(&self) -> BTreeMap<String, String> {
        self.mounts.mount_points()
    }

    pub fn resolve_ufs(&self, anycache_path: &str) -> Result<(Arc<dyn UnderFileSystem>, String)> {
        self.mounts.resolve(anycache_path)
    }

    // ── Component access ──────────────────────────────────────────────────

    #[must_use]
    pub fn inode_tree(&self) -> &InodeTree {
        &self.tree
    }

    #[must_use]
    pub fn block_locations(&self) -> &BlockLocationMap {
        &self.locations
    }

    #[must_use]
    pub fn worker_manager(&self) -> &WorkerManager {
        &self.workers
    }

    #[must_use]
    pub fn mount_table(&self) -> &MountTable {
        &self.mounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anycache_common::Error;

    fn memory_master() -> FileSystemMaster {
        FileSystemMaster::new(&MasterConfig::default(), Box::new(|_| None)).unwrap()
    }

    #[test]
    fn test_create_complete_get() {
        let master = memory_master();
        master.mkdir("/data", 0o755, false).unwrap();
        let (id, worker) = master.create_file("/data/x", 0o644).unwrap();
        // No workers registered; create still succeeds
        assert!(worker.is_none());

        master.complete_file(id, 11).unwrap();
        let info = master.get_file_info("/data/x").unwrap();
        assert_eq!(info.size, 11);
        assert!(info.is_complete);
    }

    #[test]
    fn test_mkdir_idempotent() {
        let master = memory_master();
        master.mkdir("/d", 0o755, false).unwrap();
        master.mkdir("/d", 0o755, false).unwrap();
        assert!(master.get_file_info("/d").unwrap().is_directory);
    }

    #[test]
    fn test_create_file_selects_roomiest_worker() {
        let master = memory_master();
        master.register_worker("w1", 1000, 900);
        let roomy = master.register_worker("w2", 1000, 0);

        let (_, worker) = master.create_file("/f", 0o644).unwrap();
        assert_eq!(worker, Some(roomy));
    }

    #[test]
    fn test_delete_file_drops_block_locations() {
        let master = memory_master();
        let w = master.register_worker("w1", 1 << 30, 0);
        let (id, _) = master.create_file("/f", 0o644).unwrap();
        master.complete_file(id, 3 * 1024).unwrap();

        let inode = master.get_file_info("/f").unwrap();
        let blocks = block_count(inode.size, inode.block_size);
        assert_eq!(blocks, 1);
        for index in 0..blocks {
            master.report_block_location(BlockId::new(id, index), w, "w1", TierKind::Memory);
        }
        assert!(!master.get_block_locations(&[BlockId::new(id, 0)]).is_empty());

        master.delete_file("/f", false).unwrap();
        for index in 0..blocks {
            assert!(master
                .get_block_locations(&[BlockId::new(id, index)])
                .is_empty());
        }
        assert!(master.get_file_info("/f").unwrap_err().is_not_found());
        assert!(master.delete_file("/f", false).unwrap_err().is_not_found());
    }

    #[test]
    fn test_truncate_drops_trailing_blocks() {
        let master = memory_master();
        let w = master.register_worker("w1", 1 << 30, 0);
        let (id, _) = master.create_file("/f", 0o644).unwrap();

        let block_size = master.get_file_info("/f").unwrap().block_size;
        master.complete_file(id, 3 * block_size).unwrap();
        for index in 0..3 {
            master.report_block_location(BlockId::new(id, index), w, "w1", TierKind::Memory);
        }

        master.truncate_file("/f", block_size + 1).unwrap();
        assert_eq!(master.get_file_info("/f").unwrap().size, block_size + 1);
        // Blocks 0 and 1 survive; block 2 is gone
        assert_eq!(master.get_block_locations(&[BlockId::new(id, 0)]).len(), 1);
        assert_eq!(master.get_block_locations(&[BlockId::new(id, 1)]).len(), 1);
        assert!(master.get_block_locations(&[BlockId::new(id, 2)]).is_empty());

        assert!(matches!(
            master.truncate_file("/", 0).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_zero_size_file_has_no_blocks() {
        let master = memory_master();
        let (id, _) = master.create_file("/empty", 0o644).unwrap();
        master.complete_file(id, 0).unwrap();
        let inode = master.get_file_info("/empty").unwrap();
        assert_eq!(block_count(inode.size, inode.block_size), 0);
    }

    #[test]
    fn test_exact_multiple_block_count() {
        let master = memory_master();
        let (id, _) = master.create_file("/f", 0o644).unwrap();
        let block_size = master.get_file_info("/f").unwrap().block_size;
        master.complete_file(id, 4 * block_size).unwrap();
        let inode = master.get_file_info("/f").unwrap();
        assert_eq!(block_count(inode.size, inode.block_size), 4);
    }
}
