//! Configuration types for AnyCache
//!
//! These structs are the configuration contract between the engines and the
//! embedding process; file loading and flag parsing are the binary's concern.

use crate::types::{TierKind, DEFAULT_BLOCK_SIZE, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One storage tier of a worker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier medium
    pub kind: TierKind,
    /// Root directory for block files (unused for the memory tier)
    pub path: PathBuf,
    /// Capacity budget in bytes
    pub capacity_bytes: u64,
}

impl TierConfig {
    #[must_use]
    pub fn memory(capacity_bytes: u64) -> Self {
        Self {
            kind: TierKind::Memory,
            path: PathBuf::new(),
            capacity_bytes,
        }
    }

    #[must_use]
    pub fn disk(kind: TierKind, path: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            kind,
            path: path.into(),
            capacity_bytes,
        }
    }
}

/// Eviction policy selector for the worker cache manager
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicyKind {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
}

/// Block store tuning knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockStoreConfig {
    /// Storage tiers, any order; the store sorts fastest-first
    pub tiers: Vec<TierConfig>,
    /// Block metadata database file; `None` selects the in-memory fallback
    pub meta_db_path: Option<PathBuf>,
    /// Eviction policy
    pub cache_policy: CachePolicyKind,
    /// Promote a block to the next faster tier once it has been read this
    /// many times; 0 disables auto-promotion
    pub auto_promote_access_threshold: u64,
    /// Usage ratio above which a tier is proactively evicted
    pub auto_evict_high_watermark: f64,
    /// Usage ratio eviction drains the tier down to
    pub auto_evict_low_watermark: f64,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            meta_db_path: None,
            cache_policy: CachePolicyKind::default(),
            auto_promote_access_threshold: 3,
            auto_evict_high_watermark: 0.95,
            auto_evict_low_watermark: 0.80,
        }
    }
}

/// Worker process configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Address this worker advertises to the master
    pub address: String,
    /// Master endpoint for registration and heartbeats
    pub master_address: String,
    /// Block engine configuration
    pub block_store: BlockStoreConfig,
    /// Page cache page size in bytes
    pub page_size: usize,
    /// Page cache capacity in pages
    pub max_pages: usize,
    /// Default block size for newly cached files
    pub block_size: u64,
    /// DataMover worker-pool size
    pub data_mover_threads: usize,
    /// Heartbeat send interval in milliseconds
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:29999".to_string(),
            master_address: "localhost:19999".to_string(),
            block_store: BlockStoreConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            data_mover_threads: 2,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// Master process configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Listen address
    pub address: String,
    /// Inode database file; `None` runs the namespace purely in memory
    /// (no recovery across restarts)
    pub meta_db_path: Option<PathBuf>,
    /// Mount-table database file; `None` keeps mounts in memory
    pub mount_db_path: Option<PathBuf>,
    /// A worker missing heartbeats for longer than this is declared dead
    pub worker_heartbeat_timeout_ms: u64,
    /// Interval of the background heartbeat check
    pub heartbeat_check_interval_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:19999".to_string(),
            meta_db_path: None,
            mount_db_path: None,
            worker_heartbeat_timeout_ms: 30_000,
            heartbeat_check_interval_ms: 5_000,
        }
    }
}

/// RPC deadlines, per communication path.
///
/// Exceeding a deadline surfaces `Unavailable` or `DeadlineExceeded` to the
/// caller; server-side work runs to completion and its result is discarded.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Client to master (metadata operations, lightweight)
    pub master_rpc_timeout_ms: u64,
    /// Client to worker (block I/O, heavier)
    pub worker_rpc_timeout_ms: u64,
    /// Worker to master (register, heartbeat, location reports)
    pub internal_rpc_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            master_rpc_timeout_ms: 10_000,
            worker_rpc_timeout_ms: 30_000,
            internal_rpc_timeout_ms: 10_000,
        }
    }
}
