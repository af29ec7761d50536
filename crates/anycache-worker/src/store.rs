//! Tiered block store
//!
//! The block store coordinates the storage tiers, the cache manager, and
//! the meta store: placement picks the fastest tier with room, reads bump
//! access counters that drive auto-promotion, and writes above the high
//! watermark trigger proactive eviction. Lock order is block store → tier →
//! cache manager; the block store mutex only guards the block→tier map and
//! is never held across a tier operation.

use crate::cache::CacheManager;
use crate::meta::{open_meta_store, BlockMeta, MetaStore};
use crate::tier::StorageTier;
use anycache_common::{now_ms, BlockId, BlockStoreConfig, Error, Result, TierKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Coordinator over tiers, cache manager, and meta store.
pub struct BlockStore {
    config: BlockStoreConfig,
    /// Sorted fastest-first (Memory, then SSD, then HDD)
    tiers: Vec<StorageTier>,
    cache_mgr: CacheManager,
    meta_store: Box<dyn MetaStore>,
    block_tier_map: Mutex<HashMap<BlockId, TierKind>>,
}

impl BlockStore {
    pub fn new(config: BlockStoreConfig) -> Result<Self> {
        let mut tiers = Vec::with_capacity(config.tiers.len());
        for tc in &config.tiers {
            tiers.push(StorageTier::new(tc.kind, &tc.path, tc.capacity_bytes)?);
        }
        tiers.sort_by_key(StorageTier::kind);

        let cache_mgr = CacheManager::new(config.cache_policy);
        let meta_store = open_meta_store(config.meta_db_path.as_deref());
        Ok(Self {
            config,
            tiers,
            cache_mgr,
            meta_store,
            block_tier_map: Mutex::new(HashMap::new()),
        })
    }

    /// Create a block, placing it in the fastest tier with room. When no
    /// tier qualifies, evicts from the fastest tier and retries it.
    pub fn create_block(&self, id: BlockId, size: u64) -> Result<()> {
        let mut target = self
            .tiers
            .iter()
            .find(|tier| tier.available_bytes() >= size);

        if target.is_none() {
            let fastest = self
                .tiers
                .first()
                .ok_or_else(|| Error::internal("block store has no tiers"))?;
            self.evict_blocks(fastest.kind(), size)?;
            if fastest.available_bytes() < size {
                return Err(Error::resource_exhausted("no tier has enough space"));
            }
            target = Some(fastest);
        }
        let target = target.expect("target tier selected above");

        target.allocate_block(id, size)?;

        let now = now_ms();
        let meta = BlockMeta {
            block_id: id,
            length: size,
            tier: target.kind(),
            create_time_ms: now,
            last_access_time_ms: now,
            access_count: 0,
        };
        self.meta_store.put(&meta)?;

        self.block_tier_map.lock().insert(id, target.kind());
        self.cache_mgr.on_block_insert(id, size);

        self.maybe_auto_evict(target.kind());
        Ok(())
    }

    /// Create the block if absent; observable no-op if present.
    pub fn ensure_block(&self, id: BlockId, size: u64) -> Result<()> {
        if self.has_block(id) {
            return Ok(());
        }
        self.create_block(id, size)
    }

    /// Read from a cached block, updating its access statistics and possibly
    /// promoting it. Returns the number of bytes read.
    pub fn read_block(&self, id: BlockId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let tier = self
            .find_block_tier(id)
            .ok_or_else(|| Error::not_found(format!("block {id} not cached")))?;

        let n = tier.read_block(id, buf, offset)?;
        self.cache_mgr.on_block_access(id);

        if let Ok(mut meta) = self.meta_store.get(id) {
            meta.last_access_time_ms = now_ms();
            meta.access_count += 1;
            let _ = self.meta_store.put(&meta);
            self.maybe_auto_promote(id, &meta);
        }
        Ok(n)
    }

    /// Write into a cached block.
    pub fn write_block(&self, id: BlockId, buf: &[u8], offset: u64) -> Result<()> {
        let tier = self
            .find_block_tier(id)
            .ok_or_else(|| Error::not_found(format!("block {id} not cached")))?;

        tier.write_block(id, buf, offset)?;
        self.cache_mgr.on_block_access(id);
        Ok(())
    }

    /// Remove a block from its tier, the cache manager, and the meta store.
    /// Removing an absent block is a no-op.
    pub fn remove_block(&self, id: BlockId) -> Result<()> {
        if let Some(tier) = self.find_block_tier(id) {
            // The tier may already have dropped the block; that is fine here.
            if let Err(e) = tier.remove_block(id) {
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }
        self.cache_mgr.on_block_remove(id);
        self.meta_store.delete(id)?;
        self.block_tier_map.lock().remove(&id);
        Ok(())
    }

    /// Move a block to `target` tier. No-op if it is already there.
    ///
    /// Not crash-atomic: a crash between import and remove leaves two
    /// copies; recovery trusts the tier recorded in the meta store and the
    /// other copy is orphaned.
    pub fn promote_block(&self, id: BlockId, target: TierKind) -> Result<()> {
        let src = self
            .find_block_tier(id)
            .ok_or_else(|| Error::not_found(format!("block {id} not cached")))?;
        if src.kind() == target {
            return Ok(());
        }
        let dst = self
            .find_tier(target)
            .ok_or_else(|| Error::not_found(format!("tier {target} not configured")))?;

        let data = src.export_block(id)?;
        dst.import_block(id, &data)?;
        src.remove_block(id)?;

        if let Ok(mut meta) = self.meta_store.get(id) {
            meta.tier = target;
            let _ = self.meta_store.put(&meta);
        }
        self.block_tier_map.lock().insert(id, target);
        debug!(block = %id, tier = %target, "promoted block");
        Ok(())
    }

    /// Evict blocks from `tier` until roughly `bytes_needed` bytes are
    /// freed. Candidates the policy yields from other tiers are dropped
    /// from policy state without being evicted; the policy order is global,
    /// so this stays an acceptable approximation.
    pub fn evict_blocks(&self, tier: TierKind, bytes_needed: u64) -> Result<Vec<BlockId>> {
        let candidates = self.cache_mgr.eviction_candidates(bytes_needed);
        let mut evicted = Vec::new();
        for id in candidates {
            let in_tier = self.block_tier_map.lock().get(&id).copied() == Some(tier);
            if !in_tier {
                continue;
            }
            if let Some(t) = self.find_tier(tier) {
                let _ = t.remove_block(id);
            }
            self.meta_store.delete(id)?;
            self.block_tier_map.lock().remove(&id);
            evicted.push(id);
        }
        if !evicted.is_empty() {
            debug!(tier = %tier, count = evicted.len(), "evicted blocks");
        }
        Ok(evicted)
    }

    /// Rebuild the block index from the meta store after a restart. Blocks
    /// whose tier still holds their payload on disk are re-adopted; metadata
    /// of vanished blocks (e.g. the memory tier's) is deleted.
    pub fn recover(&self) -> Result<()> {
        let all_meta = self.meta_store.scan_all()?;
        let mut recovered = 0usize;
        for meta in all_meta {
            let adopted = self
                .find_tier(meta.tier)
                .and_then(|tier| tier.recover_block(meta.block_id).ok());
            match adopted {
                Some(_) => {
                    self.block_tier_map.lock().insert(meta.block_id, meta.tier);
                    self.cache_mgr.on_block_insert(meta.block_id, meta.length);
                    recovered += 1;
                }
                None => {
                    self.meta_store.delete(meta.block_id)?;
                }
            }
        }
        info!(recovered, "block store recovery complete");
        Ok(())
    }

    #[must_use]
    pub fn has_block(&self, id: BlockId) -> bool {
        self.block_tier_map.lock().contains_key(&id)
    }

    /// The tier currently holding a block.
    #[must_use]
    pub fn block_tier(&self, id: BlockId) -> Option<TierKind> {
        self.block_tier_map.lock().get(&id).copied()
    }

    pub fn block_meta(&self, id: BlockId) -> Result<BlockMeta> {
        self.meta_store.get(id)
    }

    #[must_use]
    pub fn tier_used_bytes(&self, tier: TierKind) -> u64 {
        self.find_tier(tier).map_or(0, StorageTier::used_bytes)
    }

    #[must_use]
    pub fn tier_capacity(&self, tier: TierKind) -> u64 {
        self.find_tier(tier).map_or(0, StorageTier::capacity)
    }

    #[must_use]
    pub fn total_cached_bytes(&self) -> u64 {
        self.cache_mgr.cached_bytes()
    }

    #[must_use]
    pub fn cached_block_count(&self) -> usize {
        self.cache_mgr.cached_block_count()
    }

    fn find_tier(&self, kind: TierKind) -> Option<&StorageTier> {
        self.tiers.iter().find(|t| t.kind() == kind)
    }

    fn find_block_tier(&self, id: BlockId) -> Option<&StorageTier> {
        let kind = *self.block_tier_map.lock().get(&id)?;
        self.find_tier(kind)
    }

    /// Promote a hot block one tier up once its access count crosses the
    /// threshold and the faster tier has room.
    fn maybe_auto_promote(&self, id: BlockId, meta: &BlockMeta) {
        if self.config.auto_promote_access_threshold == 0
            || meta.access_count < self.config.auto_promote_access_threshold
        {
            return;
        }
        let Some(current) = self.block_tier(id) else {
            return;
        };
        let Some(target) = current.faster() else {
            return;
        };
        let Some(dst) = self.find_tier(target) else {
            return;
        };
        if dst.available_bytes() < meta.length {
            return;
        }
        if let Err(e) = self.promote_block(id, target) {
            warn!(block = %id, tier = %target, error = %e, "auto-promotion failed");
        } else {
            debug!(
                block = %id,
                from = %current,
                to = %target,
                access_count = meta.access_count,
                "auto-promoted block"
            );
        }
    }

    /// Evict a tier down to the low watermark once it crosses the high one.
    fn maybe_auto_evict(&self, kind: TierKind) {
        let Some(tier) = self.find_tier(kind) else {
            return;
        };
        if tier.capacity() == 0 {
            return;
        }
        let usage = tier.used_bytes() as f64 / tier.capacity() as f64;
        if usage <= self.config.auto_evict_high_watermark {
            return;
        }
        let target_used = (tier.capacity() as f64 * self.config.auto_evict_low_watermark) as u64;
        let to_free = tier.used_bytes().saturating_sub(target_used);
        if to_free == 0 {
            return;
        }
        match self.evict_blocks(kind, to_free) {
            Ok(evicted) if !evicted.is_empty() => {
                debug!(
                    tier = %kind,
                    count = evicted.len(),
                    freed_hint = to_free,
                    "auto-evicted blocks above high watermark"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(tier = %kind, error = %e, "auto-eviction failed"),
        }
    }
}
