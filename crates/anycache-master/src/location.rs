//! Block-location tracking
//!
//! A dual index over worker block reports: `block → locations` for reads
//! and `worker → blocks` so a worker death invalidates all of its blocks in
//! one pass. Both indexes stay in sync under one mutex; block locations are
//! eventually consistent with the workers' actual contents.

use anycache_common::{BlockId, BlockLocation, TierKind, WorkerId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Default)]
struct LocationState {
    block_locations: HashMap<BlockId, Vec<BlockLocation>>,
    worker_blocks: HashMap<WorkerId, BTreeSet<BlockId>>,
}

/// Reverse map `BlockId ↔ worker` fed by location reports.
#[derive(Default)]
pub struct BlockLocationMap {
    state: Mutex<LocationState>,
}

impl BlockLocationMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All known locations for the given blocks, in request order.
    #[must_use]
    pub fn get_block_locations(&self, block_ids: &[BlockId]) -> Vec<BlockLocation> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for id in block_ids {
            if let Some(locations) = state.block_locations.get(id) {
                out.extend(locations.iter().cloned());
            }
        }
        out
    }

    /// Record that `worker_id` holds `block_id`. A re-report from the same
    /// worker only refreshes the tier.
    pub fn add_block_location(
        &self,
        block_id: BlockId,
        worker_id: WorkerId,
        address: &str,
        tier: TierKind,
    ) {
        let mut state = self.state.lock();
        let locations = state.block_locations.entry(block_id).or_default();
        if let Some(existing) = locations.iter_mut().find(|l| l.worker_id == worker_id) {
            existing.tier = tier;
            return;
        }
        locations.push(BlockLocation {
            block_id,
            worker_id,
            worker_address: address.to_string(),
            tier,
        });
        state.worker_blocks.entry(worker_id).or_default().insert(block_id);
    }

    /// Forget one worker's copy of a block (e.g. after eviction).
    pub fn remove_block_location(&self, block_id: BlockId, worker_id: WorkerId) {
        let mut state = self.state.lock();
        if let Some(locations) = state.block_locations.get_mut(&block_id) {
            locations.retain(|l| l.worker_id != worker_id);
            if locations.is_empty() {
                state.block_locations.remove(&block_id);
            }
        }
        if let Some(blocks) = state.worker_blocks.get_mut(&worker_id) {
            blocks.remove(&block_id);
        }
    }

    /// Forget every location on a worker (the worker went down).
    pub fn remove_worker_blocks(&self, worker_id: WorkerId) {
        let mut state = self.state.lock();
        let Some(blocks) = state.worker_blocks.remove(&worker_id) else {
            return;
        };
        let count = blocks.len();
        for block_id in blocks {
            if let Some(locations) = state.block_locations.get_mut(&block_id) {
                locations.retain(|l| l.worker_id != worker_id);
                if locations.is_empty() {
                    state.block_locations.remove(&block_id);
                }
            }
        }
        debug!(worker = %worker_id, blocks = count, "dropped block locations of dead worker");
    }

    /// Forget every location of a block (the block was deleted).
    pub fn remove_block(&self, block_id: BlockId) {
        let mut state = self.state.lock();
        let Some(locations) = state.block_locations.remove(&block_id) else {
            return;
        };
        for location in locations {
            if let Some(blocks) = state.worker_blocks.get_mut(&location.worker_id) {
                blocks.remove(&block_id);
            }
        }
    }

    /// All blocks reported by a worker, in id order.
    #[must_use]
    pub fn worker_blocks(&self, worker_id: WorkerId) -> Vec<BlockId> {
        self.state
            .lock()
            .worker_blocks
            .get(&worker_id)
            .map(|blocks| blocks.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of cached copies known for a block.
    #[must_use]
    pub fn replica_count(&self, block_id: BlockId) -> usize {
        self.state
            .lock()
            .block_locations
            .get(&block_id)
            .map_or(0, Vec::len)
    }
}
