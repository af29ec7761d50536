//! Eviction policies and cache accounting
//!
//! The cache manager tracks the total cached size and delegates victim
//! selection to a pluggable policy (LRU or LFU). All methods are serialized
//! by one mutex.

use anycache_common::{config::CachePolicyKind, BlockId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Victim-selection policy. Implementations only order block ids; sizes are
/// the cache manager's concern.
trait EvictionPolicy: Send {
    fn on_insert(&mut self, id: BlockId);
    fn on_access(&mut self, id: BlockId);
    fn on_remove(&mut self, id: BlockId);
    /// Pop the next victim, or `None` if the policy is empty.
    fn evict(&mut self) -> Option<BlockId>;
    fn len(&self) -> usize;
}

/// Least-recently-used: a queue ordered least-recent-first.
#[derive(Default)]
struct LruPolicy {
    order: VecDeque<BlockId>,
    members: HashSet<BlockId>,
}

impl EvictionPolicy for LruPolicy {
    fn on_insert(&mut self, id: BlockId) {
        if !self.members.insert(id) {
            self.order.retain(|b| *b != id);
        }
        self.order.push_back(id);
    }

    fn on_access(&mut self, id: BlockId) {
        if self.members.contains(&id) {
            self.order.retain(|b| *b != id);
            self.order.push_back(id);
        }
    }

    fn on_remove(&mut self, id: BlockId) {
        if self.members.remove(&id) {
            self.order.retain(|b| *b != id);
        }
    }

    fn evict(&mut self) -> Option<BlockId> {
        let victim = self.order.pop_front()?;
        self.members.remove(&victim);
        Some(victim)
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// Least-frequently-used: frequency buckets, FIFO within a bucket.
#[derive(Default)]
struct LfuPolicy {
    freq_of: HashMap<BlockId, u64>,
    buckets: BTreeMap<u64, VecDeque<BlockId>>,
    min_freq: u64,
}

impl LfuPolicy {
    fn remove_from_bucket(&mut self, freq: u64, id: BlockId) {
        if let Some(bucket) = self.buckets.get_mut(&freq) {
            bucket.retain(|b| *b != id);
            if bucket.is_empty() {
                self.buckets.remove(&freq);
            }
        }
    }
}

impl EvictionPolicy for LfuPolicy {
    fn on_insert(&mut self, id: BlockId) {
        if self.freq_of.contains_key(&id) {
            self.on_access(id);
            return;
        }
        self.freq_of.insert(id, 1);
        self.buckets.entry(1).or_default().push_back(id);
        self.min_freq = 1;
    }

    fn on_access(&mut self, id: BlockId) {
        let Some(freq) = self.freq_of.get_mut(&id) else {
            return;
        };
        let old = *freq;
        let new = old + 1;
        *freq = new;

        self.remove_from_bucket(old, id);
        if self.min_freq == old && !self.buckets.contains_key(&old) {
            self.min_freq = new;
        }
        self.buckets.entry(new).or_default().push_back(id);
    }

    fn on_remove(&mut self, id: BlockId) {
        if let Some(freq) = self.freq_of.remove(&id) {
            self.remove_from_bucket(freq, id);
        }
    }

    fn evict(&mut self) -> Option<BlockId> {
        if self.freq_of.is_empty() {
            return None;
        }
        // min_freq may lag behind removals; resync to the smallest live bucket
        if !self.buckets.contains_key(&self.min_freq) {
            self.min_freq = *self.buckets.keys().next()?;
        }
        let bucket = self.buckets.get_mut(&self.min_freq)?;
        let victim = bucket.pop_front()?;
        if bucket.is_empty() {
            let freq = self.min_freq;
            self.buckets.remove(&freq);
        }
        self.freq_of.remove(&victim);
        Some(victim)
    }

    fn len(&self) -> usize {
        self.freq_of.len()
    }
}

struct CacheState {
    policy: Box<dyn EvictionPolicy>,
    sizes: HashMap<BlockId, u64>,
    total_cached_bytes: u64,
}

/// Size accounting plus pluggable victim selection for the block store.
pub struct CacheManager {
    state: Mutex<CacheState>,
}

impl CacheManager {
    #[must_use]
    pub fn new(policy: CachePolicyKind) -> Self {
        let policy: Box<dyn EvictionPolicy> = match policy {
            CachePolicyKind::Lru => Box::<LruPolicy>::default(),
            CachePolicyKind::Lfu => Box::<LfuPolicy>::default(),
        };
        Self {
            state: Mutex::new(CacheState {
                policy,
                sizes: HashMap::new(),
                total_cached_bytes: 0,
            }),
        }
    }

    pub fn on_block_insert(&self, id: BlockId, size: u64) {
        let mut state = self.state.lock();
        state.policy.on_insert(id);
        if let Some(old) = state.sizes.insert(id, size) {
            state.total_cached_bytes -= old;
        }
        state.total_cached_bytes += size;
    }

    pub fn on_block_access(&self, id: BlockId) {
        self.state.lock().policy.on_access(id);
    }

    pub fn on_block_remove(&self, id: BlockId) {
        let mut state = self.state.lock();
        state.policy.on_remove(id);
        if let Some(size) = state.sizes.remove(&id) {
            state.total_cached_bytes -= size;
        }
    }

    /// Pop victims until their cumulative remembered size reaches
    /// `bytes_needed` or the policy runs dry. Victims leave the policy and
    /// the size accounting immediately.
    pub fn eviction_candidates(&self, bytes_needed: u64) -> Vec<BlockId> {
        let mut state = self.state.lock();
        let mut victims = Vec::new();
        let mut freed = 0u64;
        while freed < bytes_needed && state.policy.len() > 0 {
            let Some(victim) = state.policy.evict() else {
                break;
            };
            if let Some(size) = state.sizes.remove(&victim) {
                freed += size;
                state.total_cached_bytes -= size;
            }
            victims.push(victim);
        }
        victims
    }

    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.state.lock().total_cached_bytes
    }

    #[must_use]
    pub fn cached_block_count(&self) -> usize {
        self.state.lock().sizes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anycache_common::InodeId;

    fn bid(n: u64) -> BlockId {
        BlockId::new(InodeId::new(n), 0)
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let mgr = CacheManager::new(CachePolicyKind::Lru);
        mgr.on_block_insert(bid(1), 100);
        mgr.on_block_insert(bid(2), 100);
        mgr.on_block_insert(bid(3), 100);
        mgr.on_block_access(bid(1));

        let victims = mgr.eviction_candidates(150);
        assert_eq!(victims, vec![bid(2), bid(3)]);
        assert_eq!(mgr.cached_bytes(), 100);
    }

    #[test]
    fn test_lru_reinsert_moves_to_back() {
        let mgr = CacheManager::new(CachePolicyKind::Lru);
        mgr.on_block_insert(bid(1), 10);
        mgr.on_block_insert(bid(2), 10);
        mgr.on_block_insert(bid(1), 10);

        assert_eq!(mgr.eviction_candidates(1), vec![bid(2)]);
        assert_eq!(mgr.cached_bytes(), 10);
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        // Three blocks of size 100: block 1 accessed three times, block 3
        // once; the lone victim for 100 bytes must be block 2.
        let mgr = CacheManager::new(CachePolicyKind::Lfu);
        for n in 1..=3 {
            mgr.on_block_insert(bid(n), 100);
        }
        for _ in 0..3 {
            mgr.on_block_access(bid(1));
        }
        mgr.on_block_access(bid(3));

        let victims = mgr.eviction_candidates(100);
        assert_eq!(victims, vec![bid(2)]);
    }

    #[test]
    fn test_lfu_fifo_within_bucket_and_min_freq_advance() {
        let mgr = CacheManager::new(CachePolicyKind::Lfu);
        mgr.on_block_insert(bid(1), 10);
        mgr.on_block_insert(bid(2), 10);
        mgr.on_block_access(bid(1));
        mgr.on_block_access(bid(2));

        // Both at frequency 2; FIFO order breaks the tie
        assert_eq!(mgr.eviction_candidates(5), vec![bid(1)]);
        assert_eq!(mgr.eviction_candidates(5), vec![bid(2)]);
        assert!(mgr.eviction_candidates(5).is_empty());
    }

    #[test]
    fn test_remove_keeps_accounting() {
        let mgr = CacheManager::new(CachePolicyKind::Lru);
        mgr.on_block_insert(bid(1), 100);
        mgr.on_block_insert(bid(2), 50);
        assert_eq!(mgr.cached_bytes(), 150);
        assert_eq!(mgr.cached_block_count(), 2);

        mgr.on_block_remove(bid(1));
        assert_eq!(mgr.cached_bytes(), 50);
        assert_eq!(mgr.cached_block_count(), 1);

        // Removing an unknown block is a no-op
        mgr.on_block_remove(bid(9));
        assert_eq!(mgr.cached_bytes(), 50);
    }

    #[test]
    fn test_candidates_stop_when_policy_empty() {
        let mgr = CacheManager::new(CachePolicyKind::Lfu);
        mgr.on_block_insert(bid(1), 10);
        let victims = mgr.eviction_candidates(1_000_000);
        assert_eq!(victims, vec![bid(1)]);
        assert_eq!(mgr.cached_bytes(), 0);
    }
}
