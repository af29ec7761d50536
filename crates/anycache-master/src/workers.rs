//! Worker registry and liveness
//!
//! Workers register once, then heartbeat; a background check flips workers
//! whose heartbeat lapsed past the timeout to dead and hands their ids to
//! the caller, which purges their block locations.

use anycache_common::{now_ms, Error, Result, WorkerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Registered worker state.
#[derive(Clone, Debug)]
pub struct WorkerState {
    pub id: WorkerId,
    pub address: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub last_heartbeat_ms: i64,
    pub alive: bool,
}

/// Registry of workers with heartbeat-driven liveness.
pub struct WorkerManager {
    workers: Mutex<HashMap<WorkerId, WorkerState>>,
    next_id: AtomicU64,
    heartbeat_timeout_ms: i64,
}

impl WorkerManager {
    #[must_use]
    pub fn new(heartbeat_timeout_ms: u64) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            heartbeat_timeout_ms: heartbeat_timeout_ms as i64,
        }
    }

    /// Register a worker. An address already on file is a re-registration:
    /// the existing entry is refreshed and revived under its original id.
    pub fn register_worker(&self, address: &str, capacity: u64, used: u64) -> WorkerId {
        let mut workers = self.workers.lock();

        if let Some(existing) = workers.values_mut().find(|w| w.address == address) {
            existing.capacity_bytes = capacity;
            existing.used_bytes = used;
            existing.last_heartbeat_ms = now_ms();
            existing.alive = true;
            info!(worker = %existing.id, address, "worker re-registered");
            return existing.id;
        }

        let id = WorkerId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        workers.insert(
            id,
            WorkerState {
                id,
                address: address.to_string(),
                capacity_bytes: capacity,
                used_bytes: used,
                last_heartbeat_ms: now_ms(),
                alive: true,
            },
        );
        info!(worker = %id, address, capacity_mb = capacity / (1024 * 1024), "worker registered");
        id
    }

    /// Refresh a worker's capacity and liveness; `NotFound` for unknown ids
    /// (the worker should re-register).
    pub fn heartbeat(&self, id: WorkerId, capacity: u64, used: u64) -> Result<()> {
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("worker {id} not registered")))?;
        worker.capacity_bytes = capacity;
        worker.used_bytes = used;
        worker.last_heartbeat_ms = now_ms();
        worker.alive = true;
        Ok(())
    }

    pub fn get_worker(&self, id: WorkerId) -> Result<WorkerState> {
        self.workers
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("worker {id} not found")))
    }

    /// Snapshot of all live workers.
    #[must_use]
    pub fn live_workers(&self) -> Vec<WorkerState> {
        self.workers
            .lock()
            .values()
            .filter(|w| w.alive)
            .cloned()
            .collect()
    }

    /// Pick the live worker with the most free space; `Unavailable` when
    /// none is live.
    pub fn select_worker_for_write(&self) -> Result<WorkerId> {
        let workers = self.workers.lock();
        let mut best = None;
        let mut best_available = 0u64;
        for worker in workers.values() {
            if !worker.alive {
                continue;
            }
            let available = worker.capacity_bytes.saturating_sub(worker.used_bytes);
            if available > best_available {
                best_available = available;
                best = Some(worker.id);
            }
        }
        best.ok_or_else(|| Error::unavailable("no workers available"))
    }

    /// Mark workers whose heartbeat lapsed as dead, returning their ids.
    /// Intended to run periodically; the caller drives location cleanup
    /// with the result.
    pub fn check_heartbeats(&self) -> Vec<WorkerId> {
        let mut workers = self.workers.lock();
        let now = now_ms();
        let mut dead = Vec::new();
        for worker in workers.values_mut() {
            if worker.alive && now - worker.last_heartbeat_ms > self.heartbeat_timeout_ms {
                worker.alive = false;
                dead.push(worker.id);
                warn!(worker = %worker.id, address = %worker.address, "worker heartbeat timeout");
            }
        }
        dead
    }

    /// Number of live workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().values().filter(|w| w.alive).count()
    }
}
