//! Asynchronous data mover
//!
//! A fixed worker pool consumes a FIFO queue of preload (UFS → block) and
//! persist (block → UFS) tasks. Submission order is preserved by the queue
//! but tasks execute in parallel. Task failures are logged and the task is
//! dropped; retry is the submitter's responsibility.

use crate::store::BlockStore;
use anycache_common::{BlockId, Error, Result};
use anycache_ufs::{CreateOptions, UnderFileSystem};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

enum TaskKind {
    Preload,
    Persist,
}

struct Task {
    kind: TaskKind,
    block_id: BlockId,
    ufs_path: String,
    offset_in_ufs: u64,
    length: u64,
    /// Per-task UFS; overrides the mover's default
    ufs: Option<Arc<dyn UnderFileSystem>>,
}

struct QueueState {
    tasks: VecDeque<Task>,
    in_flight: usize,
    running: bool,
}

struct Shared {
    block_store: Arc<BlockStore>,
    default_ufs: Option<Arc<dyn UnderFileSystem>>,
    state: Mutex<QueueState>,
    /// Signalled on task arrival and shutdown
    task_cv: Condvar,
    /// Signalled when the queue drains and nothing is in flight
    done_cv: Condvar,
}

/// Worker pool ferrying blocks between the block store and object stores.
pub struct DataMover {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DataMover {
    /// Spawn the worker pool. `default_ufs` serves tasks submitted without
    /// their own UFS; tasks carrying one always take precedence.
    pub fn new(
        block_store: Arc<BlockStore>,
        default_ufs: Option<Arc<dyn UnderFileSystem>>,
        num_threads: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            block_store,
            default_ufs,
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                in_flight: 0,
                running: true,
            }),
            task_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || worker_loop(&shared)));
        }
        info!(threads = num_threads, "data mover started");
        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Schedule a preload: read from the UFS into a cache block.
    pub fn submit_preload(
        &self,
        block_id: BlockId,
        ufs_path: impl Into<String>,
        offset_in_ufs: u64,
        length: u64,
    ) -> Result<()> {
        self.submit(Task {
            kind: TaskKind::Preload,
            block_id,
            ufs_path: ufs_path.into(),
            offset_in_ufs,
            length,
            ufs: None,
        })
    }

    /// Schedule a preload served by a task-specific UFS.
    pub fn submit_preload_with(
        &self,
        block_id: BlockId,
        ufs_path: impl Into<String>,
        offset_in_ufs: u64,
        length: u64,
        ufs: Arc<dyn UnderFileSystem>,
    ) -> Result<()> {
        self.submit(Task {
            kind: TaskKind::Preload,
            block_id,
            ufs_path: ufs_path.into(),
            offset_in_ufs,
            length,
            ufs: Some(ufs),
        })
    }

    /// Schedule a persist: write a cached block out to the UFS.
    pub fn submit_persist(
        &self,
        block_id: BlockId,
        ufs_path: impl Into<String>,
        offset_in_ufs: u64,
    ) -> Result<()> {
        self.submit(Task {
            kind: TaskKind::Persist,
            block_id,
            ufs_path: ufs_path.into(),
            offset_in_ufs,
            length: 0,
            ufs: None,
        })
    }

    /// Schedule a persist served by a task-specific UFS.
    pub fn submit_persist_with(
        &self,
        block_id: BlockId,
        ufs_path: impl Into<String>,
        offset_in_ufs: u64,
        ufs: Arc<dyn UnderFileSystem>,
    ) -> Result<()> {
        self.submit(Task {
            kind: TaskKind::Persist,
            block_id,
            ufs_path: ufs_path.into(),
            offset_in_ufs,
            length: 0,
            ufs: Some(ufs),
        })
    }

    /// Block until the queue is empty and no task is in flight.
    pub fn wait_all(&self) {
        let mut state = self.shared.state.lock();
        while !(state.tasks.is_empty() && state.in_flight == 0) {
            self.shared.done_cv.wait(&mut state);
        }
    }

    /// Stop the pool; queued tasks are still drained before threads exit.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.shared.task_cv.notify_all();
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn pending_task_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    fn submit(&self, task: Task) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return Err(Error::unavailable("data mover is stopped"));
            }
            state.tasks.push_back(task);
        }
        self.shared.task_cv.notify_one();
        Ok(())
    }
}

impl Drop for DataMover {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            while state.tasks.is_empty() && state.running {
                shared.task_cv.wait(&mut state);
            }
            let Some(task) = state.tasks.pop_front() else {
                // Queue drained and the mover is stopping
                return;
            };
            state.in_flight += 1;
            task
        };

        if let Err(e) = execute_task(shared, &task) {
            warn!(block = %task.block_id, path = %task.ufs_path, error = %e, "data mover task failed");
        }

        let mut state = shared.state.lock();
        state.in_flight -= 1;
        if state.tasks.is_empty() && state.in_flight == 0 {
            shared.done_cv.notify_all();
        }
    }
}

fn execute_task(shared: &Shared, task: &Task) -> Result<()> {
    let ufs = task
        .ufs
        .as_deref()
        .or(shared.default_ufs.as_deref())
        .ok_or_else(|| Error::internal("no UFS available for data mover task"))?;

    match task.kind {
        TaskKind::Preload => {
            let file = ufs.open(&task.ufs_path)?;
            let mut buf = vec![0u8; task.length as usize];
            let mut read = 0usize;
            while read < buf.len() {
                let n = file.read_at(&mut buf[read..], task.offset_in_ufs + read as u64)?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            buf.truncate(read);

            shared.block_store.ensure_block(task.block_id, read as u64)?;
            shared.block_store.write_block(task.block_id, &buf, 0)?;
            debug!(block = %task.block_id, bytes = read, path = %task.ufs_path, "preloaded block");
            Ok(())
        }
        TaskKind::Persist => {
            let meta = shared.block_store.block_meta(task.block_id)?;
            let mut buf = vec![0u8; meta.length as usize];
            let n = shared.block_store.read_block(task.block_id, &mut buf, 0)?;
            buf.truncate(n);

            let file = ufs.create(
                &task.ufs_path,
                &CreateOptions {
                    recursive: true,
                    ..Default::default()
                },
            )?;
            let written = file.write_at(&buf, task.offset_in_ufs)?;
            debug!(block = %task.block_id, bytes = written, path = %task.ufs_path, "persisted block");
            Ok(())
        }
    }
}
