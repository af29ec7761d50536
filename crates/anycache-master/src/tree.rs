//! The namespace tree
//!
//! Two operating modes:
//!   1. Pure memory (no store): every inode lives in `dir_inodes`; nothing
//!      survives a restart. Used by tests and embedded setups.
//!   2. Two-tier (with an [`InodeStore`]): directories (with their children
//!      maps) stay in memory, files live in the store and are faulted in on
//!      demand. Recovery reloads all directories and replays every edge
//!      into its parent's children map.
//!
//! Reads share the tree lock; mutations take it exclusively, commit their
//! store batch first, and only then update the in-memory view, so the
//! memory image never drifts ahead of the persisted one.

use crate::inode::Inode;
use crate::store::{InodeBatch, InodeStore};
use anycache_common::{now_ms, Error, InodeId, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Ids are persisted in batches of this size; a restart skips at most one
/// batch worth of ids.
const ID_ALLOC_BATCH: u64 = 1000;

struct TreeState {
    dir_inodes: HashMap<InodeId, Inode>,
    /// Upper bound of the persisted id reservation; `next_id <= alloc_end`
    alloc_end: u64,
}

/// The file system namespace.
pub struct InodeTree {
    state: RwLock<TreeState>,
    store: Option<Arc<InodeStore>>,
    next_id: AtomicU64,
}

impl InodeTree {
    /// Pure-memory tree with a fresh root.
    #[must_use]
    pub fn new() -> Self {
        let mut dir_inodes = HashMap::new();
        dir_inodes.insert(InodeId::ROOT, Inode::root(now_ms()));
        Self {
            state: RwLock::new(TreeState {
                dir_inodes,
                alloc_end: 2,
            }),
            store: None,
            next_id: AtomicU64::new(2),
        }
    }

    /// Two-tier tree backed by `store`; recovers the namespace immediately.
    pub fn open(store: Arc<InodeStore>) -> Result<Self> {
        let tree = Self {
            state: RwLock::new(TreeState {
                dir_inodes: HashMap::new(),
                alloc_end: 2,
            }),
            store: Some(store),
            next_id: AtomicU64::new(2),
        };
        tree.recover()?;
        Ok(tree)
    }

    /// Rebuild the in-memory directory map from the store: all directory
    /// inodes, then every edge (file or directory) into its parent's
    /// children map, then the id counter. First start persists the root.
    pub fn recover(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let mut state = self.state.write();
        state.dir_inodes.clear();

        for dir in store.scan_directory_inodes()? {
            state.dir_inodes.insert(dir.id, dir);
        }

        for (parent_id, name, child_id) in store.scan_all_edges()? {
            if let Some(parent) = state.dir_inodes.get_mut(&parent_id) {
                parent.children.insert(name, child_id);
            }
        }

        match store.get_next_id() {
            Ok(next) if next > 0 => {
                self.next_id.store(next, Ordering::SeqCst);
                state.alloc_end = next;
            }
            _ => {
                // Fall back to the highest loaded directory id
                let max_id = state
                    .dir_inodes
                    .keys()
                    .map(|id| id.raw())
                    .max()
                    .unwrap_or(1);
                self.next_id.store(max_id + 1, Ordering::SeqCst);
                state.alloc_end = max_id + 1;
            }
        }

        if !state.dir_inodes.contains_key(&InodeId::ROOT) {
            let root = Inode::root(now_ms());
            let mut batch = InodeBatch::default();
            store.batch_put_inode(&mut batch, InodeId::ROOT, &root);
            store.commit_batch(batch)?;
            state.dir_inodes.insert(InodeId::ROOT, root);
        }

        info!(directories = state.dir_inodes.len(), "inode tree recovered");
        Ok(())
    }

    // ── Read operations ───────────────────────────────────────────────────

    pub fn get_inode_by_path(&self, path: &str) -> Result<Inode> {
        let state = self.state.read();
        let id = Self::resolve_path_locked(&state, path)?;
        if let Some(inode) = state.dir_inodes.get(&id) {
            return Ok(inode.clone());
        }
        match &self.store {
            Some(store) => store.get_inode(id),
            None => Err(Error::not_found(format!("inode missing for {path}"))),
        }
    }

    pub fn get_inode_by_id(&self, id: InodeId) -> Result<Inode> {
        let state = self.state.read();
        if let Some(inode) = state.dir_inodes.get(&id) {
            return Ok(inode.clone());
        }
        match &self.store {
            Some(store) => store.get_inode(id),
            None => Err(Error::not_found(format!("inode {id} not found"))),
        }
    }

    /// Children of a directory: directories come from memory; in two-tier
    /// mode file children are fetched from the store in one batched lookup.
    pub fn list_directory(&self, path: &str) -> Result<Vec<Inode>> {
        let state = self.state.read();
        let id = Self::resolve_path_locked(&state, path)?;

        let dir = state
            .dir_inodes
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("directory not found: {path}")))?;
        if !dir.is_directory {
            return Err(Error::invalid_argument(format!("not a directory: {path}")));
        }

        let mut children = Vec::with_capacity(dir.children.len());
        let mut file_ids = Vec::new();
        for child_id in dir.children.values() {
            if let Some(child) = state.dir_inodes.get(child_id) {
                children.push(child.clone());
            } else {
                file_ids.push(*child_id);
            }
        }

        if let Some(store) = &self.store {
            children.extend(store.multi_get_inodes(&file_ids)?);
        }
        Ok(children)
    }

    #[must_use]
    pub fn root_id(&self) -> InodeId {
        InodeId::ROOT
    }

    /// Number of directories resident in memory (root included).
    #[must_use]
    pub fn dir_count(&self) -> usize {
        self.state.read().dir_inodes.len()
    }

    // ── Write operations ──────────────────────────────────────────────────

    /// Create a file inode; parent directories must already exist.
    pub fn create_file(&self, path: &str, mode: u32) -> Result<InodeId> {
        let parts = Self::split_path(path);
        let Some((file_name, parent_parts)) = parts.split_last() else {
            return Err(Error::invalid_argument("empty path"));
        };

        let mut state = self.state.write();
        let parent_id = Self::resolve_dir_chain(&state, parent_parts)?;

        {
            let parent = state
                .dir_inodes
                .get(&parent_id)
                .filter(|p| p.is_directory)
                .ok_or_else(|| Error::invalid_argument("parent is not a directory"))?;
            if parent.children.contains_key(*file_name) {
                return Err(Error::already_exists(format!("file already exists: {path}")));
            }
        }

        let new_id = self.allocate_id(&mut state);
        let now = now_ms();
        let inode = Inode {
            id: new_id,
            parent_id,
            name: (*file_name).to_string(),
            is_directory: false,
            mode,
            creation_time_ms: now,
            modification_time_ms: now,
            is_complete: false,
            ..Default::default()
        };

        if let Some(store) = &self.store {
            // Persist first, then update memory
            let mut batch = InodeBatch::default();
            store.batch_put_inode(&mut batch, new_id, &inode);
            store.batch_put_edge(&mut batch, parent_id, file_name, new_id);
            store.commit_batch(batch)?;

            let parent = state.dir_inodes.get_mut(&parent_id).expect("parent checked");
            parent.children.insert((*file_name).to_string(), new_id);
            // Files stay out of the in-memory map in two-tier mode
        } else {
            let parent = state.dir_inodes.get_mut(&parent_id).expect("parent checked");
            parent.children.insert((*file_name).to_string(), new_id);
            state.dir_inodes.insert(new_id, inode);
        }

        Ok(new_id)
    }

    /// Create a directory; with `recursive`, missing parents are created.
    /// Fails `AlreadyExists` if the full path already names a directory.
    pub fn create_directory(&self, path: &str, mode: u32, recursive: bool) -> Result<InodeId> {
        let parts = Self::split_path(path);
        if parts.is_empty() {
            return Ok(InodeId::ROOT);
        }

        let mut state = self.state.write();
        let mut current = InodeId::ROOT;

        for (i, part) in parts.iter().enumerate() {
            let node = state
                .dir_inodes
                .get(&current)
                .filter(|n| n.is_directory)
                .ok_or_else(|| Error::invalid_argument(format!("not a directory: {part}")))?;

            if let Some(&child_id) = node.children.get(*part) {
                current = child_id;
                if i + 1 == parts.len() {
                    return Err(Error::already_exists(format!("directory exists: {path}")));
                }
                continue;
            }

            if !recursive && i + 1 < parts.len() {
                return Err(Error::not_found(format!("parent not found: {part}")));
            }

            let new_id = self.allocate_id(&mut state);
            let now = now_ms();
            let dir = Inode {
                id: new_id,
                parent_id: current,
                name: (*part).to_string(),
                is_directory: true,
                mode,
                creation_time_ms: now,
                modification_time_ms: now,
                ..Default::default()
            };

            if let Some(store) = &self.store {
                let mut batch = InodeBatch::default();
                store.batch_put_inode(&mut batch, new_id, &dir);
                store.batch_put_edge(&mut batch, current, part, new_id);
                store.commit_batch(batch)?;
            }

            state
                .dir_inodes
                .get_mut(&current)
                .expect("walked through existing directory")
                .children
                .insert((*part).to_string(), new_id);
            state.dir_inodes.insert(new_id, dir);
            current = new_id;
        }

        Ok(current)
    }

    /// Mark a file complete with its final size.
    pub fn complete_file(&self, id: InodeId, size: u64) -> Result<()> {
        let mut state = self.state.write();

        if let Some(store) = &self.store {
            let mut inode = match store.get_inode(id) {
                Ok(inode) => inode,
                Err(e) if e.is_not_found() => {
                    return if state.dir_inodes.contains_key(&id) {
                        Err(Error::invalid_argument("cannot complete a directory"))
                    } else {
                        Err(Error::not_found(format!("file {id} not found")))
                    };
                }
                Err(e) => return Err(e),
            };
            if inode.is_directory {
                return Err(Error::invalid_argument("cannot complete a directory"));
            }
            inode.size = size;
            inode.is_complete = true;
            inode.modification_time_ms = now_ms();

            let mut batch = InodeBatch::default();
            store.batch_put_inode(&mut batch, id, &inode);
            return store.commit_batch(batch);
        }

        let inode = state
            .dir_inodes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("file {id} not found")))?;
        if inode.is_directory {
            return Err(Error::invalid_argument("cannot complete a directory"));
        }
        inode.size = size;
        inode.is_complete = true;
        inode.modification_time_ms = now_ms();
        Ok(())
    }

    /// Delete an inode; a non-empty directory needs `recursive`.
    pub fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let parts = Self::split_path(path);
        let Some((target_name, parent_parts)) = parts.split_last() else {
            return Err(Error::invalid_argument("cannot delete root"));
        };

        let mut state = self.state.write();
        let id = Self::resolve_path_locked(&state, path)?;

        let in_memory = state.dir_inodes.contains_key(&id);
        let parent_id = if in_memory {
            let inode = &state.dir_inodes[&id];
            if !inode.children.is_empty() && !recursive {
                return Err(Error::invalid_argument(format!(
                    "directory not empty: {path}"
                )));
            }
            inode.parent_id
        } else if self.store.is_some() {
            // A file known only to the store; its parent comes from the path
            Self::resolve_dir_chain(&state, parent_parts)?
        } else {
            return Err(Error::not_found(format!("inode missing for {path}")));
        };

        if let Some(store) = &self.store {
            let mut batch = InodeBatch::default();
            store.batch_delete_inode(&mut batch, id);
            store.batch_delete_edge(&mut batch, parent_id, target_name);

            let mut sub_dirs = Vec::new();
            if in_memory && recursive {
                let mut sub_edges = Vec::new();
                let mut sub_inodes = Vec::new();
                Self::collect_subtree(&state, id, &mut sub_edges, &mut sub_inodes, &mut sub_dirs);
                for (pid, name) in &sub_edges {
                    store.batch_delete_edge(&mut batch, *pid, name);
                }
                for iid in &sub_inodes {
                    store.batch_delete_inode(&mut batch, *iid);
                }
            }

            store.commit_batch(batch)?;

            if let Some(parent) = state.dir_inodes.get_mut(&parent_id) {
                parent.children.remove(*target_name);
            }
            for dir_id in sub_dirs {
                state.dir_inodes.remove(&dir_id);
            }
            state.dir_inodes.remove(&id);
        } else {
            let name = state.dir_inodes[&id].name.clone();
            if let Some(parent) = state.dir_inodes.get_mut(&parent_id) {
                parent.children.remove(&name);
            }
            let mut to_remove = vec![id];
            while let Some(rid) = to_remove.pop() {
                if let Some(inode) = state.dir_inodes.remove(&rid) {
                    to_remove.extend(inode.children.values().copied());
                }
            }
        }

        Ok(())
    }

    /// Move an inode to a new parent and/or name. A renamed directory keeps
    /// its children; only the parent pointer and name change.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src_parts = Self::split_path(src);
        let dst_parts = Self::split_path(dst);
        let (Some((src_name, src_parent_parts)), Some((dst_name, dst_parent_parts))) =
            (src_parts.split_last(), dst_parts.split_last())
        else {
            return Err(Error::invalid_argument("invalid rename path"));
        };

        let mut state = self.state.write();
        let src_id = Self::resolve_path_locked(&state, src)?;
        let dst_parent_id = Self::resolve_dir_chain(&state, dst_parent_parts)?;

        {
            let new_parent = state
                .dir_inodes
                .get(&dst_parent_id)
                .ok_or_else(|| Error::not_found("destination parent missing"))?;
            if !new_parent.is_directory {
                return Err(Error::invalid_argument(
                    "destination parent is not a directory",
                ));
            }
            if new_parent.children.contains_key(*dst_name) {
                return Err(Error::already_exists(format!("destination exists: {dst}")));
            }
        }

        let is_dir = state.dir_inodes.contains_key(&src_id);
        let (old_parent_id, old_name) = if is_dir {
            let inode = &state.dir_inodes[&src_id];
            (inode.parent_id, inode.name.clone())
        } else if self.store.is_some() {
            (
                Self::resolve_dir_chain(&state, src_parent_parts)?,
                (*src_name).to_string(),
            )
        } else {
            return Err(Error::not_found(format!("inode missing for {src}")));
        };

        if let Some(store) = &self.store {
            let mut inode = if is_dir {
                state.dir_inodes[&src_id].clone()
            } else {
                store.get_inode(src_id)?
            };
            inode.parent_id = dst_parent_id;
            inode.name = (*dst_name).to_string();

            let mut batch = InodeBatch::default();
            store.batch_put_inode(&mut batch, src_id, &inode);
            store.batch_delete_edge(&mut batch, old_parent_id, &old_name);
            store.batch_put_edge(&mut batch, dst_parent_id, dst_name, src_id);
            store.commit_batch(batch)?;
        }

        if let Some(old_parent) = state.dir_inodes.get_mut(&old_parent_id) {
            old_parent.children.remove(&old_name);
        }
        state
            .dir_inodes
            .get_mut(&dst_parent_id)
            .expect("destination parent checked")
            .children
            .insert((*dst_name).to_string(), src_id);
        if is_dir {
            let inode = state.dir_inodes.get_mut(&src_id).expect("source is resident");
            inode.parent_id = dst_parent_id;
            inode.name = (*dst_name).to_string();
        }

        Ok(())
    }

    /// Update a file's size (truncate/extend bookkeeping).
    pub fn update_size(&self, id: InodeId, new_size: u64) -> Result<()> {
        let mut state = self.state.write();

        if let Some(store) = &self.store {
            if let Some(inode) = state.dir_inodes.get_mut(&id) {
                inode.size = new_size;
                inode.modification_time_ms = now_ms();
                let inode = inode.clone();
                let mut batch = InodeBatch::default();
                store.batch_put_inode(&mut batch, id, &inode);
                return store.commit_batch(batch);
            }
            let mut inode = store.get_inode(id)?;
            inode.size = new_size;
            inode.modification_time_ms = now_ms();
            let mut batch = InodeBatch::default();
            store.batch_put_inode(&mut batch, id, &inode);
            return store.commit_batch(batch);
        }

        let inode = state
            .dir_inodes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("inode {id} not found")))?;
        inode.size = new_size;
        inode.modification_time_ms = now_ms();
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    fn split_path(path: &str) -> Vec<&str> {
        path.split('/').filter(|p| !p.is_empty()).collect()
    }

    /// Resolve a full path to an inode id. Every intermediate component
    /// must be a resident directory.
    fn resolve_path_locked(state: &TreeState, path: &str) -> Result<InodeId> {
        let mut current = InodeId::ROOT;
        for part in Self::split_path(path) {
            let node = state
                .dir_inodes
                .get(&current)
                .ok_or_else(|| Error::not_found(format!("inode missing for {path}")))?;
            if !node.is_directory {
                return Err(Error::invalid_argument(format!("not a directory: {part}")));
            }
            current = *node
                .children
                .get(part)
                .ok_or_else(|| Error::not_found(format!("path not found: {path}")))?;
        }
        Ok(current)
    }

    /// Walk a chain of directory components from the root.
    fn resolve_dir_chain(state: &TreeState, parts: &[&str]) -> Result<InodeId> {
        let mut current = InodeId::ROOT;
        for part in parts {
            let node = state
                .dir_inodes
                .get(&current)
                .ok_or_else(|| Error::not_found("parent missing"))?;
            current = *node
                .children
                .get(*part)
                .ok_or_else(|| Error::not_found(format!("parent directory not found: {part}")))?;
        }
        Ok(current)
    }

    /// Next inode id. Crossing a reservation boundary persists a new
    /// `alloc_end` best-effort; ids are never reused within a reservation.
    fn allocate_id(&self, state: &mut TreeState) -> InodeId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Some(store) = &self.store {
            if id >= state.alloc_end {
                state.alloc_end = id + ID_ALLOC_BATCH;
                let mut batch = InodeBatch::default();
                store.batch_put_next_id(&mut batch, state.alloc_end);
                if let Err(e) = store.commit_batch(batch) {
                    warn!(error = %e, "failed to persist id reservation");
                }
            }
        }
        InodeId::new(id)
    }

    /// DFS over the resident directory map collecting everything below
    /// `dir_id`: each edge, every inode id, and the ids of resident
    /// directories (for memory cleanup).
    fn collect_subtree(
        state: &TreeState,
        dir_id: InodeId,
        edges: &mut Vec<(InodeId, String)>,
        inode_ids: &mut Vec<InodeId>,
        dir_ids: &mut Vec<InodeId>,
    ) {
        let Some(dir) = state.dir_inodes.get(&dir_id) else {
            return;
        };
        for (name, child_id) in &dir.children {
            edges.push((dir_id, name.clone()));
            inode_ids.push(*child_id);
            if state.dir_inodes.contains_key(child_id) {
                dir_ids.push(*child_id);
                Self::collect_subtree(state, *child_id, edges, inode_ids, dir_ids);
            }
        }
    }
}

impl Default for InodeTree {
    fn default() -> Self {
        Self::new()
    }
}
