//! Persistent inode store
//!
//! Two redb tables back the namespace:
//!   - `inodes`: `InodeId` (8B big-endian) → entry binary (header + name)
//!   - `edges`:  `BE(parent_id) ‖ child_name` → `BE(child_id)`
//!
//! The owner/group dictionaries and the next-id counter live at reserved
//! high keys of the inodes table. All mutations go through [`InodeBatch`];
//! a batch commits atomically inside one write transaction.

use crate::entry::{
    decode_edge_key, decode_edge_value, decode_inode_key, decode_next_id_value,
    deserialize_inode_entry, encode_edge_key, encode_inode_key, encode_next_id_value,
    encode_u64_be, serialize_inode_entry, ENTRY_FLAGS_OFFSET, ENTRY_FLAG_DIRECTORY,
    ENTRY_HEADER_LEN, GROUP_DICT_KEY, NEXT_ID_KEY, OWNER_DICT_KEY,
};
use crate::entry::{encode_edge_value, OwnerGroupDict};
use crate::inode::Inode;
use anycache_common::{Error, InodeId, Result};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use tracing::info;

const INODES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("inodes");
const EDGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("edges");

enum BatchOp {
    PutInode { key: [u8; 8], value: Vec<u8> },
    DeleteInode { key: [u8; 8] },
    PutEdge { key: Vec<u8>, value: [u8; 8] },
    DeleteEdge { key: Vec<u8> },
    PutNextId { value: [u8; 8] },
    PutDicts { owners: Vec<u8>, groups: Vec<u8> },
}

/// A group of inode/edge mutations applied in one atomic commit.
#[derive(Default)]
pub struct InodeBatch {
    ops: Vec<BatchOp>,
}

impl InodeBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// redb-backed persistence for the master namespace.
pub struct InodeStore {
    db: Database,
    dict: Mutex<OwnerGroupDict>,
}

impl InodeStore {
    /// Open (or create) the store at `path` and load the owner/group
    /// dictionaries.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(Error::io)?;

        let wtx = db.begin_write().map_err(Error::io)?;
        wtx.open_table(INODES).map_err(Error::io)?;
        wtx.open_table(EDGES).map_err(Error::io)?;
        wtx.commit().map_err(Error::io)?;

        let mut dict = OwnerGroupDict::default();
        {
            let rtx = db.begin_read().map_err(Error::io)?;
            let table = rtx.open_table(INODES).map_err(Error::io)?;
            if let Some(value) = table
                .get(encode_u64_be(OWNER_DICT_KEY).as_slice())
                .map_err(Error::io)?
            {
                dict.load_owners(value.value());
            }
            if let Some(value) = table
                .get(encode_u64_be(GROUP_DICT_KEY).as_slice())
                .map_err(Error::io)?
            {
                dict.load_groups(value.value());
            }
        }
        dict.clear_dirty();

        info!(
            path = %path.display(),
            owners = dict.owner_count(),
            groups = dict.group_count(),
            "inode store opened"
        );
        Ok(Self {
            db,
            dict: Mutex::new(dict),
        })
    }

    // ── Runtime reads ─────────────────────────────────────────────────────

    /// Point lookup of a single inode; the name comes back from the entry's
    /// variable part, `children` stays empty.
    pub fn get_inode(&self, id: InodeId) -> Result<Inode> {
        let rtx = self.db.begin_read().map_err(Error::io)?;
        let table = rtx.open_table(INODES).map_err(Error::io)?;
        let value = table
            .get(encode_inode_key(id).as_slice())
            .map_err(Error::io)?
            .ok_or_else(|| Error::not_found(format!("inode {id} not found")))?;
        Ok(deserialize_inode_entry(id, value.value(), &self.dict.lock()))
    }

    /// Batched point lookup; absent ids are skipped.
    pub fn multi_get_inodes(&self, ids: &[InodeId]) -> Result<Vec<Inode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rtx = self.db.begin_read().map_err(Error::io)?;
        let table = rtx.open_table(INODES).map_err(Error::io)?;
        let dict = self.dict.lock();
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(value) = table
                .get(encode_inode_key(id).as_slice())
                .map_err(Error::io)?
            {
                out.push(deserialize_inode_entry(id, value.value(), &dict));
            }
        }
        Ok(out)
    }

    /// Read the durable next-id counter; `NotFound` if never persisted.
    pub fn get_next_id(&self) -> Result<u64> {
        let rtx = self.db.begin_read().map_err(Error::io)?;
        let table = rtx.open_table(INODES).map_err(Error::io)?;
        let value = table
            .get(encode_u64_be(NEXT_ID_KEY).as_slice())
            .map_err(Error::io)?
            .ok_or_else(|| Error::not_found("next_id not persisted"))?;
        let data = value.value();
        if data.len() < 8 {
            return Err(Error::io("next_id value truncated"));
        }
        Ok(decode_next_id_value(data))
    }

    // ── Batch construction ────────────────────────────────────────────────

    /// Stage an inode put. If this extends the owner/group dictionaries,
    /// their serialized form joins the same batch.
    pub fn batch_put_inode(&self, batch: &mut InodeBatch, id: InodeId, inode: &Inode) {
        let mut dict = self.dict.lock();
        let value = serialize_inode_entry(inode, &mut dict);
        batch.ops.push(BatchOp::PutInode {
            key: encode_inode_key(id),
            value,
        });
        if dict.is_dirty() {
            batch.ops.push(BatchOp::PutDicts {
                owners: dict.serialize_owners(),
                groups: dict.serialize_groups(),
            });
            dict.clear_dirty();
        }
    }

    pub fn batch_delete_inode(&self, batch: &mut InodeBatch, id: InodeId) {
        batch.ops.push(BatchOp::DeleteInode {
            key: encode_inode_key(id),
        });
    }

    pub fn batch_put_edge(
        &self,
        batch: &mut InodeBatch,
        parent_id: InodeId,
        child_name: &str,
        child_id: InodeId,
    ) {
        batch.ops.push(BatchOp::PutEdge {
            key: encode_edge_key(parent_id, child_name),
            value: encode_edge_value(child_id),
        });
    }

    pub fn batch_delete_edge(&self, batch: &mut InodeBatch, parent_id: InodeId, child_name: &str) {
        batch.ops.push(BatchOp::DeleteEdge {
            key: encode_edge_key(parent_id, child_name),
        });
    }

    pub fn batch_put_next_id(&self, batch: &mut InodeBatch, next_id: u64) {
        batch.ops.push(BatchOp::PutNextId {
            value: encode_next_id_value(next_id),
        });
    }

    /// Apply a batch atomically. Durability rides on the store's
    /// write-ahead log.
    pub fn commit_batch(&self, batch: InodeBatch) -> Result<()> {
        let wtx = self.db.begin_write().map_err(Error::io)?;
        {
            let mut inodes = wtx.open_table(INODES).map_err(Error::io)?;
            let mut edges = wtx.open_table(EDGES).map_err(Error::io)?;
            for op in &batch.ops {
                match op {
                    BatchOp::PutInode { key, value } => {
                        inodes
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(Error::io)?;
                    }
                    BatchOp::DeleteInode { key } => {
                        inodes.remove(key.as_slice()).map_err(Error::io)?;
                    }
                    BatchOp::PutEdge { key, value } => {
                        edges
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(Error::io)?;
                    }
                    BatchOp::DeleteEdge { key } => {
                        edges.remove(key.as_slice()).map_err(Error::io)?;
                    }
                    BatchOp::PutNextId { value } => {
                        inodes
                            .insert(encode_u64_be(NEXT_ID_KEY).as_slice(), value.as_slice())
                            .map_err(Error::io)?;
                    }
                    BatchOp::PutDicts { owners, groups } => {
                        inodes
                            .insert(encode_u64_be(OWNER_DICT_KEY).as_slice(), owners.as_slice())
                            .map_err(Error::io)?;
                        inodes
                            .insert(encode_u64_be(GROUP_DICT_KEY).as_slice(), groups.as_slice())
                            .map_err(Error::io)?;
                    }
                }
            }
        }
        wtx.commit().map_err(Error::io)?;
        Ok(())
    }

    // ── Recovery scans ────────────────────────────────────────────────────

    /// Scan the inodes table, returning only directory inodes. Reserved
    /// keys and file entries are filtered on the flags byte without a full
    /// decode.
    pub fn scan_directory_inodes(&self) -> Result<Vec<Inode>> {
        let rtx = self.db.begin_read().map_err(Error::io)?;
        let table = rtx.open_table(INODES).map_err(Error::io)?;
        let dict = self.dict.lock();
        let mut out = Vec::new();
        for item in table.iter().map_err(Error::io)? {
            let (key, value) = item.map_err(Error::io)?;
            let key = key.value();
            if key.len() == 8 && decode_inode_key(key).raw() >= OWNER_DICT_KEY {
                continue;
            }
            let data = value.value();
            if data.len() >= ENTRY_HEADER_LEN && data[ENTRY_FLAGS_OFFSET] & ENTRY_FLAG_DIRECTORY != 0
            {
                out.push(deserialize_inode_entry(decode_inode_key(key), data, &dict));
            }
        }
        Ok(out)
    }

    /// Scan every edge as `(parent_id, child_name, child_id)`.
    pub fn scan_all_edges(&self) -> Result<Vec<(InodeId, String, InodeId)>> {
        let rtx = self.db.begin_read().map_err(Error::io)?;
        let table = rtx.open_table(EDGES).map_err(Error::io)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(Error::io)? {
            let (key, value) = item.map_err(Error::io)?;
            let key = key.value();
            let value = value.value();
            if key.len() < 8 || value.len() < 8 {
                continue;
            }
            let (parent_id, name) = decode_edge_key(key);
            out.push((parent_id, name, decode_edge_value(value)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> InodeStore {
        InodeStore::open(&dir.path().join("inodes.redb")).unwrap()
    }

    fn file_inode(id: u64, parent: u64, name: &str) -> Inode {
        Inode {
            id: InodeId::new(id),
            parent_id: InodeId::new(parent),
            name: name.to_string(),
            size: 100,
            owner: "root".to_string(),
            group: "root".to_string(),
            is_complete: true,
            ..Default::default()
        }
    }

    fn dir_inode(id: u64, parent: u64, name: &str) -> Inode {
        Inode {
            is_directory: true,
            mode: 0o755,
            ..file_inode(id, parent, name)
        }
    }

    #[test]
    fn test_put_get_inode() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let inode = file_inode(2, 1, "a.txt");
        let mut batch = InodeBatch::default();
        store.batch_put_inode(&mut batch, inode.id, &inode);
        store.batch_put_edge(&mut batch, InodeId::ROOT, "a.txt", inode.id);
        store.commit_batch(batch).unwrap();

        let restored = store.get_inode(InodeId::new(2)).unwrap();
        assert_eq!(restored.name, "a.txt");
        assert_eq!(restored.parent_id, InodeId::ROOT);
        assert_eq!(restored.owner, "root");

        assert!(store.get_inode(InodeId::new(99)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_multi_get_skips_missing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut batch = InodeBatch::default();
        for i in 2..5 {
            let inode = file_inode(i, 1, &format!("f{i}"));
            store.batch_put_inode(&mut batch, inode.id, &inode);
        }
        store.commit_batch(batch).unwrap();

        let got = store
            .multi_get_inodes(&[InodeId::new(3), InodeId::new(77), InodeId::new(4)])
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].name, "f3");
        assert_eq!(got[1].name, "f4");
    }

    #[test]
    fn test_next_id_counter() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.get_next_id().unwrap_err().is_not_found());

        let mut batch = InodeBatch::default();
        store.batch_put_next_id(&mut batch, 1002);
        store.commit_batch(batch).unwrap();
        assert_eq!(store.get_next_id().unwrap(), 1002);
    }

    #[test]
    fn test_scan_directory_inodes_filters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut batch = InodeBatch::default();
        let d1 = dir_inode(2, 1, "docs");
        let d2 = dir_inode(3, 2, "inner");
        let f1 = file_inode(4, 3, "leaf.txt");
        store.batch_put_inode(&mut batch, d1.id, &d1);
        store.batch_put_inode(&mut batch, d2.id, &d2);
        store.batch_put_inode(&mut batch, f1.id, &f1);
        store.batch_put_next_id(&mut batch, 5);
        store.commit_batch(batch).unwrap();

        let dirs = store.scan_directory_inodes().unwrap();
        let mut names: Vec<_> = dirs.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["docs", "inner"]);
    }

    #[test]
    fn test_scan_all_edges() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut batch = InodeBatch::default();
        store.batch_put_edge(&mut batch, InodeId::ROOT, "a", InodeId::new(2));
        store.batch_put_edge(&mut batch, InodeId::new(2), "b", InodeId::new(3));
        store.commit_batch(batch).unwrap();

        let mut edges = store.scan_all_edges().unwrap();
        edges.sort();
        assert_eq!(
            edges,
            vec![
                (InodeId::ROOT, "a".to_string(), InodeId::new(2)),
                (InodeId::new(2), "b".to_string(), InodeId::new(3)),
            ]
        );
    }

    #[test]
    fn test_edge_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut batch = InodeBatch::default();
        store.batch_put_edge(&mut batch, InodeId::ROOT, "gone", InodeId::new(2));
        store.commit_batch(batch).unwrap();

        let mut batch = InodeBatch::default();
        store.batch_delete_edge(&mut batch, InodeId::ROOT, "gone");
        store.commit_batch(batch).unwrap();
        assert!(store.scan_all_edges().unwrap().is_empty());
    }

    #[test]
    fn test_dict_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            let mut batch = InodeBatch::default();
            let inode = Inode {
                owner: "alice".to_string(),
                group: "eng".to_string(),
                ..file_inode(2, 1, "owned")
            };
            store.batch_put_inode(&mut batch, inode.id, &inode);
            store.commit_batch(batch).unwrap();
        }

        let store = open_store(&dir);
        let restored = store.get_inode(InodeId::new(2)).unwrap();
        assert_eq!(restored.owner, "alice");
        assert_eq!(restored.group, "eng");
    }
}
