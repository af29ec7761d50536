//! Binary codecs for persisted inode state
//!
//! Keys use big-endian encoding so lexicographic order in the store equals
//! numeric id order, matching the worker meta store's block-id keys. Inode
//! entry values are a fixed 48-byte header followed by the name bytes; the
//! header uses native byte order, so entries are single-machine state and
//! must not be exchanged across platforms.
//!
//! Not stored in an entry (recovered from other sources):
//!   - `id`       — it is the inodes-table key
//!   - `children` — reconstructed from the edges table
//!
//! Owner and group strings are dictionary-encoded to a `u8` id so the same
//! few strings are not repeated in every entry.

use crate::inode::Inode;
use anycache_common::InodeId;
use std::collections::HashMap;

/// Fixed size of the serialized entry header.
pub const ENTRY_HEADER_LEN: usize = 48;

/// Byte offset of the flags byte within the header.
pub const ENTRY_FLAGS_OFFSET: usize = 44;

/// Flags bit: the inode is a directory.
pub const ENTRY_FLAG_DIRECTORY: u8 = 0x01;

/// Flags bit: the file has been completed.
pub const ENTRY_FLAG_COMPLETE: u8 = 0x02;

/// Reserved keys in the inodes table; they sort after every legitimate
/// inode id.
pub const OWNER_DICT_KEY: u64 = 0xFFFF_FFFF_FFFF_FFFD;
pub const GROUP_DICT_KEY: u64 = 0xFFFF_FFFF_FFFF_FFFE;
pub const NEXT_ID_KEY: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Encode a u64 as its 8-byte big-endian key form.
#[must_use]
pub const fn encode_u64_be(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decode an 8-byte big-endian key.
#[must_use]
pub fn decode_u64_be(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    u64::from_be_bytes(buf)
}

/// inodes-table key for an inode.
#[must_use]
pub const fn encode_inode_key(id: InodeId) -> [u8; 8] {
    encode_u64_be(id.raw())
}

#[must_use]
pub fn decode_inode_key(data: &[u8]) -> InodeId {
    InodeId::new(decode_u64_be(data))
}

/// edges-table key: `BE(parent_id) ‖ child_name`. An ordered scan with the
/// 8-byte prefix lists a directory's children by sorted name.
#[must_use]
pub fn encode_edge_key(parent_id: InodeId, child_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + child_name.len());
    key.extend_from_slice(&encode_u64_be(parent_id.raw()));
    key.extend_from_slice(child_name.as_bytes());
    key
}

/// Decode an edge key into `(parent_id, child_name)`.
#[must_use]
pub fn decode_edge_key(data: &[u8]) -> (InodeId, String) {
    if data.len() < 8 {
        return (InodeId::INVALID, String::new());
    }
    let parent_id = decode_inode_key(data);
    let name = String::from_utf8_lossy(&data[8..]).into_owned();
    (parent_id, name)
}

/// Prefix selecting all edges of one parent directory.
#[must_use]
pub const fn encode_edge_prefix(parent_id: InodeId) -> [u8; 8] {
    encode_u64_be(parent_id.raw())
}

/// edges-table value: `BE(child_id)`.
#[must_use]
pub const fn encode_edge_value(child_id: InodeId) -> [u8; 8] {
    encode_u64_be(child_id.raw())
}

#[must_use]
pub fn decode_edge_value(data: &[u8]) -> InodeId {
    InodeId::new(decode_u64_be(data))
}

/// next-id counter value (8 bytes, native endian).
#[must_use]
pub const fn encode_next_id_value(next_id: u64) -> [u8; 8] {
    next_id.to_ne_bytes()
}

#[must_use]
pub fn decode_next_id_value(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    u64::from_ne_bytes(buf)
}

/// Serialize an inode to its entry form: 48-byte header + name bytes.
/// Owner and group are dictionary-encoded into the header.
#[must_use]
pub fn serialize_inode_entry(inode: &Inode, dict: &mut OwnerGroupDict) -> Vec<u8> {
    let mut flags = 0u8;
    if inode.is_directory {
        flags |= ENTRY_FLAG_DIRECTORY;
    }
    if inode.is_complete {
        flags |= ENTRY_FLAG_COMPLETE;
    }

    let mut buf = vec![0u8; ENTRY_HEADER_LEN + inode.name.len()];
    buf[0..8].copy_from_slice(&inode.parent_id.raw().to_ne_bytes());
    buf[8..16].copy_from_slice(&inode.size.to_ne_bytes());
    buf[16..24].copy_from_slice(&inode.block_size.to_ne_bytes());
    buf[24..32].copy_from_slice(&inode.creation_time_ms.to_ne_bytes());
    buf[32..40].copy_from_slice(&inode.modification_time_ms.to_ne_bytes());
    buf[40..44].copy_from_slice(&inode.mode.to_ne_bytes());
    buf[ENTRY_FLAGS_OFFSET] = flags;
    buf[45] = dict.get_or_add_owner(&inode.owner);
    buf[46] = dict.get_or_add_group(&inode.group);
    buf[ENTRY_HEADER_LEN..].copy_from_slice(inode.name.as_bytes());
    buf
}

/// Deserialize an inode entry. `id` comes from the inodes-table key;
/// `children` is not restored here (rebuilt from edges separately).
/// Malformed data yields a default inode carrying only the id.
#[must_use]
pub fn deserialize_inode_entry(id: InodeId, data: &[u8], dict: &OwnerGroupDict) -> Inode {
    let mut inode = Inode {
        id,
        ..Default::default()
    };
    if data.len() < ENTRY_HEADER_LEN {
        return inode;
    }

    let u64_at = |i: usize| u64::from_ne_bytes(data[i..i + 8].try_into().unwrap());
    inode.parent_id = InodeId::new(u64_at(0));
    inode.size = u64_at(8);
    inode.block_size = u64_at(16);
    inode.creation_time_ms = u64_at(24) as i64;
    inode.modification_time_ms = u64_at(32) as i64;
    inode.mode = u32::from_ne_bytes(data[40..44].try_into().unwrap());
    let flags = data[ENTRY_FLAGS_OFFSET];
    inode.is_directory = flags & ENTRY_FLAG_DIRECTORY != 0;
    inode.is_complete = flags & ENTRY_FLAG_COMPLETE != 0;
    inode.owner = dict.owner(data[45]).to_string();
    inode.group = dict.group(data[46]).to_string();
    inode.name = String::from_utf8_lossy(&data[ENTRY_HEADER_LEN..]).into_owned();
    inode
}

/// Dictionary mapping owner/group strings to `u8` ids (1..=255; 0 means
/// empty). Small, fully memory-resident, persisted at the reserved keys of
/// the inodes table.
#[derive(Default)]
pub struct OwnerGroupDict {
    owners: Vec<String>,
    groups: Vec<String>,
    owner_to_id: HashMap<String, u8>,
    group_to_id: HashMap<String, u8>,
    dirty: bool,
}

impl OwnerGroupDict {
    /// Id for an owner string, assigning a new one if unseen. Empty strings
    /// and dictionary overflow map to 0.
    pub fn get_or_add_owner(&mut self, owner: &str) -> u8 {
        Self::get_or_add(owner, &mut self.owner_to_id, &mut self.owners, &mut self.dirty)
    }

    pub fn get_or_add_group(&mut self, group: &str) -> u8 {
        Self::get_or_add(group, &mut self.group_to_id, &mut self.groups, &mut self.dirty)
    }

    /// Owner string for an id; `""` for 0 or unknown ids.
    #[must_use]
    pub fn owner(&self, id: u8) -> &str {
        Self::lookup(id, &self.owners)
    }

    #[must_use]
    pub fn group(&self, id: u8) -> &str {
        Self::lookup(id, &self.groups)
    }

    #[must_use]
    pub fn serialize_owners(&self) -> Vec<u8> {
        Self::serialize_list(&self.owners)
    }

    #[must_use]
    pub fn serialize_groups(&self) -> Vec<u8> {
        Self::serialize_list(&self.groups)
    }

    pub fn load_owners(&mut self, data: &[u8]) {
        self.owners = Self::deserialize_list(data);
        Self::rebuild_map(&self.owners, &mut self.owner_to_id);
    }

    pub fn load_groups(&mut self, data: &[u8]) {
        self.groups = Self::deserialize_list(data);
        Self::rebuild_map(&self.groups, &mut self.group_to_id);
    }

    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Whether entries were added since the last persist.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// List encoding: `[count (1B)] ([len (1B)] [string bytes])*`; index in
    /// the list is id − 1 (id 0 is reserved for the empty string).
    fn serialize_list(list: &[String]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + list.len() * 8);
        buf.push(list.len().min(255) as u8);
        for s in list {
            let len = s.len().min(255);
            buf.push(len as u8);
            buf.extend_from_slice(&s.as_bytes()[..len]);
        }
        buf
    }

    fn deserialize_list(data: &[u8]) -> Vec<String> {
        let mut list = Vec::new();
        if data.is_empty() {
            return list;
        }
        let count = data[0] as usize;
        let mut pos = 1;
        for _ in 0..count {
            if pos >= data.len() {
                break;
            }
            let len = data[pos] as usize;
            pos += 1;
            let actual = len.min(data.len() - pos);
            list.push(String::from_utf8_lossy(&data[pos..pos + actual]).into_owned());
            pos += actual;
        }
        list
    }

    fn get_or_add(
        s: &str,
        map: &mut HashMap<String, u8>,
        list: &mut Vec<String>,
        dirty: &mut bool,
    ) -> u8 {
        if s.is_empty() {
            return 0;
        }
        if let Some(id) = map.get(s) {
            return *id;
        }
        if list.len() >= 255 {
            // Dictionary overflow; treat as empty
            return 0;
        }
        list.push(s.to_string());
        let id = list.len() as u8;
        map.insert(s.to_string(), id);
        *dirty = true;
        id
    }

    fn lookup(id: u8, list: &[String]) -> &str {
        if id == 0 || id as usize > list.len() {
            return "";
        }
        &list[id as usize - 1]
    }

    fn rebuild_map(list: &[String], map: &mut HashMap<String, u8>) {
        map.clear();
        for (i, s) in list.iter().enumerate() {
            map.insert(s.clone(), (i + 1) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_be_key_ordering() {
        assert!(encode_u64_be(1) < encode_u64_be(2));
        assert!(encode_u64_be(255) < encode_u64_be(256));
        assert_eq!(decode_u64_be(&encode_u64_be(0xdead_beef)), 0xdead_beef);

        // Reserved keys sort after any legitimate inode id
        let max_legit = encode_inode_key(InodeId::new(anycache_common::MAX_INODE_ID));
        assert!(max_legit < encode_u64_be(OWNER_DICT_KEY));
        assert!(encode_u64_be(OWNER_DICT_KEY) < encode_u64_be(GROUP_DICT_KEY));
        assert!(encode_u64_be(GROUP_DICT_KEY) < encode_u64_be(NEXT_ID_KEY));
    }

    #[test]
    fn test_edge_key_roundtrip_and_prefix() {
        let parent = InodeId::new(42);
        let key = encode_edge_key(parent, "report.txt");
        assert!(key.starts_with(&encode_edge_prefix(parent)));

        let (pid, name) = decode_edge_key(&key);
        assert_eq!(pid, parent);
        assert_eq!(name, "report.txt");

        assert_eq!(decode_edge_value(&encode_edge_value(InodeId::new(7))).raw(), 7);
    }

    #[test]
    fn test_edge_keys_group_by_parent() {
        // Edges of the same parent are contiguous under ordered iteration
        let mut keys = vec![
            encode_edge_key(InodeId::new(2), "zz"),
            encode_edge_key(InodeId::new(1), "b"),
            encode_edge_key(InodeId::new(2), "aa"),
            encode_edge_key(InodeId::new(1), "a"),
        ];
        keys.sort();
        assert_eq!(decode_edge_key(&keys[0]), (InodeId::new(1), "a".into()));
        assert_eq!(decode_edge_key(&keys[1]), (InodeId::new(1), "b".into()));
        assert_eq!(decode_edge_key(&keys[2]), (InodeId::new(2), "aa".into()));
        assert_eq!(decode_edge_key(&keys[3]), (InodeId::new(2), "zz".into()));
    }

    #[test]
    fn test_inode_entry_roundtrip() {
        let mut dict = OwnerGroupDict::default();
        let inode = Inode {
            id: InodeId::new(5),
            parent_id: InodeId::new(1),
            name: "data.bin".to_string(),
            is_directory: false,
            size: 12345,
            mode: 0o640,
            owner: "alice".to_string(),
            group: "staff".to_string(),
            block_size: 1 << 20,
            creation_time_ms: 111,
            modification_time_ms: 222,
            is_complete: false,
            children: Default::default(),
        };

        let data = serialize_inode_entry(&inode, &mut dict);
        assert_eq!(data.len(), ENTRY_HEADER_LEN + inode.name.len());

        let restored = deserialize_inode_entry(InodeId::new(5), &data, &dict);
        assert_eq!(restored.parent_id, inode.parent_id);
        assert_eq!(restored.name, inode.name);
        assert_eq!(restored.size, inode.size);
        assert_eq!(restored.mode, inode.mode);
        assert_eq!(restored.block_size, inode.block_size);
        assert_eq!(restored.creation_time_ms, inode.creation_time_ms);
        assert_eq!(restored.modification_time_ms, inode.modification_time_ms);
        assert_eq!(restored.owner, "alice");
        assert_eq!(restored.group, "staff");
        assert!(!restored.is_directory);
        assert!(!restored.is_complete);
        assert!(restored.children.is_empty());
    }

    #[test]
    fn test_directory_flag_visible_without_decode() {
        let mut dict = OwnerGroupDict::default();
        let dir = Inode {
            is_directory: true,
            name: "d".to_string(),
            ..Default::default()
        };
        let data = serialize_inode_entry(&dir, &mut dict);
        assert_ne!(data[ENTRY_FLAGS_OFFSET] & ENTRY_FLAG_DIRECTORY, 0);

        let file = Inode {
            name: "f".to_string(),
            ..Default::default()
        };
        let data = serialize_inode_entry(&file, &mut dict);
        assert_eq!(data[ENTRY_FLAGS_OFFSET] & ENTRY_FLAG_DIRECTORY, 0);
    }

    #[test]
    fn test_malformed_entry_yields_defaults() {
        let dict = OwnerGroupDict::default();
        let inode = deserialize_inode_entry(InodeId::new(9), &[1, 2, 3], &dict);
        assert_eq!(inode.id.raw(), 9);
        assert_eq!(inode.name, "");
    }

    #[test]
    fn test_dict_assignment_and_persistence() {
        let mut dict = OwnerGroupDict::default();
        assert_eq!(dict.get_or_add_owner(""), 0);
        assert!(!dict.is_dirty());

        let alice = dict.get_or_add_owner("alice");
        let bob = dict.get_or_add_owner("bob");
        assert_eq!(alice, 1);
        assert_eq!(bob, 2);
        assert_eq!(dict.get_or_add_owner("alice"), 1);
        assert!(dict.is_dirty());

        let serialized = dict.serialize_owners();
        let mut restored = OwnerGroupDict::default();
        restored.load_owners(&serialized);
        assert_eq!(restored.owner(1), "alice");
        assert_eq!(restored.owner(2), "bob");
        assert_eq!(restored.owner(0), "");
        assert_eq!(restored.owner(99), "");
        assert_eq!(restored.get_or_add_owner("bob"), 2);
        assert_eq!(restored.owner_count(), 2);
    }

    #[test]
    fn test_next_id_value_roundtrip() {
        assert_eq!(decode_next_id_value(&encode_next_id_value(4242)), 4242);
    }
}
