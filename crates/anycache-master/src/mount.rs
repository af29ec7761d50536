//! Mount table
//!
//! Binds anycache path prefixes to backing object stores. Resolution is
//! longest-prefix: the ordered map is walked in reverse so the deepest
//! matching mount wins. Mounts persist to the mount store before the
//! in-memory map updates, so a crash between the two simply restores from
//! disk.

use anycache_common::{Error, Result};
use anycache_ufs::UnderFileSystem;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// `anycache_path` → `ufs_uri`
const MOUNTS: TableDefinition<&str, &str> = TableDefinition::new("mounts");

/// Creates a UFS instance for a URI; `None` rejects the URI. Concrete
/// drivers stay outside the master, so the factory is injected.
pub type UfsFactory = Box<dyn Fn(&str) -> Option<Arc<dyn UnderFileSystem>> + Send + Sync>;

struct MountEntry {
    ufs_uri: String,
    ufs: Arc<dyn UnderFileSystem>,
}

/// Ordered mount-point table with longest-prefix resolution.
pub struct MountTable {
    mounts: Mutex<BTreeMap<String, MountEntry>>,
    factory: UfsFactory,
    db: Option<Database>,
}

impl MountTable {
    /// In-memory table; nothing survives a restart.
    #[must_use]
    pub fn new(factory: UfsFactory) -> Self {
        Self {
            mounts: Mutex::new(BTreeMap::new()),
            factory,
            db: None,
        }
    }

    /// Table persisted at `path`; previously persisted mounts are restored,
    /// skipping entries whose URI the factory no longer accepts.
    pub fn open(path: &Path, factory: UfsFactory) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(Error::io)?;
        let wtx = db.begin_write().map_err(Error::io)?;
        wtx.open_table(MOUNTS).map_err(Error::io)?;
        wtx.commit().map_err(Error::io)?;

        let mut mounts = BTreeMap::new();
        {
            let rtx = db.begin_read().map_err(Error::io)?;
            let table = rtx.open_table(MOUNTS).map_err(Error::io)?;
            for item in table.iter().map_err(Error::io)? {
                let (key, value) = item.map_err(Error::io)?;
                let anycache_path = key.value().to_string();
                let ufs_uri = value.value().to_string();
                match factory(&ufs_uri) {
                    Some(ufs) => {
                        mounts.insert(anycache_path, MountEntry { ufs_uri, ufs });
                    }
                    None => {
                        warn!(path = %anycache_path, uri = %ufs_uri, "skipping mount with invalid UFS uri");
                    }
                }
            }
        }

        info!(path = %path.display(), mounts = mounts.len(), "mount table opened");
        Ok(Self {
            mounts: Mutex::new(mounts),
            factory,
            db: Some(db),
        })
    }

    /// Bind `anycache_path` to `ufs_uri`. Persists before installing.
    pub fn mount(&self, anycache_path: &str, ufs_uri: &str) -> Result<()> {
        let mut mounts = self.mounts.lock();
        if mounts.contains_key(anycache_path) {
            return Err(Error::already_exists(format!(
                "mount point already exists: {anycache_path}"
            )));
        }
        let ufs = (self.factory)(ufs_uri)
            .ok_or_else(|| Error::invalid_argument(format!("failed to create UFS for: {ufs_uri}")))?;

        self.persist_mount(anycache_path, ufs_uri)?;
        mounts.insert(
            anycache_path.to_string(),
            MountEntry {
                ufs_uri: ufs_uri.to_string(),
                ufs,
            },
        );
        info!(path = %anycache_path, uri = %ufs_uri, "mounted");
        Ok(())
    }

    /// Remove a mount point.
    pub fn unmount(&self, anycache_path: &str) -> Result<()> {
        let mut mounts = self.mounts.lock();
        if !mounts.contains_key(anycache_path) {
            return Err(Error::not_found(format!(
                "mount point not found: {anycache_path}"
            )));
        }
        self.persist_unmount(anycache_path)?;
        mounts.remove(anycache_path);
        info!(path = %anycache_path, "unmounted");
        Ok(())
    }

    /// Resolve a path to its UFS and the path relative to the mount point.
    /// The deepest mount whose prefix matches wins.
    pub fn resolve(&self, anycache_path: &str) -> Result<(Arc<dyn UnderFileSystem>, String)> {
        let mounts = self.mounts.lock();
        for (mount_path, entry) in mounts.iter().rev() {
            if !Self::prefix_matches(anycache_path, mount_path) {
                continue;
            }
            let relative = if anycache_path.len() > mount_path.len() {
                let mut start = mount_path.len();
                if anycache_path.as_bytes()[start] == b'/' {
                    start += 1;
                }
                anycache_path[start..].to_string()
            } else {
                String::new()
            };
            return Ok((Arc::clone(&entry.ufs), relative));
        }
        Err(Error::not_found(format!(
            "no mount point for: {anycache_path}"
        )))
    }

    /// `path → uri` for every mount.
    #[must_use]
    pub fn mount_points(&self) -> BTreeMap<String, String> {
        self.mounts
            .lock()
            .iter()
            .map(|(path, entry)| (path.clone(), entry.ufs_uri.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_mount_point(&self, path: &str) -> bool {
        self.mounts.lock().contains_key(path)
    }

    /// A path matches a mount when equal, or extending it across a `/`
    /// boundary (mounts ending in `/` match any extension).
    fn prefix_matches(path: &str, mount: &str) -> bool {
        if path == mount {
            return true;
        }
        path.len() > mount.len()
            && path.starts_with(mount)
            && (mount.ends_with('/') || path.as_bytes()[mount.len()] == b'/')
    }

    fn persist_mount(&self, anycache_path: &str, ufs_uri: &str) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let wtx = db.begin_write().map_err(Error::io)?;
        {
            let mut table = wtx.open_table(MOUNTS).map_err(Error::io)?;
            table.insert(anycache_path, ufs_uri).map_err(Error::io)?;
        }
        wtx.commit().map_err(Error::io)?;
        Ok(())
    }

    fn persist_unmount(&self, anycache_path: &str) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let wtx = db.begin_write().map_err(Error::io)?;
        {
            let mut table = wtx.open_table(MOUNTS).map_err(Error::io)?;
            table.remove(anycache_path).map_err(Error::io)?;
        }
        wtx.commit().map_err(Error::io)?;
        Ok(())
    }
}
