//! Local-filesystem UFS driver
//!
//! Maps UFS paths onto a root directory on the local filesystem and serves
//! positional I/O straight through `pread`/`pwrite`.

use crate::{CreateOptions, MkdirOptions, UfsFile, UfsFileInfo, UnderFileSystem};
use anycache_common::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// UFS over a local directory tree.
pub struct LocalUfs {
    root: PathBuf,
}

impl LocalUfs {
    /// Create a local UFS rooted at `root`; the directory is created if
    /// missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "local UFS opened");
        Ok(Self { root })
    }

    /// Map a UFS path to its location under the root. Absolute paths are
    /// re-rooted so a mount cannot escape its tree.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn info_for(path: &Path, ufs_path: &str) -> Result<UfsFileInfo> {
        let meta = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modification_time_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as i64);
        Ok(UfsFileInfo {
            name,
            path: ufs_path.to_string(),
            is_directory: meta.is_dir(),
            size: meta.len(),
            mode: if meta.is_dir() { 0o755 } else { 0o644 },
            owner: String::new(),
            group: String::new(),
            modification_time_ms,
        })
    }
}

struct LocalFile {
    file: File,
}

impl UfsFile for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }
}

impl UnderFileSystem for LocalUfs {
    fn scheme(&self) -> &str {
        "file"
    }

    fn open(&self, path: &str) -> Result<Box<dyn UfsFile>> {
        let full = self.resolve(path);
        let file = File::open(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("ufs path not found: {path}"))
            } else {
                Error::from(e)
            }
        })?;
        Ok(Box::new(LocalFile { file }))
    }

    fn create(&self, path: &str, opts: &CreateOptions) -> Result<Box<dyn UfsFile>> {
        let full = self.resolve(path);
        if opts.recursive {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)?;
        Ok(Box::new(LocalFile { file }))
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let full = self.resolve(path);
        let meta = fs::metadata(&full)
            .map_err(|_| Error::not_found(format!("ufs path not found: {path}")))?;
        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&full)?;
            } else {
                fs::remove_dir(&full)?;
            }
        } else {
            fs::remove_file(&full)?;
        }
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        fs::rename(self.resolve(src), self.resolve(dst))?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<UfsFileInfo>> {
        let full = self.resolve(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            let child_path = if path.is_empty() || path == "/" {
                format!("/{}", entry.file_name().to_string_lossy())
            } else {
                format!(
                    "{}/{}",
                    path.trim_end_matches('/'),
                    entry.file_name().to_string_lossy()
                )
            };
            entries.push(Self::info_for(&entry.path(), &child_path)?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn file_info(&self, path: &str) -> Result<UfsFileInfo> {
        let full = self.resolve(path);
        if !full.exists() {
            return Err(Error::not_found(format!("ufs path not found: {path}")));
        }
        Self::info_for(&full, path)
    }

    fn mkdir(&self, path: &str, opts: &MkdirOptions) -> Result<()> {
        let full = self.resolve(path);
        if opts.recursive {
            fs::create_dir_all(&full)?;
        } else {
            fs::create_dir(&full)?;
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ufs() -> (TempDir, LocalUfs) {
        let dir = TempDir::new().unwrap();
        let ufs = LocalUfs::new(dir.path()).unwrap();
        (dir, ufs)
    }

    #[test]
    fn test_create_write_read() {
        let (_dir, ufs) = ufs();

        let file = ufs
            .create("data/hello.txt", &CreateOptions {
                recursive: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(file.write_at(b"hello world", 0).unwrap(), 11);
        drop(file);

        let file = ufs.open("data/hello.txt").unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello world");

        // Positional read in the middle
        let mut tail = [0u8; 5];
        assert_eq!(file.read_at(&mut tail, 6).unwrap(), 5);
        assert_eq!(&tail, b"world");
    }

    #[test]
    fn test_open_missing() {
        let (_dir, ufs) = ufs();
        assert!(ufs.open("/nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_mkdir_list_delete() {
        let (_dir, ufs) = ufs();

        ufs.mkdir("/a/b", &MkdirOptions {
            recursive: true,
            ..Default::default()
        })
        .unwrap();
        assert!(ufs.exists("/a/b").unwrap());

        ufs.create("/a/f.bin", &CreateOptions::default()).unwrap();
        let entries = ufs.list_dir("/a").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_directory);
        assert_eq!(entries[1].name, "f.bin");
        assert!(!entries[1].is_directory);

        ufs.delete("/a", true).unwrap();
        assert!(!ufs.exists("/a").unwrap());
        assert!(ufs.delete("/a", true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_file_info() {
        let (_dir, ufs) = ufs();
        let file = ufs.create("/x", &CreateOptions::default()).unwrap();
        file.write_at(&[0u8; 100], 0).unwrap();
        drop(file);

        let info = ufs.file_info("/x").unwrap();
        assert_eq!(info.size, 100);
        assert!(!info.is_directory);
        assert!(ufs.file_info("/y").unwrap_err().is_not_found());
    }
}
