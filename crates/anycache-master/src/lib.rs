//! AnyCache Master - namespace and block-location tracking
//!
//! The master owns the inode tree (two-tier: directories in memory, files
//! faulted in from the inode store), the reverse block-location map fed by
//! worker reports, worker liveness, and the mount table resolving paths to
//! backing object stores.

pub mod entry;
pub mod inode;
pub mod location;
pub mod master;
pub mod mount;
pub mod store;
pub mod tree;
pub mod workers;

pub use inode::Inode;
pub use location::BlockLocationMap;
pub use master::FileSystemMaster;
pub use mount::{MountTable, UfsFactory};
pub use store::{InodeBatch, InodeStore};
pub use tree::InodeTree;
pub use workers::{WorkerManager, WorkerState};
