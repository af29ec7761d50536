//! AnyCache Worker - tiered block engine
//!
//! A worker holds a multi-tier block store (memory, SSD, HDD) with
//! pluggable eviction, crash-recoverable block metadata, a page-level read
//! cache, and an asynchronous data mover ferrying blocks between the engine
//! and backing object stores.

pub mod cache;
pub mod meta;
pub mod mover;
pub mod page;
pub mod store;
pub mod tier;
pub mod worker;

pub use cache::CacheManager;
pub use meta::{open_meta_store, BlockMeta, MetaStore};
pub use mover::DataMover;
pub use page::{PageFetcher, PageStore};
pub use store::BlockStore;
pub use tier::StorageTier;
pub use worker::{TierStatus, Worker, WorkerStatus};
