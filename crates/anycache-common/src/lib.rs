//! AnyCache Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and configuration
//! structures used across all AnyCache components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BlockStoreConfig, MasterConfig, RpcConfig, TierConfig, WorkerConfig};
pub use error::{Error, Result};
pub use types::*;
