//! # frontier-core - Distributed crawl frontier
//!
//! Shared, deduplicated, prioritized work queue for crawl workers that run
//! as independent processes against one key-value store:
//! - `StoreClient` trait for store implementations, plus an in-process `MemoryStore`
//! - `Fingerprint` and `WorkItem` for identifying work
//! - `Deduper` and `FrontierQueue`, combined behind `Frontier`
//! - `Coordinator` and `WorkerPool` for processing items
//! - `StoreConfig` for resolving store connection settings
//! - Error types

mod backoff;
mod config;
mod coordinator;
mod dedupe;
mod error;
mod fingerprint;
mod frontier;
mod item;
mod keys;
mod memory;
mod pool;
mod queue;
mod store;

// Re-export main types
pub use backoff::Backoff;
pub use config::{
    keys as config_keys, CoordinatorConfig, CoordinatorConfigBuilder, FrontierConfig, StoreConfig,
};
pub use coordinator::{
    Coordinator, CoordinatorReport, CoordinatorState, ProcessResult, ProcessingError, StopReason,
    StopSignal,
};
pub use dedupe::Deduper;
pub use error::{FrontierError, Result};
pub use fingerprint::{canonical_json, canonicalize_url, Fingerprint, Fingerprinted};
pub use frontier::{Enqueued, Frontier, FrontierStats};
pub use item::{Request, WorkItem};
pub use keys::{FrontierKeys, FRONTIER_KEY_PREFIX};
pub use memory::MemoryStore;
pub use pool::{generate_pool_id, PoolReport, WorkerPool, WorkerPoolBuilder};
pub use queue::{FrontierQueue, PriorityOrder};
pub use store::{DynStore, SharedStore, StoreClient, UnseenPush};
