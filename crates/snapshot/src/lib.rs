//! Durable snapshots for the Keel embedded cache.
//!
//! The embedded store keeps everything in memory. [`SnapshotManager`]
//! copies its full keyspace into an LMDB environment on demand, on a
//! schedule, and at shutdown, and replays it back on startup.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keel_cache_memory::MemoryBackend;
//! use keel_snapshot::{LmdbStore, SnapshotConfig, SnapshotManager};
//!
//! let config = SnapshotConfig { enabled: true, ..SnapshotConfig::default() };
//! let store = Arc::new(LmdbStore::open(&config.path, config.map_size)?);
//! let snapshots = Arc::new(SnapshotManager::new(Arc::new(MemoryBackend::new()), store, config));
//!
//! snapshots.start().await?;
//! // ...
//! snapshots.close().await?;
//! ```

pub mod config;
mod lmdb_store;
pub mod manager;
pub mod metrics;
pub mod store;

pub use config::SnapshotConfig;
pub use lmdb_store::LmdbStore;
pub use manager::{FORMAT_VERSION, META_PREFIX, SnapshotInfo, SnapshotManager};
pub use metrics::{SnapshotMetrics, SnapshotMetricsSnapshot};
pub use store::{DurableStore, Record};
