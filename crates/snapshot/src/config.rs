use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for the [`SnapshotManager`](crate::SnapshotManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Run periodic snapshots after [`start`](crate::SnapshotManager::start).
    pub enabled: bool,

    /// Directory holding the LMDB environment.
    pub path: PathBuf,

    /// Period between scheduled snapshots. Zero disables scheduling.
    pub interval_ms: u64,

    /// Take a final snapshot when the manager is closed.
    pub snapshot_on_shutdown: bool,

    /// Replay the on-disk snapshot into the keyspace on start.
    pub restore_on_startup: bool,

    /// Maximum size of the LMDB memory map in bytes.
    pub map_size: usize,

    /// Keys under these prefixes are neither snapshotted nor restored.
    ///
    /// Restored values carry no expiry, so lease keys written by the lock
    /// manager would otherwise outlive their holder. The default matches
    /// the default lock key prefix.
    pub exclude_prefixes: Vec<String>,
}

impl SnapshotConfig {
    /// Period between scheduled snapshots.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./data/snapshot"),
            interval_ms: 300_000,
            snapshot_on_shutdown: true,
            restore_on_startup: true,
            map_size: 1 << 30,
            exclude_prefixes: vec!["keel:lock:".into()],
        }
    }
}
