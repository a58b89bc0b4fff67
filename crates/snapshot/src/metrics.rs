use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Snapshot and restore counters.
#[derive(Debug, Default)]
pub struct SnapshotMetrics {
    inner: RwLock<SnapshotMetricsSnapshot>,
}

impl SnapshotMetrics {
    pub(crate) fn record_snapshot(&self, duration: Duration, size_bytes: u64, keys: u64) {
        let mut inner = self.inner.write();
        inner.snapshots_taken += 1;
        inner.last_snapshot_duration = duration;
        inner.last_snapshot_size_bytes = size_bytes;
        inner.last_snapshot_keys = keys;
        inner.last_snapshot_at = Some(Utc::now());
    }

    pub(crate) fn record_snapshot_failure(&self) {
        self.inner.write().snapshots_failed += 1;
    }

    pub(crate) fn record_restore(&self, keys: u64) {
        let mut inner = self.inner.write();
        inner.restores_taken += 1;
        inner.last_restore_keys = keys;
    }

    pub(crate) fn record_restore_failure(&self) {
        self.inner.write().restores_failed += 1;
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> SnapshotMetricsSnapshot {
        self.inner.read().clone()
    }
}

/// A plain data snapshot of [`SnapshotMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotMetricsSnapshot {
    pub snapshots_taken: u64,
    pub snapshots_failed: u64,
    pub restores_taken: u64,
    pub restores_failed: u64,
    pub last_snapshot_duration: Duration,
    /// Key plus value bytes written by the last successful snapshot.
    pub last_snapshot_size_bytes: u64,
    pub last_snapshot_keys: u64,
    pub last_restore_keys: u64,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}
