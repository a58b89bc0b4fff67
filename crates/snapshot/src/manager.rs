//! Snapshot and restore of an embedded keyspace.
//!
//! A snapshot replaces the durable store's contents with every live key of
//! the keyspace plus two metadata records under [`META_PREFIX`]. Snapshot,
//! restore and close are serialized through one async read/write lock.
//! Durable-store calls run on the blocking thread pool and carry the write
//! guard with them, so a cancelled caller cannot release the lock while a
//! clear or write is still in flight.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_cache::backend::Keyspace;
use keel_cache::error::CacheError;

use crate::config::SnapshotConfig;
use crate::metrics::{SnapshotMetrics, SnapshotMetricsSnapshot};
use crate::store::{DurableStore, Record};

/// Reserved key prefix for snapshot metadata in the durable store.
pub const META_PREFIX: &str = "__keel_snapshot__:";

/// Format version written with every snapshot.
pub const FORMAT_VERSION: &str = "1";

const META_TIMESTAMP: &str = "__keel_snapshot__:timestamp";
const META_VERSION: &str = "__keel_snapshot__:version";

/// Metadata of the snapshot currently on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub taken_at: DateTime<Utc>,
    pub version: String,
}

/// Persists and restores a [`Keyspace`] to a [`DurableStore`].
pub struct SnapshotManager {
    keyspace: Arc<dyn Keyspace>,
    store: Arc<dyn DurableStore>,
    config: SnapshotConfig,
    /// `true` once closed.
    gate: Arc<RwLock<bool>>,
    metrics: SnapshotMetrics,
    stop: CancellationToken,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotManager {
    /// Create a manager over `keyspace` backed by `store`.
    pub fn new(
        keyspace: Arc<dyn Keyspace>,
        store: Arc<dyn DurableStore>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            keyspace,
            store,
            config,
            gate: Arc::new(RwLock::new(false)),
            metrics: SnapshotMetrics::default(),
            stop: CancellationToken::new(),
            periodic: Mutex::new(None),
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Apply the startup toggles: restore when `restore_on_startup` is set,
    /// then begin periodic snapshots when `enabled` with a non-zero
    /// interval.
    ///
    /// Returns the number of restored keys, if a restore ran.
    pub async fn start(self: &Arc<Self>) -> Result<Option<usize>, CacheError> {
        let restored = if self.config.restore_on_startup {
            Some(self.restore().await?)
        } else {
            None
        };

        let interval = self.config.interval();
        if self.config.enabled && !interval.is_zero() {
            self.start_periodic(interval)?;
        }
        Ok(restored)
    }

    /// Write the full keyspace to the durable store, replacing the
    /// previous snapshot.
    pub async fn snapshot(&self) -> Result<(), CacheError> {
        let gate = self.lock_open().await?;

        let started = Instant::now();
        match self.write_snapshot(gate).await {
            Ok((keys, size_bytes)) => {
                let elapsed = started.elapsed();
                self.metrics.record_snapshot(elapsed, size_bytes, keys);
                info!(
                    keys,
                    size_bytes,
                    duration_ms = elapsed.as_millis(),
                    "snapshot complete"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_snapshot_failure();
                Err(e)
            }
        }
    }

    async fn lock_open(&self) -> Result<OwnedRwLockWriteGuard<bool>, CacheError> {
        let gate = Arc::clone(&self.gate).write_owned().await;
        if *gate {
            return Err(CacheError::Closed("snapshot manager".into()));
        }
        Ok(gate)
    }

    fn is_excluded(&self, key: &str) -> bool {
        self.config
            .exclude_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }

    async fn write_snapshot(
        &self,
        gate: OwnedRwLockWriteGuard<bool>,
    ) -> Result<(u64, u64), CacheError> {
        let keys = self.keyspace.keys().await?;

        let mut records: Vec<Record> = Vec::with_capacity(keys.len() + 2);
        let mut size_bytes = 0u64;
        for key in keys {
            if key.starts_with(META_PREFIX) {
                warn!(key, "skipping key in reserved snapshot namespace");
                continue;
            }
            if self.is_excluded(&key) {
                debug!(key, "skipping excluded key");
                continue;
            }
            match self.keyspace.get_value(&key).await {
                Ok(Some(value)) => {
                    size_bytes += (key.len() + value.len()) as u64;
                    records.push((key.into_bytes(), value));
                }
                Ok(None) => debug!(key, "key vanished before snapshot read"),
                Err(e) => warn!(key, error = %e, "skipping unreadable key"),
            }
        }
        let key_count = records.len() as u64;

        records.push((
            META_TIMESTAMP.as_bytes().to_vec(),
            Utc::now().to_rfc3339().into_bytes(),
        ));
        records.push((
            META_VERSION.as_bytes().to_vec(),
            FORMAT_VERSION.as_bytes().to_vec(),
        ));

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let _gate = gate;
            if let Err(e) = store.clear() {
                warn!(error = %e, "failed to clear previous snapshot");
            }
            store.write_batch(&records)
        })
        .await
        .map_err(|e| CacheError::Persistence(format!("snapshot task: {e}")))??;

        Ok((key_count, size_bytes))
    }

    /// Replay the durable snapshot into the keyspace.
    ///
    /// Metadata records and non-UTF-8 keys are skipped. Restoring the same
    /// snapshot twice leaves the keyspace unchanged.
    pub async fn restore(&self) -> Result<usize, CacheError> {
        let gate = self.lock_open().await?;

        match self.replay(gate).await {
            Ok(restored) => {
                self.metrics.record_restore(restored as u64);
                info!(keys = restored, "restore complete");
                Ok(restored)
            }
            Err(e) => {
                self.metrics.record_restore_failure();
                Err(e)
            }
        }
    }

    async fn replay(&self, gate: OwnedRwLockWriteGuard<bool>) -> Result<usize, CacheError> {
        let store = Arc::clone(&self.store);
        // The guard comes back out of the blocking task and is held until
        // the replay below has finished.
        let (_gate, scanned) = tokio::task::spawn_blocking(move || {
            let scanned = store.scan();
            (gate, scanned)
        })
        .await
        .map_err(|e| CacheError::Persistence(format!("restore task: {e}")))?;
        let records = scanned?;

        let mut restored = 0;
        for (key, value) in records {
            let Ok(key) = String::from_utf8(key) else {
                warn!("skipping non UTF-8 snapshot key");
                continue;
            };
            if key.starts_with(META_PREFIX) {
                continue;
            }
            if self.is_excluded(&key) {
                debug!(key, "skipping excluded snapshot key");
                continue;
            }
            self.keyspace.set_value(&key, &value).await?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Metadata of the snapshot on disk, or `None` if there is none.
    pub async fn last_snapshot_info(&self) -> Result<Option<SnapshotInfo>, CacheError> {
        let closed = self.gate.read().await;
        if *closed {
            return Err(CacheError::Closed("snapshot manager".into()));
        }

        let store = Arc::clone(&self.store);
        let (timestamp, version) = tokio::task::spawn_blocking(move || {
            Ok::<_, CacheError>((
                store.get(META_TIMESTAMP.as_bytes())?,
                store.get(META_VERSION.as_bytes())?,
            ))
        })
        .await
        .map_err(|e| CacheError::Persistence(format!("metadata task: {e}")))??;

        let (Some(timestamp), Some(version)) = (timestamp, version) else {
            return Ok(None);
        };

        let timestamp = String::from_utf8_lossy(&timestamp);
        let taken_at = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| CacheError::Persistence(format!("bad snapshot timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(Some(SnapshotInfo {
            taken_at,
            version: String::from_utf8_lossy(&version).into_owned(),
        }))
    }

    /// Spawn the periodic snapshot task.
    ///
    /// A no-op if the task is already running. Fails once the scheduler
    /// has been stopped.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) -> Result<(), CacheError> {
        if interval.is_zero() {
            return Err(CacheError::Validation(
                "snapshot interval must be non-zero".into(),
            ));
        }
        if self.stop.is_cancelled() {
            return Err(CacheError::Closed("snapshot scheduler".into()));
        }

        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            debug!("periodic snapshots already running");
            return Ok(());
        }

        let manager = Arc::downgrade(self);
        let stop = self.stop.clone();
        *periodic = Some(tokio::spawn(run_periodic(manager, stop, interval)));
        info!(interval_ms = interval.as_millis(), "periodic snapshots started");
        Ok(())
    }

    /// Signal the periodic task to exit and wait for it. Idempotent.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.periodic.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "periodic snapshot task panicked");
            }
            debug!("periodic snapshots stopped");
        }
    }

    /// Stop scheduling, take a final snapshot if configured, and close the
    /// durable store. Idempotent.
    pub async fn close(&self) -> Result<(), CacheError> {
        self.stop().await;

        if *self.gate.read().await {
            return Ok(());
        }

        if self.config.snapshot_on_shutdown {
            if let Err(e) = self.snapshot().await {
                warn!(error = %e, "final snapshot failed");
            }
        }

        let mut closed = Arc::clone(&self.gate).write_owned().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let _gate = closed;
            store.close()
        })
            .await
            .map_err(|e| CacheError::Persistence(format!("close task: {e}")))??;
        info!("snapshot manager closed");
        Ok(())
    }

    /// Point-in-time copy of the snapshot counters.
    pub fn metrics(&self) -> SnapshotMetricsSnapshot {
        self.metrics.snapshot()
    }
}

async fn run_periodic(manager: Weak<SnapshotManager>, stop: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.snapshot().await {
                    warn!(error = %e, "periodic snapshot failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use keel_cache::{LockConfig, LockManager};
    use keel_cache_memory::MemoryBackend;

    use super::*;

    /// In-memory durable store with failure switches, an optional write
    /// delay, and detection of overlapping operations.
    #[derive(Default)]
    struct FakeStore {
        records: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
        fail_clear: AtomicBool,
        fail_write: AtomicBool,
        closed: AtomicBool,
        write_delay_ms: AtomicU64,
        active: AtomicUsize,
        overlapped: AtomicBool,
    }

    impl FakeStore {
        fn check_open(&self) -> Result<(), CacheError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(CacheError::Closed("fake store".into()));
            }
            Ok(())
        }

        fn tracked<T>(&self, op: impl FnOnce() -> T) -> T {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let out = op();
            self.active.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    impl DurableStore for FakeStore {
        fn write_batch(&self, records: &[Record]) -> Result<(), CacheError> {
            self.check_open()?;
            if self.fail_write.load(Ordering::SeqCst) {
                return Err(CacheError::Persistence("disk full".into()));
            }
            self.tracked(|| {
                let delay = self.write_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    std::thread::sleep(Duration::from_millis(delay));
                }
                let mut map = self.records.lock();
                for (k, v) in records {
                    map.insert(k.clone(), v.clone());
                }
            });
            Ok(())
        }

        fn clear(&self) -> Result<(), CacheError> {
            self.check_open()?;
            if self.fail_clear.load(Ordering::SeqCst) {
                return Err(CacheError::Persistence("clear failed".into()));
            }
            self.tracked(|| self.records.lock().clear());
            Ok(())
        }

        fn scan(&self) -> Result<Vec<Record>, CacheError> {
            self.check_open()?;
            Ok(self.tracked(|| {
                self.records
                    .lock()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }))
        }

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
            self.check_open()?;
            Ok(self.records.lock().get(key).cloned())
        }

        fn close(&self) -> Result<(), CacheError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Keyspace that lists a key it then fails to read.
    struct FlakyKeyspace {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl Keyspace for FlakyKeyspace {
        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            let mut keys = self.inner.keys().await?;
            keys.push("broken".into());
            keys.push("vanished".into());
            Ok(keys)
        }

        async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            match key {
                "broken" => Err(CacheError::Backend("WRONGTYPE".into())),
                "vanished" => Ok(None),
                other => self.inner.get_value(other).await,
            }
        }

        async fn set_value(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
            self.inner.set_value(key, value).await
        }
    }

    fn manager(keyspace: Arc<dyn Keyspace>, store: &Arc<FakeStore>) -> SnapshotManager {
        SnapshotManager::new(
            keyspace,
            Arc::clone(store) as Arc<dyn DurableStore>,
            SnapshotConfig::default(),
        )
    }

    #[tokio::test]
    async fn unreadable_and_vanished_keys_are_skipped() {
        let backend = MemoryBackend::new();
        backend.set("ok", "1", None);
        let store = Arc::new(FakeStore::default());
        let snapshots = manager(Arc::new(FlakyKeyspace { inner: backend }), &store);

        snapshots.snapshot().await.unwrap();

        let snap = snapshots.metrics();
        assert_eq!(snap.snapshots_taken, 1);
        assert_eq!(snap.last_snapshot_keys, 1);
        assert_eq!(snap.last_snapshot_size_bytes, 3);
        assert!(store.get(b"broken").unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_failure_does_not_abort_snapshot() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", None);
        let store = Arc::new(FakeStore::default());
        store.fail_clear.store(true, Ordering::SeqCst);
        let snapshots = manager(Arc::new(backend), &store);

        snapshots.snapshot().await.unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(snapshots.metrics().snapshots_failed, 0);
    }

    #[tokio::test]
    async fn write_failure_is_counted() {
        let store = Arc::new(FakeStore::default());
        store.fail_write.store(true, Ordering::SeqCst);
        let snapshots = manager(Arc::new(MemoryBackend::new()), &store);

        let err = snapshots.snapshot().await.unwrap_err();
        assert!(matches!(err, CacheError::Persistence(_)));
        let snap = snapshots.metrics();
        assert_eq!(snap.snapshots_failed, 1);
        assert_eq!(snap.snapshots_taken, 0);
    }

    #[tokio::test]
    async fn reserved_keys_are_not_snapshotted() {
        let backend = MemoryBackend::new();
        backend.set(META_VERSION, "999", None);
        backend.set("user", "data", None);
        let store = Arc::new(FakeStore::default());
        let snapshots = manager(Arc::new(backend), &store);

        snapshots.snapshot().await.unwrap();
        assert_eq!(
            store.get(META_VERSION.as_bytes()).unwrap(),
            Some(FORMAT_VERSION.as_bytes().to_vec())
        );
        assert_eq!(snapshots.metrics().last_snapshot_keys, 1);
    }

    #[tokio::test]
    async fn lock_leases_are_not_snapshotted_or_restored() {
        let backend = MemoryBackend::new();
        backend.set("user", "data", None);
        let locks = LockManager::new(Arc::new(backend.clone()), LockConfig::default());
        let lease = locks.acquire("job", Duration::from_secs(30)).await.unwrap();
        let store = Arc::new(FakeStore::default());
        let snapshots = manager(Arc::new(backend), &store);

        snapshots.snapshot().await.unwrap();
        assert!(store.get(lease.key().as_bytes()).unwrap().is_none());
        assert_eq!(snapshots.metrics().last_snapshot_keys, 1);
        lease.release().await.unwrap();

        // A store written before the exclusion existed still holds a lease.
        store
            .write_batch(&[(b"keel:lock:stale".to_vec(), b"token".to_vec())])
            .unwrap();
        let target = MemoryBackend::new();
        let restorer = manager(Arc::new(target.clone()), &store);
        assert_eq!(restorer.restore().await.unwrap(), 1);
        assert!(target.get_bytes("keel:lock:stale").is_none());
        assert_eq!(target.get_bytes("user"), Some(b"data".to_vec()));
    }

    #[tokio::test]
    async fn cancelled_snapshot_holds_gate_until_write_lands() {
        let backend = MemoryBackend::new();
        backend.set("key1", "a", None);
        backend.set("key2", "b", None);
        let store = Arc::new(FakeStore::default());
        let snapshots = manager(Arc::new(backend), &store);
        snapshots.snapshot().await.unwrap();

        store.write_delay_ms.store(300, Ordering::SeqCst);
        let timed_out = tokio::time::timeout(Duration::from_millis(50), snapshots.snapshot())
            .await
            .is_err();
        assert!(timed_out);

        // Restore waits for the abandoned clear and write to finish.
        assert_eq!(snapshots.restore().await.unwrap(), 2);
        assert!(!store.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_snapshot_and_restore_serialize() {
        let backend = MemoryBackend::new();
        backend.set("key1", "a", None);
        backend.set("key2", "b", None);
        let store = Arc::new(FakeStore::default());
        let snapshots = manager(Arc::new(backend), &store);
        snapshots.snapshot().await.unwrap();

        store.write_delay_ms.store(100, Ordering::SeqCst);
        let (snapshot, restored) = tokio::join!(snapshots.snapshot(), snapshots.restore());
        snapshot.unwrap();
        assert_eq!(restored.unwrap(), 2);
        assert!(!store.overlapped.load(Ordering::SeqCst));
        assert_eq!(store.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restore_skips_non_utf8_keys() {
        let store = Arc::new(FakeStore::default());
        store
            .write_batch(&[
                (vec![0xff, 0x00], b"bin".to_vec()),
                (b"plain".to_vec(), b"text".to_vec()),
            ])
            .unwrap();
        let backend = MemoryBackend::new();
        let snapshots = manager(Arc::new(backend.clone()), &store);

        assert_eq!(snapshots.restore().await.unwrap(), 1);
        assert_eq!(backend.get_bytes("plain"), Some(b"text".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn info_is_none_without_snapshot() {
        let store = Arc::new(FakeStore::default());
        let snapshots = manager(Arc::new(MemoryBackend::new()), &store);
        assert_eq!(snapshots.last_snapshot_info().await.unwrap(), None);

        snapshots.snapshot().await.unwrap();
        let info = snapshots.last_snapshot_info().await.unwrap().unwrap();
        assert_eq!(info.version, FORMAT_VERSION);
        assert!(info.taken_at <= Utc::now());
    }

    #[tokio::test]
    async fn close_takes_final_snapshot_once() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", None);
        let store = Arc::new(FakeStore::default());
        let snapshots = manager(Arc::new(backend), &store);

        snapshots.close().await.unwrap();
        snapshots.close().await.unwrap();

        assert_eq!(snapshots.metrics().snapshots_taken, 1);
        assert!(store.closed.load(Ordering::SeqCst));
        assert!(matches!(
            snapshots.snapshot().await,
            Err(CacheError::Closed(_))
        ));
        assert!(matches!(
            snapshots.restore().await,
            Err(CacheError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn close_without_final_snapshot() {
        let store = Arc::new(FakeStore::default());
        let snapshots = SnapshotManager::new(
            Arc::new(MemoryBackend::new()),
            Arc::clone(&store) as Arc<dyn DurableStore>,
            SnapshotConfig {
                snapshot_on_shutdown: false,
                ..SnapshotConfig::default()
            },
        );

        snapshots.close().await.unwrap();
        assert_eq!(snapshots.metrics().snapshots_taken, 0);
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn periodic_cannot_restart_after_stop() {
        let store = Arc::new(FakeStore::default());
        let snapshots = Arc::new(manager(Arc::new(MemoryBackend::new()), &store));

        snapshots.start_periodic(Duration::from_secs(60)).unwrap();
        snapshots.start_periodic(Duration::from_secs(60)).unwrap();
        snapshots.stop().await;
        snapshots.stop().await;

        assert!(matches!(
            snapshots.start_periodic(Duration::from_secs(60)),
            Err(CacheError::Closed(_))
        ));
        assert!(matches!(
            snapshots.start_periodic(Duration::ZERO),
            Err(CacheError::Validation(_))
        ));
    }
}
