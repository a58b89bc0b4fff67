//! Distributed leases over a shared backing store.
//!
//! A [`LockManager`] hands out [`Lock`] handles. Each lock is a key in the
//! backing store holding a random owner token, written with "set if absent"
//! and an expiration. Refresh and release are compare-and-act operations on
//! that token, so a holder whose lease expired and was re-acquired elsewhere
//! can never extend or delete the new holder's lease.
//!
//! Exclusivity across processes comes only from the atomicity of the
//! backend primitives. The in-process mutex on each [`Lock`] only
//! serializes that handle's own state transitions.
//!
//! # Auto-renewal
//!
//! Every acquired lock spawns one background task that extends the TTL
//! every `ttl / 3` (or [`LockConfig::renewal_interval_ms`]). If a renewal
//! finds the token no longer matches, or the backend errors, the lock is
//! marked not held and the task exits. The failure is recorded on the lock
//! and can be inspected through [`Lock::last_error`]; [`Lock::is_held`] is
//! the source of truth.
//!
//! The renewal cadence bounds how long a holder can be descheduled before
//! its lease lapses; it does not prove exclusivity under arbitrary delay.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keel_cache::{LockConfig, LockManager};
//!
//! let locks = LockManager::new(backend, LockConfig::default());
//! let lock = locks.acquire("workflow:42", Duration::from_secs(30)).await?;
//!
//! // Critical section...
//!
//! lock.release().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::LockBackend;
use crate::config::LockConfig;
use crate::error::CacheError;
use crate::metrics::{LockMetrics, LockMetricsSnapshot};
use crate::token::generate_owner_token;

/// Issues distributed leases against a [`LockBackend`].
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
    metrics: Arc<LockMetrics>,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self {
            backend,
            config,
            metrics: Arc::new(LockMetrics::default()),
        }
    }

    /// Build the backing-store key for a resource.
    pub fn lock_key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.config.key_prefix, resource)
    }

    /// Try once to acquire `resource` for `ttl`.
    ///
    /// Returns [`CacheError::NotAcquired`] if another owner currently holds
    /// the lease. On success a renewal task is running for the returned
    /// lock.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Lock, CacheError> {
        let key = self.lock_key(resource);
        let token = generate_owner_token();

        let acquired = match self.backend.set_if_absent(&key, &token, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.metrics.record_acquire_error();
                return Err(e);
            }
        };

        if !acquired {
            self.metrics.record_contended();
            return Err(CacheError::NotAcquired(resource.to_owned()));
        }

        self.metrics.record_acquired();
        debug!(resource, key = %key, ttl_ms = ttl.as_millis(), "lock acquired");

        let shared = Arc::new(LockShared {
            backend: Arc::clone(&self.backend),
            metrics: Arc::clone(&self.metrics),
            resource: resource.to_owned(),
            key,
            token,
            ttl,
            state: Mutex::new(LockState {
                held: true,
                last_error: None,
            }),
        });

        let renewal = RenewalTask::spawn(Arc::clone(&shared), self.config.renewal_interval(ttl));

        Ok(Lock {
            shared,
            renewal: Mutex::new(Some(renewal)),
        })
    }

    /// Acquire `resource` using the configured default TTL.
    pub async fn acquire_default(&self, resource: &str) -> Result<Lock, CacheError> {
        self.acquire(resource, self.config.default_ttl()).await
    }

    /// Acquire `resource`, polling until it becomes available or `timeout`
    /// elapses.
    ///
    /// Backend errors abort immediately; only contention is retried.
    pub async fn acquire_with_timeout(
        &self,
        resource: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Lock, CacheError> {
        let deadline = Instant::now() + timeout;
        let poll = self.config.acquire_poll_interval();

        loop {
            match self.acquire(resource, ttl).await {
                Err(CacheError::NotAcquired(_)) => {}
                other => return other,
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::Timeout(timeout));
            }

            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Point-in-time copy of the lock counters.
    pub fn metrics(&self) -> LockMetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// A held distributed lease.
///
/// Dropping a lock without calling [`release`](Self::release) stops its
/// renewal task; the lease then expires after its TTL. Explicit release is
/// preferred for prompt hand-off.
pub struct Lock {
    shared: Arc<LockShared>,
    renewal: Mutex<Option<RenewalTask>>,
}

impl Lock {
    /// The resource name this lock was acquired for.
    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    /// The full backing-store key.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// The owner token stored under [`key`](Self::key).
    pub fn token(&self) -> &str {
        &self.shared.token
    }

    /// Lease duration requested at acquisition.
    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// Whether this handle still believes it owns the lease.
    pub fn is_held(&self) -> bool {
        self.shared.state.lock().held
    }

    /// The most recent renewal or refresh failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    /// Extend the lease by its TTL.
    ///
    /// Returns [`CacheError::NotHeld`] without touching the backend if this
    /// handle was already released or lost, and [`CacheError::NotOwned`] if
    /// the stored token no longer matches. In the latter case the lock is
    /// marked not held and auto-renewal stops.
    pub async fn refresh(&self) -> Result<(), CacheError> {
        if !self.is_held() {
            return Err(CacheError::NotHeld(self.shared.resource.clone()));
        }

        let extended = self
            .shared
            .backend
            .compare_and_extend(&self.shared.key, &self.shared.token, self.shared.ttl)
            .await
            .inspect_err(|_| self.shared.metrics.record_refresh_failure())?;

        if extended {
            self.shared.metrics.record_refreshed();
            return Ok(());
        }

        self.shared.metrics.record_refresh_failure();
        self.shared
            .mark_lost("refresh found the lease owned by another holder");
        self.stop_renewal().await;
        Err(CacheError::NotOwned(self.shared.resource.clone()))
    }

    /// Release the lease.
    ///
    /// Local state flips to not-held before any I/O, so concurrent
    /// `refresh`/`release` calls observe [`CacheError::NotHeld`]. The
    /// renewal task is stopped and joined before the owner-checked delete.
    pub async fn release(&self) -> Result<(), CacheError> {
        {
            let mut state = self.shared.state.lock();
            if !state.held {
                return Err(CacheError::NotHeld(self.shared.resource.clone()));
            }
            state.held = false;
        }

        self.stop_renewal().await;

        let deleted = self
            .shared
            .backend
            .compare_and_delete(&self.shared.key, &self.shared.token)
            .await
            .inspect_err(|_| self.shared.metrics.record_release_failure())?;

        if deleted {
            self.shared.metrics.record_released();
            debug!(resource = %self.shared.resource, "lock released");
            Ok(())
        } else {
            self.shared.metrics.record_release_failure();
            Err(CacheError::NotOwned(self.shared.resource.clone()))
        }
    }

    async fn stop_renewal(&self) {
        let task = self.renewal.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Some(task) = self.renewal.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("resource", &self.shared.resource)
            .field("key", &self.shared.key)
            .field("ttl", &self.shared.ttl)
            .field("held", &self.is_held())
            .finish_non_exhaustive()
    }
}

/// State shared between a [`Lock`] and its renewal task.
struct LockShared {
    backend: Arc<dyn LockBackend>,
    metrics: Arc<LockMetrics>,
    resource: String,
    key: String,
    token: String,
    ttl: Duration,
    state: Mutex<LockState>,
}

struct LockState {
    held: bool,
    last_error: Option<String>,
}

impl LockShared {
    fn mark_lost(&self, reason: &str) {
        let mut state = self.state.lock();
        state.held = false;
        state.last_error = Some(reason.to_owned());
    }

    /// One renewal tick. Returns `false` when the task should exit.
    async fn renew(&self) -> bool {
        if !self.state.lock().held {
            return false;
        }

        match self
            .backend
            .compare_and_extend(&self.key, &self.token, self.ttl)
            .await
        {
            Ok(true) => {
                self.metrics.record_renewed();
                true
            }
            Ok(false) => {
                warn!(resource = %self.resource, "lock lost: renewal found a different owner");
                self.metrics.record_lost();
                self.mark_lost("renewal found the lease owned by another holder");
                false
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "lock renewal failed");
                self.metrics.record_lost();
                self.mark_lost(&format!("renewal failed: {e}"));
                false
            }
        }
    }
}

struct RenewalTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RenewalTask {
    fn spawn(shared: Arc<LockShared>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !shared.renew().await {
                            break;
                        }
                    }
                }
            }
            debug!(resource = %shared.resource, "lock renewal stopped");
        });

        Self { cancel, handle }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "lock renewal task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Minimal single-process backend with switchable failure injection.
    #[derive(Default)]
    struct ScriptedBackend {
        values: parking_lot::Mutex<HashMap<String, String>>,
        fail_extend: AtomicBool,
        extends: AtomicU64,
    }

    #[async_trait]
    impl LockBackend for ScriptedBackend {
        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            let mut values = self.values.lock();
            if values.contains_key(key) {
                return Ok(false);
            }
            values.insert(key.to_owned(), value.to_owned());
            Ok(true)
        }

        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            Ok(self.values.lock().get(key).cloned())
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
            let mut values = self.values.lock();
            if values.get(key).map(String::as_str) == Some(expected) {
                values.remove(key);
                return Ok(true);
            }
            Ok(false)
        }

        async fn compare_and_extend(
            &self,
            key: &str,
            expected: &str,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            self.extends.fetch_add(1, Ordering::SeqCst);
            if self.fail_extend.load(Ordering::SeqCst) {
                return Err(CacheError::Backend("connection reset".into()));
            }
            Ok(self.values.lock().get(key).map(String::as_str) == Some(expected))
        }
    }

    fn manager(backend: &Arc<ScriptedBackend>) -> LockManager {
        LockManager::new(
            Arc::clone(backend) as Arc<dyn LockBackend>,
            LockConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_resource_uses_bare_prefix() {
        let backend = Arc::new(ScriptedBackend::default());
        let locks = manager(&backend);
        let lock = locks.acquire("", Duration::from_secs(10)).await.unwrap();
        assert_eq!(lock.key(), "keel:lock:");
        assert_eq!(
            backend.get("keel:lock:").await.unwrap().as_deref(),
            Some(lock.token())
        );
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn contended_acquire_leaves_no_state() {
        let backend = Arc::new(ScriptedBackend::default());
        let locks = manager(&backend);
        let held = locks.acquire("jobs", Duration::from_secs(10)).await.unwrap();

        let err = locks.acquire("jobs", Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, CacheError::NotAcquired(ref r) if r == "jobs"));
        assert_eq!(
            backend.get("keel:lock:jobs").await.unwrap().as_deref(),
            Some(held.token())
        );

        let snap = locks.metrics();
        assert_eq!(snap.acquisitions, 1);
        assert_eq!(snap.contended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_error_marks_lock_lost() {
        let backend = Arc::new(ScriptedBackend::default());
        let locks = manager(&backend);
        let lock = locks.acquire("flaky", Duration::from_secs(3)).await.unwrap();

        backend.fail_extend.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(!lock.is_held());
        let reason = lock.last_error().expect("failure should be recorded");
        assert!(reason.contains("connection reset"), "got {reason}");
        assert_eq!(locks.metrics().lost, 1);

        // Renewal exits after the first failure.
        let extends = backend.extends.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.extends.load(Ordering::SeqCst), extends);

        assert!(matches!(lock.refresh().await, Err(CacheError::NotHeld(_))));
    }

    #[tokio::test]
    async fn refresh_backend_error_keeps_lock_held() {
        let backend = Arc::new(ScriptedBackend::default());
        let locks = manager(&backend);
        let lock = locks.acquire("r", Duration::from_secs(30)).await.unwrap();

        backend.fail_extend.store(true, Ordering::SeqCst);
        let err = lock.refresh().await.unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
        assert!(lock.is_held());
        assert_eq!(locks.metrics().refresh_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_timeout_gives_up() {
        let backend = Arc::new(ScriptedBackend::default());
        let locks = manager(&backend);
        let _held = locks.acquire("busy", Duration::from_secs(60)).await.unwrap();

        let err = locks
            .acquire_with_timeout("busy", Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn drop_cancels_renewal() {
        let backend = Arc::new(ScriptedBackend::default());
        let locks = manager(&backend);
        let lock = locks.acquire("dropped", Duration::from_secs(30)).await.unwrap();
        let cancel = lock
            .renewal
            .lock()
            .as_ref()
            .map(|t| t.cancel.clone())
            .unwrap();

        drop(lock);
        assert!(cancel.is_cancelled());
    }
}
