use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

/// Counters tracking lock manager outcomes.
///
/// The counters live behind a read/write lock. Callers only ever see the
/// value copy returned by [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct LockMetrics {
    inner: RwLock<LockMetricsSnapshot>,
}

impl LockMetrics {
    pub(crate) fn record_acquired(&self) {
        self.inner.write().acquisitions += 1;
    }

    pub(crate) fn record_contended(&self) {
        self.inner.write().contended += 1;
    }

    pub(crate) fn record_acquire_error(&self) {
        self.inner.write().acquisition_errors += 1;
    }

    pub(crate) fn record_released(&self) {
        self.inner.write().releases += 1;
    }

    pub(crate) fn record_release_failure(&self) {
        self.inner.write().release_failures += 1;
    }

    pub(crate) fn record_refreshed(&self) {
        self.inner.write().refreshes += 1;
    }

    pub(crate) fn record_refresh_failure(&self) {
        self.inner.write().refresh_failures += 1;
    }

    pub(crate) fn record_renewed(&self) {
        self.inner.write().renewals += 1;
    }

    pub(crate) fn record_lost(&self) {
        self.inner.write().lost += 1;
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        self.inner.read().clone()
    }
}

/// A plain data snapshot of [`LockMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockMetricsSnapshot {
    /// Leases successfully acquired.
    pub acquisitions: u64,
    /// Acquire attempts rejected because the resource was already locked.
    pub contended: u64,
    /// Acquire attempts that failed with a backend error.
    pub acquisition_errors: u64,
    /// Leases released cleanly.
    pub releases: u64,
    /// Release attempts that found the lease owned by someone else or errored.
    pub release_failures: u64,
    /// Successful manual refreshes.
    pub refreshes: u64,
    /// Manual refreshes that failed.
    pub refresh_failures: u64,
    /// Successful background renewals.
    pub renewals: u64,
    /// Leases lost during background renewal.
    pub lost: u64,
}

/// Counters tracking pub/sub traffic.
#[derive(Debug, Default)]
pub struct NotificationMetrics {
    inner: RwLock<NotificationMetricsSnapshot>,
}

impl NotificationMetrics {
    /// Count a successful publish and fold its latency into the running
    /// average. The first sample sets the baseline; every later sample is
    /// averaged with the previous value.
    pub(crate) fn record_published(&self, latency: Duration) {
        let mut inner = self.inner.write();
        inner.messages_published += 1;
        inner.average_latency = if inner.average_latency.is_zero() {
            latency
        } else {
            (inner.average_latency + latency) / 2
        };
    }

    pub(crate) fn record_publish_error(&self) {
        self.inner.write().publish_errors += 1;
    }

    pub(crate) fn record_subscribe_error(&self) {
        self.inner.write().subscribe_errors += 1;
    }

    pub(crate) fn record_received(&self) {
        self.inner.write().messages_received += 1;
    }

    pub(crate) fn record_dropped(&self) {
        self.inner.write().dropped_messages += 1;
    }

    pub(crate) fn subscription_opened(&self) {
        self.inner.write().active_subscriptions += 1;
    }

    pub(crate) fn subscription_closed(&self) {
        let mut inner = self.inner.write();
        inner.active_subscriptions = inner.active_subscriptions.saturating_sub(1);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> NotificationMetricsSnapshot {
        self.inner.read().clone()
    }
}

/// A plain data snapshot of [`NotificationMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationMetricsSnapshot {
    pub messages_published: u64,
    /// Messages handed to a subscriber's output buffer.
    pub messages_received: u64,
    pub publish_errors: u64,
    pub subscribe_errors: u64,
    /// Subscriptions whose drain task is still running.
    pub active_subscriptions: u64,
    /// Smoothed publish latency.
    pub average_latency: Duration,
    /// Messages discarded because a subscriber's buffer was full.
    pub dropped_messages: u64,
}
