use std::time::Duration;

use serde::Deserialize;

/// Default lease TTL in milliseconds.
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

/// Default per-subscription output buffer size.
pub const DEFAULT_NOTIFICATION_BUFFER_SIZE: usize = 100;

/// Configuration for the [`LockManager`](crate::LockManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Prefix for lock keys. Lock keys render as `<prefix>:lock:<resource>`.
    pub key_prefix: String,

    /// TTL used by [`LockManager::acquire_default`](crate::LockManager::acquire_default).
    pub default_ttl_ms: u64,

    /// Fixed auto-renewal period. When unset, locks renew every `ttl / 3`.
    pub renewal_interval_ms: Option<u64>,

    /// Poll interval for [`LockManager::acquire_with_timeout`](crate::LockManager::acquire_with_timeout).
    pub acquire_poll_interval_ms: u64,
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_interval_ms.max(1))
    }

    /// Auto-renewal period for a lease with the given TTL.
    ///
    /// Never returns zero so the renewal ticker can always be constructed.
    pub fn renewal_interval(&self, ttl: Duration) -> Duration {
        let interval = self
            .renewal_interval_ms
            .map_or_else(|| ttl / 3, Duration::from_millis);
        interval.max(Duration::from_millis(1))
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::from("keel"),
            default_ttl_ms: DEFAULT_LOCK_TTL_MS,
            renewal_interval_ms: None,
            acquire_poll_interval_ms: 50,
        }
    }
}

/// Configuration for the [`NotificationSystem`](crate::NotificationSystem).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Capacity of each subscriber's output buffer. Messages arriving while
    /// the buffer is full are dropped.
    pub buffer_size: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_NOTIFICATION_BUFFER_SIZE,
        }
    }
}
