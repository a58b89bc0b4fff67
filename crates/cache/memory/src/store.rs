use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use keel_cache::backend::{Keyspace, LockBackend};
use keel_cache::error::CacheError;

use crate::pubsub::Hub;

/// A stored value with optional expiration.
#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Embedded in-memory backing store.
///
/// Implements every backend capability the cache layer needs: lease
/// primitives, pub/sub and keyspace access. Clones share the same data.
///
/// Expiry is lazy: expired entries are evicted when the key is next
/// touched or when the keyspace is listed.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, StoredValue>>,
    pub(crate) hub: Arc<Hub>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally write `key`, replacing any previous value and TTL.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Option<Duration>) {
        self.entries.insert(
            key.into(),
            StoredValue {
                value: value.into(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Read the raw bytes at `key`, if present and unexpired.
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.evict_if_expired(key);
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Remaining time to live of `key`. `None` if the key is missing or
    /// has no expiration.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.evict_if_expired(key);
        self.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Remove `key`. Returns `true` if it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn evict_if_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.is_expired());
    }

    fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.evict_if_expired(key);

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: value.as_bytes().to_vec(),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.get_bytes(key)
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| CacheError::Backend(format!("value at {key} is not UTF-8: {e}")))
            })
            .transpose()
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.evict_if_expired(key);
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.value == expected.as_bytes())
            .is_some())
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.evict_if_expired(key);

        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.value != expected.as_bytes() {
            return Ok(false);
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(true)
    }
}

#[async_trait]
impl Keyspace for MemoryBackend {
    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.purge_expired();
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.get_bytes(key))
    }

    async fn set_value(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.set(key, value, None);
        Ok(())
    }
}
