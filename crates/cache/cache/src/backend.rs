//! Capability surface consumed from the backing store.
//!
//! The lock manager and the notification system never talk to a concrete
//! store. They are written against these traits, and each backend decides
//! how to make the individual primitives atomic (Lua scripts on Redis,
//! per-key map locking in the embedded store).

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CacheError;

/// Atomic single-key primitives needed to implement leases.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `value` with expiration `ttl` only if the key is absent.
    /// Returns `true` if the key was newly set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Get the current value of `key`. Returns `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Delete `key` only if its current value equals `expected`.
    /// Returns `true` if the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// Reset the expiration of `key` to `ttl` only if its current value
    /// equals `expected`. Returns `true` if the TTL was extended.
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;
}

/// A message as delivered by the backing transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Stream of messages for one backing subscription.
///
/// Dropping the stream closes the subscription on the backend.
pub type MessageStream = BoxStream<'static, RawMessage>;

/// Publish/subscribe primitives.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Publish `payload` on `channel`. Returns the number of subscriptions
    /// the backend delivered the message to.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, CacheError>;

    /// Subscribe to one or more exact channels. The returned stream is live
    /// once this call resolves.
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, CacheError>;

    /// Subscribe to one or more glob patterns (`*`, `?`).
    async fn psubscribe(&self, patterns: &[String]) -> Result<MessageStream, CacheError>;
}

/// Native keyspace access used for snapshot and restore.
#[async_trait]
pub trait Keyspace: Send + Sync {
    /// List every live key in the store.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Read the value stored at `key`. Errors when the key holds a value
    /// that cannot be read as a plain string value.
    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Write `value` at `key` without expiration.
    async fn set_value(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;
}
