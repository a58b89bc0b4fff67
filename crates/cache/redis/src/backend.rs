//! Redis implementation of the backing-store capabilities.
//!
//! Commands run on pooled connections from `deadpool-redis`. The lease
//! primitives are Lua scripts, so every compare-and-act step executes
//! atomically on the server. Each subscription opens its own dedicated
//! pub/sub connection, which is closed when the returned stream is dropped.
//!
//! As with any single-key Redis lock, exclusivity holds on a standalone
//! instance. During a Sentinel or Cluster failover a lease written to the
//! old primary may be lost before replication.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use redis::{AsyncCommands, Script};
use tracing::debug;

use keel_cache::backend::{Keyspace, LockBackend, MessageStream, PubSubBackend, RawMessage};
use keel_cache::error::CacheError;

use crate::config::RedisConfig;
use crate::scripts;

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

/// Redis-backed [`LockBackend`], [`PubSubBackend`] and [`Keyspace`].
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    client: redis::Client,
}

impl RedisBackend {
    /// Build the connection pool and pub/sub client. No connection is made
    /// until the first command; use [`ping`](Self::ping) to check health.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if the URL is invalid or the pool
    /// cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, CacheError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| CacheError::Connection(e.to_string()))?
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        Ok(Self { pool, client })
    }

    /// Round-trip a `PING` to verify the server is reachable.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(format!("ping: {e}")))?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }

    async fn pubsub(&self) -> Result<redis::aio::PubSub, CacheError> {
        self.client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::Connection(format!("open pub/sub connection: {e}")))
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn into_stream(pubsub: redis::aio::PubSub) -> MessageStream {
    pubsub
        .into_on_message()
        .map(|msg| {
            let pattern = if msg.from_pattern() {
                msg.get_pattern::<String>().ok()
            } else {
                None
            };
            RawMessage {
                channel: msg.get_channel_name().to_owned(),
                pattern,
                payload: msg.get_payload_bytes().to_vec(),
            }
        })
        .boxed()
}

#[async_trait]
impl LockBackend for RedisBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let result: i64 = Script::new(scripts::LOCK_ACQUIRE)
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("acquire {key}: {e}")))?;
        Ok(result == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| CacheError::Backend(format!("get {key}: {e}")))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let result: i64 = Script::new(scripts::LOCK_RELEASE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("release {key}: {e}")))?;
        Ok(result == 1)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let result: i64 = Script::new(scripts::LOCK_EXTEND)
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("extend {key}: {e}")))?;
        Ok(result == 1)
    }
}

#[async_trait]
impl PubSubBackend for RedisBackend {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        conn.publish(channel, payload)
            .await
            .map_err(|e| CacheError::Backend(format!("publish to {channel}: {e}")))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, CacheError> {
        let mut pubsub = self.pubsub().await?;
        pubsub
            .subscribe(channels)
            .await
            .map_err(|e| CacheError::Backend(format!("subscribe {channels:?}: {e}")))?;
        debug!(?channels, "redis subscription open");
        Ok(into_stream(pubsub))
    }

    async fn psubscribe(&self, patterns: &[String]) -> Result<MessageStream, CacheError> {
        let mut pubsub = self.pubsub().await?;
        pubsub
            .psubscribe(patterns)
            .await
            .map_err(|e| CacheError::Backend(format!("psubscribe {patterns:?}: {e}")))?;
        debug!(?patterns, "redis pattern subscription open");
        Ok(into_stream(pubsub))
    }
}

#[async_trait]
impl Keyspace for RedisBackend {
    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        let mut results = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(format!("scan: {e}")))?;

            results.extend(keys);

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once.
        results.sort_unstable();
        results.dedup();
        Ok(results)
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| CacheError::Backend(format!("get {key}: {e}")))
    }

    async fn set_value(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| CacheError::Backend(format!("set {key}: {e}")))
    }
}


#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use std::sync::Arc;

    use keel_cache::testing::{
        run_keyspace_conformance_tests, run_lock_backend_conformance_tests,
        run_pubsub_conformance_tests,
    };
    use keel_cache::{LockConfig, LockManager, NotificationConfig, NotificationSystem};

    use super::*;

    fn test_config() -> RedisConfig {
        RedisConfig::new(
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        )
    }

    fn test_prefix() -> String {
        format!("keel-test-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn ping() {
        let backend = RedisBackend::new(&test_config()).expect("pool creation should succeed");
        backend.ping().await.expect("redis should answer PING");
    }

    #[tokio::test]
    async fn lock_conformance() {
        let backend = RedisBackend::new(&test_config()).expect("pool creation should succeed");
        run_lock_backend_conformance_tests(&backend, &test_prefix())
            .await
            .expect("lock backend conformance tests should pass");
    }

    #[tokio::test]
    async fn pubsub_conformance() {
        let backend = RedisBackend::new(&test_config()).expect("pool creation should succeed");
        run_pubsub_conformance_tests(&backend, &test_prefix())
            .await
            .expect("pubsub conformance tests should pass");
    }

    #[tokio::test]
    async fn keyspace_conformance() {
        let backend = RedisBackend::new(&test_config()).expect("pool creation should succeed");
        run_keyspace_conformance_tests(&backend, &test_prefix())
            .await
            .expect("keyspace conformance tests should pass");
    }

    #[tokio::test]
    async fn lock_manager_round_trip() {
        let backend = RedisBackend::new(&test_config()).expect("pool creation should succeed");
        let locks = LockManager::new(
            Arc::new(backend),
            LockConfig {
                key_prefix: test_prefix(),
                ..LockConfig::default()
            },
        );

        let lock = locks
            .acquire("orders", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(
            locks.acquire("orders", Duration::from_secs(5)).await,
            Err(CacheError::NotAcquired(_))
        ));
        lock.refresh().await.unwrap();
        lock.release().await.unwrap();
        assert!(matches!(lock.release().await, Err(CacheError::NotHeld(_))));
    }

    #[tokio::test]
    async fn notification_pattern_delivery() {
        let backend = RedisBackend::new(&test_config()).expect("pool creation should succeed");
        let notifications =
            NotificationSystem::new(Arc::new(backend), &NotificationConfig::default());
        let prefix = test_prefix();

        let mut sub = notifications
            .subscribe_pattern([format!("{prefix}:workflow:*")])
            .await
            .unwrap();
        notifications
            .publish(&format!("{prefix}:workflow:1"), "hello")
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.decode::<String>().unwrap(), "hello");
        notifications.close().await;
    }
}
