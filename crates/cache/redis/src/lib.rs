//! Redis backing store for the Keel cache layer.
//!
//! [`RedisBackend`] implements the lease, pub/sub and keyspace traits from
//! `keel-cache` against a Redis server:
//!
//! - **Leases**: `SET NX PX` plus owner-checked `DEL`/`PEXPIRE`, each as a
//!   Lua script.
//! - **Pub/sub**: one dedicated connection per subscription.
//! - **Keyspace**: incremental `SCAN` with plain `GET`/`SET`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keel_cache::{LockConfig, LockManager};
//! use keel_cache_redis::{RedisBackend, RedisConfig};
//!
//! let backend = Arc::new(RedisBackend::new(&RedisConfig::new("redis://localhost:6379"))?);
//! backend.ping().await?;
//! let locks = LockManager::new(backend, LockConfig::default());
//! ```

mod backend;
mod config;
mod scripts;

pub use backend::RedisBackend;
pub use config::RedisConfig;
