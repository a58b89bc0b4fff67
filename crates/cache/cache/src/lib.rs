//! Coordination core for the Keel cache layer.
//!
//! This crate holds the backend-agnostic pieces:
//!
//! - [`LockManager`] / [`Lock`]: named leases with owner tokens and
//!   background auto-renewal.
//! - [`NotificationSystem`] / [`Subscription`]: JSON pub/sub with bounded
//!   per-subscriber buffers that drop rather than block.
//! - The [`backend`] traits every store implements, and the shared
//!   [`CacheError`].
//!
//! Concrete stores live in `keel-cache-memory` and `keel-cache-redis`.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod metrics;
pub mod notification;
pub mod testing;
pub mod token;

pub use backend::{Keyspace, LockBackend, MessageStream, PubSubBackend, RawMessage};
pub use config::{LockConfig, NotificationConfig};
pub use error::CacheError;
pub use events::{TaskEvent, WorkflowEvent};
pub use lock::{Lock, LockManager};
pub use metrics::{
    LockMetrics, LockMetricsSnapshot, NotificationMetrics, NotificationMetricsSnapshot,
};
pub use notification::{Message, NotificationSystem, Subscription};
