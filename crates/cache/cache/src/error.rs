use thiserror::Error;

/// Errors from lock, notification, and snapshot operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("lock not acquired: {0} is already locked")]
    NotAcquired(String),

    #[error("lock not held: {0}")]
    NotHeld(String),

    #[error("lock not owned: {0} is held by another owner or has expired")]
    NotOwned(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl CacheError {
    /// Returns `true` for the lock ownership variants that a caller can
    /// recover from by re-acquiring.
    pub fn is_lock_state(&self) -> bool {
        matches!(
            self,
            Self::NotAcquired(_) | Self::NotHeld(_) | Self::NotOwned(_)
        )
    }
}
