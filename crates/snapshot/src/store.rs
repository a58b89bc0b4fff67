use keel_cache::error::CacheError;

/// An owned key/value pair.
pub type Record = (Vec<u8>, Vec<u8>);

/// Embedded durable key/value store that holds snapshots.
///
/// Every method is blocking; async callers run them on the blocking pool.
pub trait DurableStore: Send + Sync {
    /// Write all `records` in one atomic transaction.
    fn write_batch(&self, records: &[Record]) -> Result<(), CacheError>;

    /// Delete every record in one atomic transaction.
    fn clear(&self) -> Result<(), CacheError>;

    /// Every record, in ascending key order.
    fn scan(&self) -> Result<Vec<Record>, CacheError>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError>;

    /// Release the underlying environment. Later calls fail with
    /// [`CacheError::Closed`]. Closing twice is a no-op.
    fn close(&self) -> Result<(), CacheError>;
}
