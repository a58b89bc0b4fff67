use std::time::Duration;

/// Connection settings for the Redis backing store.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    pub url: String,

    /// Number of connections in the `deadpool-redis` command pool.
    /// Subscriptions use their own dedicated connections.
    pub pool_size: usize,

    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
}

impl RedisConfig {
    /// Default settings pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}
