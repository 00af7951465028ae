//! Shared counting backends.
//!
//! The rate limiter only needs two things from a backend: an atomic
//! increment that creates missing keys at 1, and a way to attach a time to
//! live to a key. Anything that provides those can back the limiter.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failures reaching or using a counting backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A shared key/counter store with expiry support.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key`, creating it at 1 if absent.
    ///
    /// Returns the new count.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Set the remaining lifetime of `key`. Setting it twice is harmless.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Count one hit against `key` and start its window on first use.
    ///
    /// The expiry is only attached when the increment created the key, so
    /// the window is fixed from the first hit. Backends that can do both in
    /// one atomic round trip should override this.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let count = self.increment(key).await?;
        if count == 1 {
            self.set_expiry(key, window).await?;
        }
        Ok(count)
    }
}
