//! Key-value store interface shared by caches, counters and breaker state.
//!
//! Every operation that has to happen exactly once is a single atomic call:
//! [`KeyValueStore::increment`] and [`KeyValueStore::compare_and_swap`]. Callers
//! never read-then-write to mutate shared state.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `ttl = None` keeps the value until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Idempotent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add one and return the new count. `ttl_seconds` is applied
    /// only when this call creates the key; `0` means no expiry.
    async fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError>;

    /// Replace the value only if it currently equals `expected` (`None` = absent).
    /// A `None` replacement deletes the key.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

/// Bound a store call. An elapsed deadline becomes [`StoreError::Timeout`].
///
/// The inner operations are single atomic commands, so abandoning the future
/// never leaves half-applied state behind.
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_reports_elapsed_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(1u64)
        };

        let result = with_timeout(Duration::from_millis(10), slow).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn with_timeout_passes_through_results() {
        let fast = async { Ok::<_, StoreError>(7u64) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await.unwrap(), 7);
    }
}
