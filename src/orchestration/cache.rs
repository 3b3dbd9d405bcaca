//! Short-lived cache for repository queries whose answers rarely change.

use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use moka::future::Cache;

use crate::{Error, Result};

const DEFAULT_CAPACITY: u64 = 1_024;

pub struct QueryCache<K, V> {
    cache: Cache<K, V>,
}

impl<K, V> QueryCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, ttl)
    }

    pub fn with_capacity(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: K, value: V) {
        self.cache.insert(key, value).await;
    }

    pub async fn invalidate(&self, key: &K) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Cached value for `key`, running `init` on a miss. Concurrent misses
    /// on one key share a single `init`. Errors are not cached.
    pub async fn get_or_try_insert_with<F>(&self, key: K, init: F) -> Result<V>
    where
        F: Future<Output = Result<V>>,
    {
        self.cache.try_get_with(key, init).await.map_err(Error::unshare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_hits_skip_the_query() {
        let cache: QueryCache<&str, u32> = QueryCache::new(Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let query = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        };
        assert_eq!(cache.get_or_try_insert_with("tip", query()).await.unwrap(), 7);
        assert_eq!(cache.get_or_try_insert_with("tip", query()).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate(&"tip").await;
        cache.get_or_try_insert_with("tip", query()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache: QueryCache<u8, u8> = QueryCache::new(Duration::from_millis(50));
        cache.insert(1, 1).await;
        assert_eq!(cache.get(&1).await, Some(1));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&1).await.is_none());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached_and_keep_their_kind() {
        let cache: QueryCache<u8, u8> = QueryCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_try_insert_with(1, async { Err(Error::not_found("branch", "nope")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        assert!(cache.get(&1).await.is_none());
        assert_eq!(
            cache.get_or_try_insert_with(1, async { Ok(3) }).await.unwrap(),
            3
        );
    }
}
