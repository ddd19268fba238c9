use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use tokio::sync::Mutex;

/// TTL cache for rendered JSON responses.
///
/// `key_lock` hands out one mutex per key so concurrent misses for the same
/// key compute the response once.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Cache<String, Value>,
    locks: Cache<String, Arc<Mutex<()>>>,
}

impl ResponseCache {
    pub fn new(ttl_seconds: u64, max_entries: u64) -> Self {
        let ttl = Duration::from_secs(ttl_seconds.max(1));
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries.max(1))
                .time_to_live(ttl)
                .build(),
            locks: Cache::builder()
                .max_capacity(max_entries.max(1))
                .time_to_idle(ttl)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).await
    }

    pub async fn put(&self, key: String, value: Value) {
        self.entries.insert(key, value).await;
    }

    pub async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .get_with(key.to_string(), async { Arc::new(Mutex::new(())) })
            .await
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::ResponseCache;

    #[tokio::test]
    async fn stores_values_per_key() {
        let cache = ResponseCache::new(60, 10);
        assert!(cache.get("a").await.is_none());

        cache.put("a".to_string(), json!({ "ok": true })).await;
        assert_eq!(cache.get("a").await, Some(json!({ "ok": true })));
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test]
    async fn same_key_shares_a_lock() {
        let cache = ResponseCache::new(60, 10);
        let first = cache.key_lock("k").await;
        let second = cache.key_lock("k").await;
        let other = cache.key_lock("other").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
