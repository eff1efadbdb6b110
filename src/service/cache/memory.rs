use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend};

#[derive(Debug, Error)]
#[error("Memory cache error: {0}")]
pub struct MemoryCacheError(String);

type Slot<T> = (Arc<CacheEntry<T>>, Option<Instant>);

#[derive(Clone)]
pub struct MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    data: Arc<DashMap<String, Slot<T>>>,
    metrics: Arc<CacheMetrics>,
}

impl<T> MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    /// Must be called inside a tokio runtime: a sweeper task is spawned.
    pub fn new(metrics: Arc<CacheMetrics>) -> Self {
        let backend = Self {
            data: Arc::new(DashMap::new()),
            metrics,
        };
        backend.clone().spawn_cleanup_task();
        backend
    }

    fn spawn_cleanup_task(self) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                self.cleanup_expired();
            }
        });
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        let before = self.data.len();
        self.data
            .retain(|_, (_, expiration)| expiration.is_none_or(|exp| now < exp));
        let removed = before.saturating_sub(self.data.len());
        if removed > 0 {
            cyder_tools::log::debug!("Cleaned up {} expired token cache entries", removed);
        }
    }
}

#[async_trait]
impl<T> CacheBackend<T> for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error = MemoryCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let hit = self.data.get(key).map(|slot| {
            let (value, expiration) = slot.value();
            (value.clone(), *expiration)
        });
        match hit {
            Some((_, Some(exp))) if Instant::now() >= exp => {
                self.data.remove(key);
                self.metrics.record_miss();
                Ok(None)
            }
            Some((value, _)) => {
                self.metrics.record_hit();
                Ok(Some(value))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let expiration = ttl.map(|d| Instant::now() + d);
        self.data.insert(key.to_string(), (value, expiration));
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.data.remove(key);
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.data.clear();
        cyder_tools::log::info!("In-memory token cache cleared.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryCacheBackend<String> {
        MemoryCacheBackend::new(Arc::new(CacheMetrics::new()))
    }

    #[tokio::test]
    async fn positive_and_negative_entries() {
        let cache = backend();
        cache
            .set("a", Arc::new(CacheEntry::Positive(Arc::new("v".to_string()))), None)
            .await
            .unwrap();
        cache.set("b", Arc::new(CacheEntry::Negative), None).await.unwrap();

        assert!(matches!(*cache.get("a").await.unwrap().unwrap(), CacheEntry::Positive(_)));
        assert!(matches!(*cache.get("b").await.unwrap().unwrap(), CacheEntry::Negative));
        assert_eq!(cache.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = backend();
        cache
            .set(
                "k",
                Arc::new(CacheEntry::Positive(Arc::new("v".to_string()))),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_and_metrics() {
        let cache = backend();
        cache
            .set("k", Arc::new(CacheEntry::Positive(Arc::new("v".to_string()))), None)
            .await
            .unwrap();
        cache.get("k").await.unwrap();
        cache.delete("k").await.unwrap();
        cache.get("k").await.unwrap();

        let snapshot = cache.metrics.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.sets, 1);
        assert_eq!(snapshot.deletes, 1);
    }
}
