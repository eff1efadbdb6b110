use async_trait::async_trait;
use bb8_redis::bb8;
use bb8_redis::redis::{self, AsyncCommands, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend};
use crate::service::redis::RedisPool;

#[derive(Debug, Error)]
pub enum RedisCacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Pool error: {0}")]
    Pool(#[from] bb8::RunError<RedisError>),
}

/// Shared cache backend; entries are MessagePack encoded.
#[derive(Clone)]
pub struct RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pool: RedisPool,
    metrics: Arc<CacheMetrics>,
    key_prefix: String,
    _phantom: PhantomData<T>,
}

impl<T> RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    pub fn new(pool: RedisPool, key_prefix: String, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            pool,
            metrics,
            key_prefix,
            _phantom: PhantomData,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl<T> CacheBackend<T> for RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static + Clone,
{
    type Error = RedisCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let mut conn = self.pool.get().await?;
        let raw: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        match raw {
            Some(bytes) => {
                let entry: CacheEntry<T> = rmp_serde::from_slice(&bytes).inspect_err(|_| {
                    self.metrics.record_error();
                })?;
                self.metrics.record_hit();
                Ok(Some(Arc::new(entry)))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let encoded = rmp_serde::to_vec(&*value)?;
        let mut conn = self.pool.get().await?;
        let full_key = self.full_key(key);
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(full_key, encoded, ttl.as_secs().max(1))
                    .await?
            }
            None => conn.set::<_, _, ()>(full_key, encoded).await?,
        }
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(self.full_key(key)).await?;
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{}*", self.key_prefix);

        let mut keys_to_delete: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys_to_delete.extend(keys);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        if !keys_to_delete.is_empty() {
            let mut pipe = redis::pipe();
            for key in &keys_to_delete {
                pipe.del(key);
            }
            pipe.query_async::<()>(&mut *conn).await?;
            cyder_tools::log::info!(
                "Cleared {} keys from redis token cache with prefix '{}'",
                keys_to_delete.len(),
                self.key_prefix
            );
        }
        Ok(())
    }
}
