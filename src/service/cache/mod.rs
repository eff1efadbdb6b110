use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use self::types::CacheEntry;

pub mod memory;
pub mod metrics;
pub mod redis;
pub mod repository;
pub mod types;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Backend error: {0}")]
    BackendError(String),
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CacheError::DeserializationError(e.to_string())
    }
}

/// Key/value operations a cache backend has to offer.
#[async_trait]
pub trait CacheBackend<T>: Send + Sync + Clone + 'static
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error>;
    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error>;
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;
    async fn clear(&self) -> Result<(), Self::Error>;
}
