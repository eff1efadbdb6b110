use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use cyder_tools::log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::batch::BatchUpdater;
use super::cache::metrics::CacheMetrics;
use super::cache::redis::RedisCacheBackend;
use super::cache::repository::CacheRepository;
use super::cache::types::{CacheEntry, CacheToken};
use super::cache::{memory::MemoryCacheBackend, CacheError};
use super::channel_cache::ChannelCache;
use super::health::ChannelHealth;
use super::metrics::{CounterRecorder, MetricsRecorder, NoopRecorder};
use super::options::OptionsCoordinator;
use super::selector::Selector;
use crate::config::{RateLimitConfig, CONFIG};
use crate::controller::BaseError;
use crate::database::token::Token;
use crate::relay::adaptor::AdaptorRegistry;
use crate::relay::quota::QuotaLedger;
use crate::relay::token_meter::TokenMeter;
use crate::service::redis::{self, RedisPool};
use crate::utils::limit::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};

#[derive(Clone)]
enum AnyCacheRepo<T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static> {
    Memory(CacheRepository<T, MemoryCacheBackend<T>>),
    Redis(CacheRepository<T, RedisCacheBackend<T>>),
}

impl<T> AnyCacheRepo<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    async fn get_entry(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.get_entry(key).await,
            AnyCacheRepo::Redis(repo) => repo.get_entry(key).await,
        }
    }

    async fn set_positive(&self, key: &str, value: &T) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_positive(key, value).await,
            AnyCacheRepo::Redis(repo) => repo.set_positive(key, value).await,
        }
    }

    async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_negative(key, ttl).await,
            AnyCacheRepo::Redis(repo) => repo.set_negative(key, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.delete(key).await,
            AnyCacheRepo::Redis(repo) => repo.delete(key).await,
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.clear().await,
            AnyCacheRepo::Redis(repo) => repo.clear().await,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppStoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Cache error: {0}")]
    CacheError(String),
}

impl From<CacheError> for AppStoreError {
    fn from(e: CacheError) -> Self {
        AppStoreError::CacheError(e.to_string())
    }
}

impl From<BaseError> for AppStoreError {
    fn from(e: BaseError) -> Self {
        AppStoreError::DatabaseError(e.to_string())
    }
}

/// Process settings the request path reads, lifted out of `CONFIG` so tests
/// can build a state without touching the config files.
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub memory_cache_enabled: bool,
    pub channel_suspend: Duration,
    /// `None` means no deadline.
    pub relay_timeout: Option<Duration>,
    pub idle_timeout: Duration,
    pub relay_proxy: Option<String>,
    pub user_content_request_proxy: Option<String>,
    pub approximate_token: bool,
    pub enforce_include_usage: bool,
    pub batch_update_enabled: bool,
    pub metrics_enabled: bool,
    pub session_secret: String,
    pub rate_limit: RateLimitConfig,
    pub cache_ttl: Duration,
    pub negative_cache_ttl: Duration,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            memory_cache_enabled: true,
            channel_suspend: Duration::from_secs(60),
            relay_timeout: None,
            idle_timeout: Duration::from_secs(90),
            relay_proxy: None,
            user_content_request_proxy: None,
            approximate_token: false,
            enforce_include_usage: false,
            batch_update_enabled: false,
            metrics_enabled: false,
            session_secret: "one-relay-test-secret".to_string(),
            rate_limit: RateLimitConfig::default(),
            cache_ttl: Duration::from_secs(3600),
            negative_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl AppSettings {
    pub fn from_config() -> Self {
        Self {
            memory_cache_enabled: CONFIG.memory_cache_enabled,
            channel_suspend: Duration::from_secs(CONFIG.channel_suspend_seconds_for_429),
            relay_timeout: (CONFIG.relay_timeout > 0)
                .then(|| Duration::from_secs(CONFIG.relay_timeout)),
            idle_timeout: Duration::from_secs(CONFIG.idle_timeout),
            relay_proxy: CONFIG.relay_proxy.clone(),
            user_content_request_proxy: CONFIG.user_content_request_proxy.clone(),
            approximate_token: CONFIG.approximate_token_enabled,
            enforce_include_usage: CONFIG.enforce_include_usage,
            batch_update_enabled: CONFIG.batch_update_enabled,
            metrics_enabled: CONFIG.metrics_enabled,
            session_secret: CONFIG.session_secret.clone(),
            rate_limit: CONFIG.rate_limit.clone(),
            cache_ttl: CONFIG.cache.ttl(),
            negative_cache_ttl: CONFIG.cache.negative_ttl(),
        }
    }
}

fn http_client(proxy: Option<&str>, idle_timeout: Duration) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().pool_idle_timeout(idle_timeout);
    if let Some(url) = proxy.filter(|url| !url.is_empty()) {
        match reqwest::Proxy::all(url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => warn!("ignoring invalid proxy {}: {}", url, e),
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!("failed to build http client, using defaults: {}", e);
        reqwest::Client::new()
    })
}

/// Shared state of every handler.
pub struct AppState {
    token_cache: AnyCacheRepo<CacheToken>,
    pub cache_metrics: Arc<CacheMetrics>,
    pub channel_cache: Arc<ChannelCache>,
    pub selector: Selector,
    pub options: Arc<OptionsCoordinator>,
    pub rate_limiter: RateLimiter,
    /// Set when the limiter keeps its windows in process memory.
    pub memory_limiter: Option<Arc<MemoryRateLimiter>>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub counters: Option<Arc<CounterRecorder>>,
    pub health: ChannelHealth,
    pub ledger: Arc<QuotaLedger>,
    pub batch: Option<Arc<BatchUpdater>>,
    pub relay_client: reqwest::Client,
    pub meter: TokenMeter,
    pub registry: AdaptorRegistry,
    pub settings: AppSettings,
}

impl AppState {
    pub fn new(
        settings: AppSettings,
        options: Arc<OptionsCoordinator>,
        redis_pool: Option<RedisPool>,
        redis_key_prefix: &str,
    ) -> Self {
        let cache_metrics = Arc::new(CacheMetrics::new());
        let ttl = Some(settings.cache_ttl);
        let token_cache = match &redis_pool {
            Some(pool) => {
                info!("Using Redis token cache backend.");
                let backend = RedisCacheBackend::new(
                    pool.clone(),
                    format!("{}token:", redis_key_prefix),
                    cache_metrics.clone(),
                );
                AnyCacheRepo::Redis(CacheRepository::new(backend, ttl))
            }
            None => {
                info!("Using in-memory token cache backend.");
                AnyCacheRepo::Memory(CacheRepository::new(
                    MemoryCacheBackend::new(cache_metrics.clone()),
                    ttl,
                ))
            }
        };

        let expiration = Duration::from_secs(settings.rate_limit.key_expiration);
        let (rate_limiter, memory_limiter) = match &redis_pool {
            Some(pool) => (
                RateLimiter::new(Arc::new(RedisRateLimiter::new(
                    pool.clone(),
                    redis_key_prefix.to_string(),
                    expiration,
                ))),
                None,
            ),
            None => {
                let (limiter, memory) = RateLimiter::memory(expiration);
                (limiter, Some(memory))
            }
        };

        let counters = settings
            .metrics_enabled
            .then(|| Arc::new(CounterRecorder::new()));
        let metrics: Arc<dyn MetricsRecorder> = match &counters {
            Some(counters) => counters.clone(),
            None => Arc::new(NoopRecorder),
        };

        let batch = settings
            .batch_update_enabled
            .then(|| Arc::new(BatchUpdater::new()));
        let channel_cache = Arc::new(ChannelCache::new());

        Self {
            token_cache,
            cache_metrics,
            selector: Selector::new(channel_cache.clone(), settings.memory_cache_enabled),
            health: ChannelHealth::new(channel_cache.clone(), metrics.clone()),
            channel_cache,
            options,
            rate_limiter,
            memory_limiter,
            ledger: Arc::new(QuotaLedger::new(batch.clone(), metrics.clone())),
            metrics,
            counters,
            batch,
            relay_client: http_client(settings.relay_proxy.as_deref(), settings.idle_timeout),
            meter: TokenMeter::new(
                settings.approximate_token,
                http_client(
                    settings.user_content_request_proxy.as_deref(),
                    settings.idle_timeout,
                ),
            ),
            registry: AdaptorRegistry::new(),
            settings,
        }
    }

    fn hash_key(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn token_cache_key(key: &str) -> String {
        format!("token:key:{}", Self::hash_key(key))
    }

    /// Token by its secret, through the cache. Unknown keys are cached
    /// negatively for a short while.
    pub async fn get_token(&self, key: &str) -> Result<Option<Arc<CacheToken>>, AppStoreError> {
        let cache_key = Self::token_cache_key(key);

        if let Some(entry) = self.token_cache.get_entry(&cache_key).await? {
            return match &*entry {
                CacheEntry::Positive(value) => {
                    debug!("cache hit (positive): {}", &cache_key);
                    Ok(Some(value.clone()))
                }
                CacheEntry::Negative => {
                    debug!("cache hit (negative): {}", &cache_key);
                    Ok(None)
                }
            };
        }

        debug!("cache miss: {}", &cache_key);
        match Token::get_by_key(key) {
            Ok(token) => {
                let cached = CacheToken::from(token);
                self.token_cache.set_positive(&cache_key, &cached).await?;
                Ok(Some(Arc::new(cached)))
            }
            Err(BaseError::NotFound(_)) => {
                self.token_cache
                    .set_negative(&cache_key, self.settings.negative_cache_ttl)
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn invalidate_token(&self, key: &str) -> Result<(), AppStoreError> {
        let cache_key = Self::token_cache_key(key);
        debug!("invalidate: {}", &cache_key);
        self.token_cache.delete(&cache_key).await?;
        Ok(())
    }

    pub async fn clear_cache(&self) {
        if let Err(e) = self.token_cache.clear().await {
            cyder_tools::log::error!("Failed to clear token cache: {}", e);
        }
    }
}

pub async fn create_app_state(options: Arc<OptionsCoordinator>) -> Arc<AppState> {
    let settings = AppSettings::from_config();
    let redis_pool = redis::get_pool().await;
    let key_prefix = CONFIG
        .redis
        .as_ref()
        .map(|r| r.key_prefix.clone())
        .unwrap_or_default();
    let app_state = Arc::new(AppState::new(settings, options, redis_pool, &key_prefix));
    app_state.clear_cache().await;
    app_state
}

pub type StateRouter = Router<Arc<AppState>>;

pub fn create_state_router() -> StateRouter {
    Router::<Arc<AppState>>::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::token::NewTokenPayload;
    use crate::testing::{create_user, setup_db, test_state, unique_name};

    #[tokio::test]
    async fn token_lookup_is_cached_both_ways() {
        setup_db();
        let state = test_state(AppSettings::default());
        let user = create_user(100);
        let token = Token::create(&NewTokenPayload {
            user_id: user.id,
            name: unique_name("t"),
            unlimited_quota: true,
            ..Default::default()
        })
        .unwrap();

        let found = state.get_token(&token.key).await.unwrap().unwrap();
        assert_eq!(found.id, token.id);
        Token::delete(token.id).unwrap();
        // still served from cache until invalidated
        assert!(state.get_token(&token.key).await.unwrap().is_some());
        state.invalidate_token(&token.key).await.unwrap();
        assert!(state.get_token(&token.key).await.unwrap().is_none());

        assert!(state.get_token("sk-missing").await.unwrap().is_none());
        let before = state.cache_metrics.snapshot().hits;
        assert!(state.get_token("sk-missing").await.unwrap().is_none());
        assert_eq!(state.cache_metrics.snapshot().hits, before + 1);
    }
}
