use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use bb8_redis::bb8;
use bb8_redis::redis::RedisError;
use chrono::Utc;
use cyder_tools::log::{debug, error};
use dashmap::DashMap;
use redis::Script;
use thiserror::Error;

use crate::config::{RateLimitConfig, RateLimitRule};
use crate::relay::error::RelayError;
use crate::service::app_state::AppState;
use crate::service::redis::RedisPool;
use crate::utils::auth::client_ip;
use crate::utils::request_id::RequestId;

/// Limiter scopes; the tag is prepended to the client ip to form the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    GlobalApi,
    GlobalWeb,
    GlobalRelay,
    Critical,
    Upload,
    Download,
}

impl RateLimitScope {
    pub fn tag(&self) -> &'static str {
        match self {
            RateLimitScope::GlobalApi => "GA",
            RateLimitScope::GlobalWeb => "GW",
            RateLimitScope::GlobalRelay => "GR",
            RateLimitScope::Critical => "CT",
            RateLimitScope::Upload => "UP",
            RateLimitScope::Download => "DW",
        }
    }

    pub fn rule(&self, config: &RateLimitConfig) -> RateLimitRule {
        match self {
            RateLimitScope::GlobalApi => config.global_api,
            RateLimitScope::GlobalWeb => config.global_web,
            RateLimitScope::GlobalRelay => config.global_relay,
            RateLimitScope::Critical => config.critical,
            RateLimitScope::Upload => config.upload,
            RateLimitScope::Download => config.download,
        }
    }

    pub fn key(&self, client_ip: &str) -> String {
        format!("{}{}", self.tag(), client_ip)
    }
}

/// Key of the per-channel request budget.
pub fn channel_key(channel_id: i64) -> String {
    format!("CH{}", channel_id)
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("too many requests")]
    TooManyRequests,
    #[error("rate limit store error: {0}")]
    Store(String),
}

impl From<RedisError> for RateLimitError {
    fn from(e: RedisError) -> Self {
        RateLimitError::Store(e.to_string())
    }
}

impl From<bb8::RunError<RedisError>> for RateLimitError {
    fn from(e: bb8::RunError<RedisError>) -> Self {
        RateLimitError::Store(e.to_string())
    }
}

/// Sliding window over the last `max` accepted timestamps of a key, newest
/// first.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Returns whether a request at `now_ms` is accepted, recording it if so.
    async fn check_at(
        &self,
        key: &str,
        max: usize,
        window: Duration,
        now_ms: i64,
    ) -> Result<bool, RateLimitError>;
}

struct Window {
    stamps: VecDeque<i64>,
    expire_at: i64,
}

/// Single-node backend. Idle keys are dropped by `sweep`.
pub struct MemoryRateLimiter {
    windows: DashMap<String, Window>,
    expiration: Duration,
}

impl MemoryRateLimiter {
    pub fn new(expiration: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            expiration,
        }
    }

    pub fn sweep(&self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.expire_at > now_ms);
        before.saturating_sub(self.windows.len())
    }

    pub fn spawn_sweep_task(self: &Arc<Self>, period: Duration) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let removed = limiter.sweep(Utc::now().timestamp_millis());
                if removed > 0 {
                    debug!("rate limiter swept {} idle keys", removed);
                }
            }
        });
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimiter {
    async fn check_at(
        &self,
        key: &str,
        max: usize,
        window: Duration,
        now_ms: i64,
    ) -> Result<bool, RateLimitError> {
        let expire_at = now_ms + self.expiration.as_millis() as i64;
        let mut slot = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            stamps: VecDeque::new(),
            expire_at,
        });
        slot.expire_at = expire_at;

        if slot.stamps.len() < max {
            slot.stamps.push_front(now_ms);
            return Ok(true);
        }
        let Some(oldest) = slot.stamps.back().copied() else {
            // max == 0
            return Ok(false);
        };
        if now_ms - oldest < window.as_millis() as i64 {
            return Ok(false);
        }
        slot.stamps.push_front(now_ms);
        slot.stamps.truncate(max);
        Ok(true)
    }
}

// KEYS[1] list of accept timestamps, newest first.
// ARGV: max, now_ms, window_ms, ttl_secs. Returns 1 when accepted.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local max = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

if redis.call("LLEN", KEYS[1]) >= max then
  local oldest = tonumber(redis.call("LINDEX", KEYS[1], max - 1))
  if oldest ~= nil and now - oldest < window then
    redis.call("EXPIRE", KEYS[1], ttl)
    return 0
  end
end
redis.call("LPUSH", KEYS[1], now)
redis.call("LTRIM", KEYS[1], 0, max - 1)
redis.call("EXPIRE", KEYS[1], ttl)
return 1
"#;

/// Shared backend on a redis list per key. Check and push run as one
/// script so concurrent nodes cannot both take the last slot.
pub struct RedisRateLimiter {
    pool: RedisPool,
    key_prefix: String,
    expiration: Duration,
}

impl RedisRateLimiter {
    pub fn new(pool: RedisPool, key_prefix: String, expiration: Duration) -> Self {
        Self {
            pool,
            key_prefix,
            expiration,
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimiter {
    async fn check_at(
        &self,
        key: &str,
        max: usize,
        window: Duration,
        now_ms: i64,
    ) -> Result<bool, RateLimitError> {
        if max == 0 {
            return Ok(false);
        }
        let full_key = format!("{}ratelimit:{}", self.key_prefix, key);
        let expire_secs = self.expiration.as_secs().max(1) as i64;
        let mut conn = self.pool.get().await?;

        let accepted: i64 = Script::new(SLIDING_WINDOW_SCRIPT)
            .key(&full_key)
            .arg(max as i64)
            .arg(now_ms)
            .arg(window.as_millis() as i64)
            .arg(expire_secs)
            .invoke_async(&mut *conn)
            .await?;
        Ok(accepted == 1)
    }
}

/// Front door of the limiter; a store fault lets the request through.
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>) -> Self {
        Self { backend }
    }

    pub fn memory(expiration: Duration) -> (Self, Arc<MemoryRateLimiter>) {
        let memory = Arc::new(MemoryRateLimiter::new(expiration));
        (Self::new(memory.clone()), memory)
    }

    pub async fn check_at(
        &self,
        key: &str,
        max: usize,
        window: Duration,
        now_ms: i64,
    ) -> Result<(), RateLimitError> {
        match self.backend.check_at(key, max, window, now_ms).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RateLimitError::TooManyRequests),
            Err(e) => {
                error!("rate limiter failed for {}: {}", key, e);
                Ok(())
            }
        }
    }

    pub async fn check(&self, key: &str, rule: RateLimitRule) -> Result<(), RateLimitError> {
        self.check_at(
            key,
            rule.max_requests,
            Duration::from_secs(rule.window_seconds),
            Utc::now().timestamp_millis(),
        )
        .await
    }
}

/// Rejects the request with a 429 envelope once `scope` is saturated for
/// the client ip.
async fn limit_scope(
    scope: RateLimitScope,
    app_state: Arc<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let rule = scope.rule(&app_state.settings.rate_limit);
    if let Err(RateLimitError::TooManyRequests) =
        app_state.rate_limiter.check(&scope.key(&ip), rule).await
    {
        debug!("{} rejected by {:?} limit", ip, scope);
        app_state.metrics.record_rate_limit_hit(scope.tag());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.to_string())
            .unwrap_or_default();
        return RelayError::rate_limited("too many requests, please try again later")
            .into_response_with(&request_id);
    }
    next.run(request).await
}

pub async fn global_api_rate_limit(
    State(app_state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    limit_scope(RateLimitScope::GlobalApi, app_state, request, next).await
}

pub async fn global_relay_rate_limit(
    State(app_state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    limit_scope(RateLimitScope::GlobalRelay, app_state, request, next).await
}

pub async fn global_web_rate_limit(
    State(app_state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    limit_scope(RateLimitScope::GlobalWeb, app_state, request, next).await
}

pub async fn upload_rate_limit(
    State(app_state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    limit_scope(RateLimitScope::Upload, app_state, request, next).await
}

pub async fn critical_rate_limit(
    State(app_state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    limit_scope(RateLimitScope::Critical, app_state, request, next).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::memory(Duration::from_secs(1200)).0
    }

    #[tokio::test]
    async fn critical_scope_rejects_third_request() {
        let limiter = limiter();
        let key = RateLimitScope::Critical.key("10.0.0.1");
        assert_eq!(key, "CT10.0.0.1");
        let window = Duration::from_secs(60);

        assert!(limiter.check_at(&key, 2, window, 0).await.is_ok());
        assert!(limiter.check_at(&key, 2, window, 1_000).await.is_ok());
        assert!(matches!(
            limiter.check_at(&key, 2, window, 2_000).await,
            Err(RateLimitError::TooManyRequests)
        ));

        // other ips and scopes have their own windows
        let other = RateLimitScope::Critical.key("10.0.0.2");
        assert!(limiter.check_at(&other, 2, window, 2_000).await.is_ok());
        let api = RateLimitScope::GlobalApi.key("10.0.0.1");
        assert!(limiter.check_at(&api, 2, window, 2_000).await.is_ok());
    }

    #[test]
    fn scopes_read_their_own_rule() {
        let config = RateLimitConfig::default();
        assert_eq!(RateLimitScope::Critical.rule(&config), RateLimitRule::new(20, 1200));
        assert_eq!(RateLimitScope::GlobalWeb.rule(&config), RateLimitRule::new(240, 180));
        assert_eq!(RateLimitScope::Download.rule(&config), RateLimitRule::new(10, 60));
        assert_eq!(RateLimitScope::Upload.key("::1"), "UP::1");
        assert_eq!(channel_key(7), "CH7");
    }

    #[tokio::test]
    async fn window_slides() {
        let limiter = limiter();
        let window = Duration::from_secs(60);
        assert!(limiter.check_at("k", 2, window, 0).await.is_ok());
        assert!(limiter.check_at("k", 2, window, 30_000).await.is_ok());
        assert!(limiter.check_at("k", 2, window, 59_999).await.is_err());
        assert!(limiter.check_at("k", 2, window, 60_000).await.is_ok());
        assert!(limiter.check_at("k", 2, window, 80_000).await.is_err());
        assert!(limiter.check_at("k", 2, window, 90_000).await.is_ok());
    }

    #[tokio::test]
    async fn accepted_requests_never_exceed_max_in_any_window() {
        let limiter = limiter();
        let window_ms = 10_000;
        let window = Duration::from_millis(window_ms as u64);
        let mut accepted = Vec::new();
        for t in (0..100_000).step_by(700) {
            if limiter.check_at("burst", 5, window, t).await.is_ok() {
                accepted.push(t);
            }
        }
        for (i, start) in accepted.iter().enumerate() {
            let inside = accepted[i..]
                .iter()
                .take_while(|t| **t < start + window_ms)
                .count();
            assert!(inside <= 5, "{} accepted within window at {}", inside, start);
        }
    }

    #[tokio::test]
    async fn redis_backend_accepts_exactly_max_under_contention() {
        let Some(url) = std::env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()) else {
            return;
        };
        let pool = crate::service::redis::connect(&url, 8)
            .await
            .expect("REDIS_URL is set but redis is unreachable");
        let prefix = format!("one-relay-test-{}:", crate::utils::ID_GENERATOR.generate_id());
        let backend = RedisRateLimiter::new(pool, prefix, Duration::from_secs(120));
        let window = Duration::from_secs(60);

        let results = futures::future::join_all(
            (0..10).map(|_| backend.check_at("burst", 5, window, 1_000)),
        )
        .await;
        let accepted = results.iter().filter(|r| matches!(r, Ok(true))).count();
        assert_eq!(accepted, 5);

        assert!(!backend.check_at("burst", 5, window, 30_000).await.unwrap());
        assert!(backend.check_at("burst", 5, window, 61_000).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_drops_idle_keys() {
        let (limiter, memory) = RateLimiter::memory(Duration::from_secs(1));
        limiter
            .check_at("idle", 1, Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert_eq!(memory.sweep(500), 0);
        assert_eq!(memory.sweep(1_000), 1);
        assert!(limiter.check_at("idle", 1, Duration::from_secs(60), 1_500).await.is_ok());
    }
}
