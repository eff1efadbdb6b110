use bb8_redis::bb8::Pool;
use bb8_redis::{redis, RedisConnectionManager};
use cyder_tools::log::{error, info};
use tokio::sync::OnceCell;

use crate::config::CONFIG;

pub type RedisPool = Pool<RedisConnectionManager>;

static POOL: OnceCell<Option<RedisPool>> = OnceCell::const_new();

pub async fn connect(url: &str, pool_size: u32) -> Option<RedisPool> {
    let manager = match RedisConnectionManager::new(url) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to create redis manager: {}", e);
            return None;
        }
    };
    let pool = match Pool::builder().max_size(pool_size).build(manager).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create redis pool: {}", e);
            return None;
        }
    };

    {
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to get redis connection from pool for test: {}", e);
                return None;
            }
        };
        if let Err(e) = redis::cmd("PING").query_async::<()>(&mut *conn).await {
            error!("Failed to ping redis: {}", e);
            return None;
        }
    }
    info!("Redis connection pool initialized and tested successfully");
    Some(pool)
}

/// The process-wide pool, if redis is configured and reachable. Token cache
/// and rate limiter fall back to memory otherwise.
pub async fn get_pool() -> Option<RedisPool> {
    POOL.get_or_init(|| async {
        match CONFIG.redis.as_ref() {
            Some(redis_config) => connect(&redis_config.url, redis_config.pool_size as u32).await,
            None => None,
        }
    })
    .await
    .as_ref()
    .cloned()
}
