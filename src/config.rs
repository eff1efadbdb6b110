use std::{fs, path::Path, time::Duration};

use once_cell::sync::Lazy;
use rand::{distr::Alphanumeric, rng, Rng};
use serde::{Deserialize, Serialize};

// --- START REDIS CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRedisConfig {
    pub url: Option<String>,
    pub pool_size: Option<usize>,
    pub key_prefix: Option<String>,
}

impl PartialRedisConfig {
    fn merge_into(self, final_config: &mut RedisConfig) {
        if let Some(url) = self.url {
            final_config.url = url;
        }
        if let Some(pool_size) = self.pool_size {
            final_config.pool_size = pool_size;
        }
        if let Some(key_prefix) = self.key_prefix {
            final_config.key_prefix = key_prefix;
        }
    }
}

// --- START CACHE CONFIG ---

/// Token cache configuration. The backend follows `redis`: when a redis
/// connection is configured and reachable the cache is shared, otherwise it
/// stays process-local.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl: u64,
    #[serde(default = "default_negative_ttl_seconds")]
    pub negative_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl_seconds(),
            negative_ttl: default_negative_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialCacheConfig {
    pub ttl: Option<u64>,
    pub negative_ttl: Option<u64>,
}

impl PartialCacheConfig {
    fn merge_into(self, final_config: &mut CacheConfig) {
        if let Some(ttl) = self.ttl {
            final_config.ttl = ttl;
        }
        if let Some(negative_ttl) = self.negative_ttl {
            final_config.negative_ttl = negative_ttl;
        }
    }
}

// --- START RATE LIMIT CONFIG ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitRule {
    pub max_requests: usize,
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub const fn new(max_requests: usize, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub global_api: RateLimitRule,
    pub global_web: RateLimitRule,
    pub global_relay: RateLimitRule,
    pub critical: RateLimitRule,
    pub upload: RateLimitRule,
    pub download: RateLimitRule,
    /// Idle lifetime of a limiter key, in seconds.
    pub key_expiration: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_api: RateLimitRule::new(480, 180),
            global_web: RateLimitRule::new(240, 180),
            global_relay: RateLimitRule::new(480, 180),
            critical: RateLimitRule::new(20, 1200),
            upload: RateLimitRule::new(10, 60),
            download: RateLimitRule::new(10, 60),
            key_expiration: 1200,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRateLimitConfig {
    pub global_api: Option<RateLimitRule>,
    pub global_web: Option<RateLimitRule>,
    pub global_relay: Option<RateLimitRule>,
    pub critical: Option<RateLimitRule>,
    pub upload: Option<RateLimitRule>,
    pub download: Option<RateLimitRule>,
    pub key_expiration: Option<u64>,
}

impl PartialRateLimitConfig {
    fn merge_into(self, final_config: &mut RateLimitConfig) {
        if let Some(rule) = self.global_api { final_config.global_api = rule; }
        if let Some(rule) = self.global_web { final_config.global_web = rule; }
        if let Some(rule) = self.global_relay { final_config.global_relay = rule; }
        if let Some(rule) = self.critical { final_config.critical = rule; }
        if let Some(rule) = self.upload { final_config.upload = rule; }
        if let Some(rule) = self.download { final_config.download = rule; }
        if let Some(key_expiration) = self.key_expiration { final_config.key_expiration = key_expiration; }
    }

    // The env keys only carry the maximum; windows stay as configured.
    fn merge_env_maxima(final_config: &mut RateLimitConfig) {
        if let Some(max) = get_env_var::<usize>("GLOBAL_API_RATE_LIMIT") { final_config.global_api.max_requests = max; }
        if let Some(max) = get_env_var::<usize>("GLOBAL_WEB_RATE_LIMIT") { final_config.global_web.max_requests = max; }
        if let Some(max) = get_env_var::<usize>("GLOBAL_RELAY_RATE_LIMIT") { final_config.global_relay.max_requests = max; }
        if let Some(max) = get_env_var::<usize>("CRITICAL_RATE_LIMIT") { final_config.critical.max_requests = max; }
        if let Some(exp) = get_env_var::<u64>("RATE_LIMIT_KEY_EXPIRATION") { final_config.key_expiration = exp; }
    }
}

// Default values
fn default_ttl_seconds() -> u64 {
    3600
}

fn default_negative_ttl_seconds() -> u64 {
    60
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "one-relay:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_url: Option<String>,
    pub log_level: Option<String>,
    pub session_secret: Option<String>,
    pub sync_frequency: Option<u64>,
    pub memory_cache_enabled: Option<bool>,
    pub channel_suspend_seconds_for_429: Option<u64>,
    pub relay_timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub relay_proxy: Option<String>,
    pub user_content_request_proxy: Option<String>,
    pub approximate_token_enabled: Option<bool>,
    pub enforce_include_usage: Option<bool>,
    pub batch_update_enabled: Option<bool>,
    pub batch_update_interval: Option<u64>,
    pub metrics_enabled: Option<bool>,
    pub redis: Option<PartialRedisConfig>,
    pub cache: Option<PartialCacheConfig>,
    pub rate_limit: Option<PartialRateLimitConfig>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config, overwriting existing values.
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host { final_config.host = host; }
        if let Some(port) = self.port { final_config.port = port; }
        if let Some(db_url) = self.db_url { final_config.db_url = db_url; }
        if let Some(log_level) = self.log_level { final_config.log_level = log_level; }
        if let Some(session_secret) = self.session_secret { final_config.session_secret = session_secret; }
        if let Some(v) = self.sync_frequency { final_config.sync_frequency = v; }
        if let Some(v) = self.memory_cache_enabled { final_config.memory_cache_enabled = v; }
        if let Some(v) = self.channel_suspend_seconds_for_429 { final_config.channel_suspend_seconds_for_429 = v; }
        if let Some(v) = self.relay_timeout { final_config.relay_timeout = v; }
        if let Some(v) = self.idle_timeout { final_config.idle_timeout = v; }
        if let Some(v) = self.relay_proxy { final_config.relay_proxy = Some(v); }
        if let Some(v) = self.user_content_request_proxy { final_config.user_content_request_proxy = Some(v); }
        if let Some(v) = self.approximate_token_enabled { final_config.approximate_token_enabled = v; }
        if let Some(v) = self.enforce_include_usage { final_config.enforce_include_usage = v; }
        if let Some(v) = self.batch_update_enabled { final_config.batch_update_enabled = v; }
        if let Some(v) = self.batch_update_interval { final_config.batch_update_interval = v; }
        if let Some(v) = self.metrics_enabled { final_config.metrics_enabled = v; }
        if let Some(redis) = self.redis {
            redis.merge_into(final_config.redis.get_or_insert_with(Default::default));
        }
        if let Some(cache) = self.cache {
            cache.merge_into(&mut final_config.cache)
        }
        if let Some(rate_limit) = self.rate_limit {
            rate_limit.merge_into(&mut final_config.rate_limit)
        }
    }
}

// The fully resolved configuration used by the application.
// This is also the format for the default configuration file.
#[derive(Debug, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub db_url: String,
    pub log_level: String,
    pub session_secret: String,
    pub sync_frequency: u64,
    pub memory_cache_enabled: bool,
    pub channel_suspend_seconds_for_429: u64,
    pub relay_timeout: u64,
    pub idle_timeout: u64,
    pub relay_proxy: Option<String>,
    pub user_content_request_proxy: Option<String>,
    pub approximate_token_enabled: bool,
    pub enforce_include_usage: bool,
    pub batch_update_enabled: bool,
    pub batch_update_interval: u64,
    pub metrics_enabled: bool,
    pub redis: Option<RedisConfig>,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
}

pub fn generate_random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_config_from_env() -> PartialConfig {
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        db_url: get_env_var("SQL_DSN"),
        log_level: get_env_var("LOG_LEVEL"),
        session_secret: get_env_var("SESSION_SECRET"),
        sync_frequency: get_env_var("SYNC_FREQUENCY"),
        memory_cache_enabled: get_env_var("MEMORY_CACHE_ENABLED"),
        channel_suspend_seconds_for_429: get_env_var("CHANNEL_SUSPEND_SECONDS_FOR_429"),
        relay_timeout: get_env_var("RELAY_TIMEOUT"),
        idle_timeout: get_env_var("IDLE_TIMEOUT"),
        relay_proxy: get_env_var("RELAY_PROXY"),
        user_content_request_proxy: get_env_var("USER_CONTENT_REQUEST_PROXY"),
        approximate_token_enabled: get_env_var("APPROXIMATE_TOKEN_ENABLED"),
        enforce_include_usage: get_env_var("ENFORCE_INCLUDE_USAGE"),
        batch_update_enabled: get_env_var("BATCH_UPDATE_ENABLED"),
        batch_update_interval: get_env_var("BATCH_UPDATE_INTERVAL"),
        metrics_enabled: get_env_var("ENABLE_METRIC"),
        redis: get_env_var::<String>("REDIS_CONN_STRING").map(|url| PartialRedisConfig {
            url: Some(url),
            ..Default::default()
        }),
        cache: None,
        rate_limit: None,
    }
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(|| {
    let default_config_path = Path::new("config.default.yaml");
    let user_config_path = if Path::new("config.local.yaml").exists() {
        Path::new("config.local.yaml")
    } else {
        Path::new("config.yaml")
    };

    // Create a FinalConfig with programmatic defaults.
    let mut effective_default_config = FinalConfig {
        host: "0.0.0.0".to_string(),
        port: 3000,
        db_url: "./storage/one-relay.db".to_string(),
        log_level: "info".to_string(),
        session_secret: generate_random_string(48),
        sync_frequency: 600,
        memory_cache_enabled: true,
        channel_suspend_seconds_for_429: 60,
        relay_timeout: 0,
        idle_timeout: 90,
        relay_proxy: None,
        user_content_request_proxy: None,
        approximate_token_enabled: false,
        enforce_include_usage: false,
        batch_update_enabled: false,
        batch_update_interval: 5,
        metrics_enabled: false,
        redis: None,
        cache: CacheConfig::default(),
        rate_limit: RateLimitConfig::default(),
    };

    // If a default config file exists, load it as partial and merge it over the programmatic defaults.
    if default_config_path.exists() {
        if let Ok(config_str) = fs::read_to_string(default_config_path) {
            let file_defaults: PartialConfig = serde_yaml::from_str(&config_str)
                .unwrap_or_else(|e| panic!("Failed to parse default configuration file at {:?}: {}", default_config_path, e));

            file_defaults.merge_into(&mut effective_default_config);
        }
    }

    // Write the (potentially updated) defaults back so new fields show up in the file.
    match serde_yaml::to_string(&effective_default_config) {
        Ok(yaml_str) => {
            if let Err(err) = fs::write(default_config_path, yaml_str) {
                eprintln!("Failed to write default configuration file: {}", err);
            }
        }
        Err(err) => eprintln!("Failed to serialize default configuration: {}", err),
    }

    let mut final_config = effective_default_config;

    if user_config_path.exists() {
        if let Ok(config_str) = fs::read_to_string(user_config_path) {
            let user_config: PartialConfig = serde_yaml::from_str(&config_str)
                .unwrap_or_else(|e| panic!("Failed to parse user configuration file at {:?}: {}", user_config_path, e));

            user_config.merge_into(&mut final_config);
        }
    }

    // Environment variables have the highest priority.
    get_config_from_env().merge_into(&mut final_config);
    PartialRateLimitConfig::merge_env_maxima(&mut final_config.rate_limit);

    final_config
});

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> FinalConfig {
        FinalConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_url: "db".to_string(),
            log_level: "info".to_string(),
            session_secret: "secret".to_string(),
            sync_frequency: 600,
            memory_cache_enabled: true,
            channel_suspend_seconds_for_429: 60,
            relay_timeout: 0,
            idle_timeout: 90,
            relay_proxy: None,
            user_content_request_proxy: None,
            approximate_token_enabled: false,
            enforce_include_usage: false,
            batch_update_enabled: false,
            batch_update_interval: 5,
            metrics_enabled: false,
            redis: None,
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    #[test]
    fn partial_yaml_overrides_only_given_fields() {
        let yaml = r#"
port: 8080
channel_suspend_seconds_for_429: 30
rate_limit:
  critical:
    max_requests: 2
    window_seconds: 60
redis:
  url: redis://cache:6379/
"#;
        let partial: PartialConfig = serde_yaml::from_str(yaml).unwrap();
        let mut config = base_config();
        partial.merge_into(&mut config);

        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.channel_suspend_seconds_for_429, 30);
        assert_eq!(config.rate_limit.critical, RateLimitRule::new(2, 60));
        assert_eq!(config.rate_limit.global_api, RateLimitRule::new(480, 180));
        let redis = config.redis.unwrap();
        assert_eq!(redis.url, "redis://cache:6379/");
        assert_eq!(redis.pool_size, 10);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<PartialConfig, _> = serde_yaml::from_str("not_a_key: 1\n");
        assert!(result.is_err());
    }
}
