pub mod app_state;
pub mod batch;
pub mod cache;
pub mod channel_cache;
pub mod health;
pub mod metrics;
pub mod options;
pub mod redis;
pub mod selector;
