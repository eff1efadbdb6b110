use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use config::CONFIG;
use controller::create_router;
use cyder_tools::log::{error, info, LocalLogger};
use relay::pricing::migrate_all_channels;
use relay::token_meter::preload_tokenizers;
use service::app_state::create_app_state;
use service::options::OptionsCoordinator;

mod config;
mod controller;
mod database;
mod relay;
mod schema;
mod service;
mod utils;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() {
    LocalLogger::init(&CONFIG.log_level);
    database::init_pool(&CONFIG.db_url);

    let options = match OptionsCoordinator::load() {
        Ok(options) => Arc::new(options),
        Err(e) => {
            error!("failed to load runtime options: {}", e);
            std::process::exit(1);
        }
    };
    match migrate_all_channels(&options) {
        Ok(0) => {}
        Ok(count) => info!("migrated pricing of {} channels", count),
        Err(e) => error!("pricing migration failed: {}", e),
    }
    preload_tokenizers();

    let app_state = create_app_state(options).await;
    match app_state.channel_cache.refresh().await {
        Ok(count) => info!("channel cache loaded: {} enabled channels", count),
        Err(e) => error!("failed to load channel cache: {}", e),
    }
    if app_state.settings.memory_cache_enabled {
        app_state
            .channel_cache
            .spawn_sync_task(Duration::from_secs(CONFIG.sync_frequency.max(1)));
    }
    if let Some(batch) = &app_state.batch {
        batch.spawn_flush_task(Duration::from_secs(CONFIG.batch_update_interval.max(1)));
    }
    if let Some(limiter) = &app_state.memory_limiter {
        limiter.spawn_sweep_task(Duration::from_secs(CONFIG.rate_limit.key_expiration.max(60)));
    }

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    info!("server start at {}", &addr);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    axum::serve(
        listener,
        create_router(app_state.clone())
            .with_state(app_state)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("failed to start server");
}
