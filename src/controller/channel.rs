use std::sync::Arc;

use axum::extract::{Json, Path, State};
use axum::routing::{get, post, put};
use cyder_tools::log::{error, info};
use serde::Deserialize;

use crate::database::channel::{Channel, NewChannelPayload, UpdateChannelData};
use crate::schema::enum_def::ChannelStatus;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::HttpResult;

use super::BaseError;

/// Mutations rebuild abilities in storage; the cache follows right away.
async fn refresh_cache(app_state: &AppState) {
    if let Err(e) = app_state.channel_cache.refresh().await {
        error!("failed to refresh channel cache: {}", e);
    }
}

async fn list() -> Result<HttpResult<Vec<Channel>>, BaseError> {
    Ok(HttpResult::new(Channel::list_all()?))
}

async fn get_channel(Path(id): Path<i64>) -> Result<HttpResult<Channel>, BaseError> {
    Ok(HttpResult::new(Channel::get_by_id(id)?))
}

async fn insert(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NewChannelPayload>,
) -> Result<HttpResult<Channel>, BaseError> {
    if payload.name.trim().is_empty() || payload.models.trim().is_empty() {
        return Err(BaseError::ParamInvalid(Some(
            "name and models are required".to_string(),
        )));
    }
    let channel = Channel::create(&payload)?;
    info!("channel {} ({}) created", channel.id, channel.name);
    refresh_cache(&app_state).await;
    Ok(HttpResult::new(channel))
}

async fn update(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateChannelData>,
) -> Result<HttpResult<Channel>, BaseError> {
    let channel = Channel::update(id, &payload)?;
    refresh_cache(&app_state).await;
    Ok(HttpResult::new(channel))
}

#[derive(Deserialize)]
struct StatusPayload {
    status: ChannelStatus,
}

async fn update_status(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<StatusPayload>,
) -> Result<HttpResult<Channel>, BaseError> {
    let channel = Channel::update_status(id, payload.status)?;
    info!("channel {} status set to {:?}", id, payload.status);
    refresh_cache(&app_state).await;
    Ok(HttpResult::new(channel))
}

async fn delete_channel(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<HttpResult<usize>, BaseError> {
    let deleted = Channel::delete(id)?;
    if deleted == 0 {
        return Err(BaseError::NotFound(Some(format!("Channel {} not found", id))));
    }
    refresh_cache(&app_state).await;
    Ok(HttpResult::new(deleted))
}

pub fn create_channel_router() -> StateRouter {
    create_state_router().nest(
        "/channel",
        create_state_router()
            .route("/", get(list).post(insert))
            .route("/{id}", get(get_channel).put(update).delete(delete_channel))
            .route("/{id}/status", post(update_status))
            .route("/{id}/abilities", put(rebuild_abilities)),
    )
}

/// Rewrites the ability rows of one channel from its current definition.
async fn rebuild_abilities(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<HttpResult<usize>, BaseError> {
    let channel = Channel::get_by_id(id)?;
    let rows = crate::database::ability::Ability::rebuild(&channel)?;
    refresh_cache(&app_state).await;
    Ok(HttpResult::new(rows))
}
