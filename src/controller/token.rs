use std::sync::Arc;

use axum::extract::{Json, Path, Query, State};
use axum::routing::get;
use cyder_tools::log::warn;
use serde::Deserialize;

use crate::database::token::{NewTokenPayload, Token, UpdateTokenData};
use crate::database::user::User;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::HttpResult;

use super::BaseError;

async fn invalidate(app_state: &AppState, token: &Token) {
    if let Err(e) = app_state.invalidate_token(&token.key).await {
        warn!("failed to invalidate cached token {}: {:?}", token.id, e);
    }
}

#[derive(Deserialize)]
struct ListQuery {
    user_id: Option<i64>,
}

async fn list(Query(query): Query<ListQuery>) -> Result<HttpResult<Vec<Token>>, BaseError> {
    let tokens = match query.user_id {
        Some(user_id) => Token::list_by_user(user_id)?,
        None => Token::list_all()?,
    };
    Ok(HttpResult::new(tokens))
}

async fn get_token(Path(id): Path<i64>) -> Result<HttpResult<Token>, BaseError> {
    Ok(HttpResult::new(Token::get_by_id(id)?))
}

async fn insert(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NewTokenPayload>,
) -> Result<HttpResult<Token>, BaseError> {
    User::get_by_id(payload.user_id)?;
    let token = Token::create(&payload)?;
    // a key that was looked up before creation may sit in the negative cache
    invalidate(&app_state, &token).await;
    Ok(HttpResult::new(token))
}

async fn update(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateTokenData>,
) -> Result<HttpResult<Token>, BaseError> {
    let token = Token::update(id, &payload)?;
    invalidate(&app_state, &token).await;
    Ok(HttpResult::new(token))
}

async fn delete_token(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<HttpResult<()>, BaseError> {
    let token = Token::get_by_id(id)?;
    Token::delete(id)?;
    invalidate(&app_state, &token).await;
    Ok(HttpResult::new(()))
}

pub fn create_token_router() -> StateRouter {
    create_state_router().nest(
        "/token",
        create_state_router()
            .route("/", get(list).post(insert))
            .route("/{id}", get(get_token).put(update).delete(delete_token)),
    )
}
