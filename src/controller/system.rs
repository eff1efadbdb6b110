use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Json, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Extension;
use serde::{Deserialize, Serialize};

use crate::database::user::User;
use crate::schema::enum_def::UserRole;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::service::cache::metrics::CacheMetricsSnapshot;
use crate::service::metrics::MetricsSnapshot;
use crate::utils::auth::{issue_session, AdminContext, SESSION_COOKIE};
use crate::utils::HttpResult;

use super::BaseError;

async fn list_options(
    State(app_state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
) -> Result<HttpResult<BTreeMap<&'static str, String>>, BaseError> {
    admin.require(UserRole::Root)?;
    Ok(HttpResult::new(app_state.options.current().to_rows()))
}

#[derive(Deserialize)]
struct OptionPayload {
    key: String,
    value: String,
}

async fn update_option(
    State(app_state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Json(payload): Json<OptionPayload>,
) -> Result<HttpResult<BTreeMap<&'static str, String>>, BaseError> {
    admin.require(UserRole::Root)?;
    let options = app_state.options.update(&payload.key, &payload.value)?;
    Ok(HttpResult::new(options.to_rows()))
}

#[derive(Serialize)]
struct MetricsReport {
    enabled: bool,
    relay: Option<MetricsSnapshot>,
    token_cache: CacheMetricsSnapshot,
}

async fn metrics(State(app_state): State<Arc<AppState>>) -> HttpResult<MetricsReport> {
    HttpResult::new(MetricsReport {
        enabled: app_state.settings.metrics_enabled,
        relay: app_state.metrics.snapshot(),
        token_cache: app_state.cache_metrics.snapshot(),
    })
}

pub fn create_system_router() -> StateRouter {
    create_state_router()
        .route("/option", get(list_options).put(update_option))
        .route("/metrics", get(metrics))
}

#[derive(Deserialize)]
struct SessionPayload {
    access_token: String,
}

#[derive(Serialize)]
struct SessionUser {
    id: i64,
    username: String,
    role: UserRole,
}

/// Exchanges a user access token for a signed session cookie.
async fn create_session(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<SessionPayload>,
) -> Result<Response, BaseError> {
    let user = User::get_by_access_token(payload.access_token.trim())?;
    if !user.is_enabled {
        return Err(BaseError::Forbidden(Some("user is disabled".to_string())));
    }
    let session = issue_session(user.id, &app_state.settings.session_secret);
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE,
        session,
        7 * 24 * 3600
    );
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|e| BaseError::InternalServerError(Some(e.to_string())))?;
    let mut response = HttpResult::new(SessionUser {
        id: user.id,
        username: user.username,
        role: user.role,
    })
    .into_response();
    response.headers_mut().insert(SET_COOKIE, cookie);
    Ok(response)
}

async fn delete_session() -> Response {
    let mut response = HttpResult::new(()).into_response();
    response.headers_mut().insert(
        SET_COOKIE,
        HeaderValue::from_static("session=; Path=/; HttpOnly; Max-Age=0"),
    );
    response
}

pub fn create_session_router() -> StateRouter {
    create_state_router().route("/session", post(create_session).delete(delete_session))
}
