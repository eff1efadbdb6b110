use axum::extract::{Json, Path};
use axum::routing::{get, post};
use axum::Extension;
use cyder_tools::log::info;
use serde::Deserialize;

use crate::database::user::{NewUserPayload, User};
use crate::schema::enum_def::UserRole;
use crate::service::app_state::{create_state_router, StateRouter};
use crate::utils::auth::AdminContext;
use crate::utils::HttpResult;

use super::BaseError;

async fn get_user(Path(id): Path<i64>) -> Result<HttpResult<User>, BaseError> {
    Ok(HttpResult::new(User::get_by_id(id)?))
}

async fn insert(
    Extension(admin): Extension<AdminContext>,
    Json(payload): Json<NewUserPayload>,
) -> Result<HttpResult<User>, BaseError> {
    if payload.role >= admin.role && admin.role != UserRole::Root {
        return Err(BaseError::Forbidden(Some(
            "cannot create a user with an equal or higher role".to_string(),
        )));
    }
    Ok(HttpResult::new(User::create(&payload)?))
}

#[derive(Deserialize)]
struct QuotaPayload {
    amount: i64,
}

async fn top_up(
    Extension(admin): Extension<AdminContext>,
    Path(id): Path<i64>,
    Json(payload): Json<QuotaPayload>,
) -> Result<HttpResult<User>, BaseError> {
    if payload.amount == 0 {
        return Err(BaseError::ParamInvalid(Some("amount must not be zero".to_string())));
    }
    let user = User::increase_quota(id, payload.amount)?;
    info!(
        "user {} quota changed by {} by admin {}, now {}",
        id, payload.amount, admin.user_id, user.quota
    );
    Ok(HttpResult::new(user))
}

pub fn create_user_router() -> StateRouter {
    create_state_router().nest(
        "/user",
        create_state_router()
            .route("/", post(insert))
            .route("/{id}", get(get_user))
            .route("/{id}/quota", post(top_up)),
    )
}
