use std::sync::Arc;

use axum::{http, middleware, response::IntoResponse};

use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::auth::admin_auth_middleware;
use crate::utils::limit::{critical_rate_limit, global_api_rate_limit, global_web_rate_limit};
use crate::utils::request_id::request_id_middleware;
use channel::create_channel_router;
use relay::create_relay_router;
use system::{create_session_router, create_system_router};
use token::create_token_router;
use user::create_user_router;

mod channel;
mod error;
mod relay;
mod system;
mod token;
mod user;

pub use error::BaseError;

pub fn create_admin_router(app_state: Arc<AppState>) -> StateRouter {
    let session_router = create_session_router()
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            critical_rate_limit,
        ))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            global_web_rate_limit,
        ));

    create_state_router().nest(
        "/api",
        create_state_router()
            .merge(create_channel_router())
            .merge(create_token_router())
            .merge(create_user_router())
            .merge(create_system_router())
            .layer(middleware::from_fn_with_state(
                app_state.clone(),
                admin_auth_middleware,
            ))
            .merge(session_router)
            .layer(middleware::from_fn_with_state(app_state, global_api_rate_limit)),
    )
}

pub fn create_router(app_state: Arc<AppState>) -> StateRouter {
    create_state_router()
        .merge(create_relay_router(app_state.clone()))
        .merge(create_admin_router(app_state.clone()))
        .fallback(handle_404)
        .layer(middleware::from_fn_with_state(app_state, request_id_middleware))
}

pub async fn handle_404() -> impl IntoResponse {
    (http::StatusCode::NOT_FOUND, "not found")
}
