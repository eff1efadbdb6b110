use axum::{
    response::{IntoResponse, Response},
    Json,
};
use cyder_tools::snow_flake::Snowflake;
use once_cell::sync::Lazy;
use serde::Serialize;

pub mod auth;
pub mod limit;
pub mod request_id;
pub mod sse;

#[derive(Debug, Serialize)]
pub struct HttpResult<T> {
    pub code: usize,
    pub data: T,
}

impl<T> HttpResult<T> {
    pub fn new(data: T) -> HttpResult<T> {
        HttpResult { code: 0, data }
    }
}

impl<T> IntoResponse for HttpResult<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

pub static ID_GENERATOR: Lazy<Snowflake> = Lazy::new(|| Snowflake::new(1));
