use std::fmt;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use reqwest::StatusCode;
use serde_json::json;

#[derive(Debug)]
pub enum BaseError {
    ParamInvalid(Option<String>),
    DatabaseFatal(Option<String>),
    DatabaseDup(Option<String>),
    NotFound(Option<String>),
    Unauthorized(Option<String>),
    Forbidden(Option<String>),
    StoreError(Option<String>), // For AppStoreError
    InternalServerError(Option<String>),
}

impl BaseError {
    fn parts(&self) -> (StatusCode, i32, String) {
        let text = |msg: &Option<String>, fallback: &str| {
            msg.clone().unwrap_or_else(|| fallback.to_string())
        };
        match self {
            BaseError::ParamInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                1001,
                text(msg, "request params invalid"),
            ),
            BaseError::DatabaseFatal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                1100,
                text(msg, "database unknown error"),
            ),
            BaseError::DatabaseDup(msg) => (
                StatusCode::BAD_REQUEST,
                1101,
                text(msg, "some unique keys have conflicted"),
            ),
            BaseError::NotFound(msg) => (StatusCode::NOT_FOUND, 1002, text(msg, "data not found")),
            BaseError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, 1003, text(msg, "Unauthorized"))
            }
            BaseError::Forbidden(msg) => (StatusCode::FORBIDDEN, 1004, text(msg, "Forbidden")),
            BaseError::StoreError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                1200,
                text(msg, "Application cache/store operation failed"),
            ),
            BaseError::InternalServerError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                0,
                text(msg, "internal server error"),
            ),
        }
    }
}

impl fmt::Display for BaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, code, msg) = self.parts();
        write!(f, "[{}] {}", code, msg)
    }
}

impl std::error::Error for BaseError {}

impl From<crate::service::app_state::AppStoreError> for BaseError {
    fn from(err: crate::service::app_state::AppStoreError) -> Self {
        BaseError::StoreError(Some(err.to_string()))
    }
}

impl From<diesel::result::Error> for BaseError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => BaseError::NotFound(None),
            other => BaseError::DatabaseFatal(Some(other.to_string())),
        }
    }
}

impl IntoResponse for BaseError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message) = self.parts();
        let body = Json(json!({
            "code": error_code,
            "msg": error_message,
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_403() {
        let response = BaseError::Forbidden(Some("admin only".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn display_carries_code_and_message() {
        assert_eq!(BaseError::NotFound(None).to_string(), "[1002] data not found");
    }
}
