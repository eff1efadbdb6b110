use std::fmt;

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::controller::BaseError;
use crate::service::selector::SelectError;
use crate::utils::limit::RateLimitError;

pub const ALL_CHANNELS_RATE_LIMITED: &str =
    "all available channels for this model are currently rate limited";
pub const GROUP_LOAD_SATURATED: &str =
    "the current group load is saturated, please try again later";

/// Error kinds visible on the wire as `error.type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    InsufficientQuota,
    RateLimit,
    Upstream,
    UpstreamUnreachable,
    OneApi,
    ApiNotImplemented,
    NotFound,
    /// Type string copied from an upstream error body.
    Passthrough(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::InsufficientQuota => "insufficient_quota",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::UpstreamUnreachable => "upstream_unreachable",
            ErrorKind::OneApi => "one_api_error",
            ErrorKind::ApiNotImplemented => "api_not_implemented",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Passthrough(kind) => kind,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub message: String,
    pub param: Option<String>,
    pub code: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    param: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl RelayError {
    pub fn new(kind: ErrorKind, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            param: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<Value>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, StatusCode::FORBIDDEN, message)
    }

    pub fn insufficient_quota(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientQuota, StatusCode::FORBIDDEN, message)
            .with_code("insufficient_quota")
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnreachable, StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OneApi, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApiNotImplemented, StatusCode::NOT_IMPLEMENTED, message)
    }

    pub fn model_not_found(model: &str, group: &str) -> Self {
        Self::new(
            ErrorKind::InvalidRequest,
            StatusCode::SERVICE_UNAVAILABLE,
            format!("no available channel for model {} under group {}", model, group),
        )
        .with_code("model_not_found")
    }

    /// Maps a non-success upstream reply. The upstream kind survives when
    /// the body is already an error envelope; anything else becomes
    /// `upstream_error` with the status code as `param`.
    pub fn from_upstream(status: StatusCode, body: &[u8]) -> Self {
        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
            let error = envelope.error;
            if !error.message.is_empty() {
                let kind = if error.kind.is_empty() {
                    ErrorKind::Upstream
                } else {
                    ErrorKind::Passthrough(error.kind)
                };
                return Self {
                    kind,
                    status,
                    message: error.message,
                    param: error.param.map(|p| match p {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }),
                    code: error.code,
                };
            }
        }
        let text = String::from_utf8_lossy(body);
        let message = if text.trim().is_empty() {
            format!("upstream returned status {}", status.as_u16())
        } else {
            text.chars().take(2048).collect()
        };
        Self {
            kind: ErrorKind::Upstream,
            status,
            message,
            param: Some(status.as_u16().to_string()),
            code: None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }

    /// Whether the retry controller may try another channel.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::UpstreamUnreachable => true,
            ErrorKind::Upstream | ErrorKind::Passthrough(_) => {
                self.status == StatusCode::TOO_MANY_REQUESTS || self.status.is_server_error()
            }
            _ => false,
        }
    }

    pub fn to_json(&self, request_id: &str) -> Value {
        let message = if request_id.is_empty() {
            self.message.clone()
        } else {
            format!("{} (request id: {})", self.message, request_id)
        };
        json!({
            "error": {
                "message": message,
                "type": self.kind.as_str(),
                "param": self.param.clone().unwrap_or_default(),
                "code": self.code.clone().unwrap_or(Value::Null),
            }
        })
    }

    pub fn into_response_with(self, request_id: &str) -> Response {
        let body = self.to_json(request_id);
        let mut response = (self.status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind.as_str(), self.status.as_u16(), self.message)
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.into_response_with("")
    }
}

impl From<BaseError> for RelayError {
    fn from(err: BaseError) -> Self {
        match err {
            BaseError::Unauthorized(msg) => {
                RelayError::unauthorized(msg.unwrap_or_else(|| "invalid token".to_string()))
            }
            BaseError::Forbidden(msg) => {
                RelayError::forbidden(msg.unwrap_or_else(|| "forbidden".to_string()))
            }
            BaseError::ParamInvalid(msg) => {
                RelayError::invalid_request(msg.unwrap_or_else(|| "invalid request".to_string()))
            }
            BaseError::NotFound(msg) => RelayError::new(
                ErrorKind::NotFound,
                StatusCode::NOT_FOUND,
                msg.unwrap_or_else(|| "not found".to_string()),
            ),
            other => RelayError::internal(other.to_string()),
        }
    }
}

impl From<SelectError> for RelayError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::Storage(msg) => RelayError::internal(msg),
            other => RelayError::new(
                ErrorKind::OneApi,
                StatusCode::SERVICE_UNAVAILABLE,
                other.to_string(),
            ),
        }
    }
}

impl From<RateLimitError> for RelayError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::TooManyRequests => RelayError::rate_limited("too many requests"),
            RateLimitError::Store(msg) => RelayError::internal(msg),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::new(
                ErrorKind::UpstreamUnreachable,
                StatusCode::GATEWAY_TIMEOUT,
                format!("upstream request timed out: {}", err),
            )
        } else {
            RelayError::unreachable(format!("upstream request failed: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_envelope_kind_is_kept() {
        let body = br#"{"error":{"message":"bad key","type":"invalid_api_key","param":null,"code":"401"}}"#;
        let err = RelayError::from_upstream(StatusCode::UNAUTHORIZED, body);
        assert_eq!(err.kind, ErrorKind::Passthrough("invalid_api_key".to_string()));
        assert_eq!(err.message, "bad key");
        assert!(!err.is_retryable());
    }

    #[test]
    fn foreign_body_is_wrapped() {
        let err = RelayError::from_upstream(StatusCode::BAD_GATEWAY, b"<html>oops</html>");
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert_eq!(err.param.as_deref(), Some("502"));
        assert!(err.is_retryable());
    }

    #[test]
    fn envelope_carries_request_id() {
        let err = RelayError::rate_limited("slow down");
        let body = err.to_json("2025010112000012345678");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(
            body["error"]["message"],
            "slow down (request id: 2025010112000012345678)"
        );
        let response = err.into_response_with("2025010112000012345678");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-request-id"], "2025010112000012345678");
    }

    #[test]
    fn retry_classification() {
        assert!(RelayError::unreachable("down").is_retryable());
        assert!(RelayError::from_upstream(StatusCode::TOO_MANY_REQUESTS, b"").is_retryable());
        assert!(!RelayError::from_upstream(StatusCode::BAD_REQUEST, b"").is_retryable());
        assert!(!RelayError::insufficient_quota("no").is_retryable());
    }
}
