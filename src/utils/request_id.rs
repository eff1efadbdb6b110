use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;

use crate::service::app_state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request id: UTC timestamp to the second followed by 8 random digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let suffix: u32 = rand::rng().random_range(0..100_000_000);
        Self(format!("{}{:08}", stamp, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Deref for RequestId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Stamps the request with a `RequestId`, echoes it on the response and
/// feeds the HTTP metrics.
pub async fn request_id_middleware(
    State(app_state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = RequestId::new();
    request.extensions_mut().insert(request_id.clone());
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = Instant::now();

    let mut response = next.run(request).await;
    app_state.metrics.record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed(),
    );
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_timestamp_and_eight_digits() {
        let id = RequestId::new();
        assert_eq!(id.len(), 22);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
