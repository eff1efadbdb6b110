use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use cyder_tools::auth::{decode_jwt, issue_jwt, DecodingKey, EncodingKey, JwtError, JwtValidation};
use cyder_tools::log::{debug, warn};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controller::BaseError;
use crate::database::user::User;
use crate::relay::error::RelayError;
use crate::schema::enum_def::{TokenStatus, UserRole};
use crate::service::app_state::AppState;
use crate::utils::request_id::RequestId;

const ISSUER: &str = "one-relay";
const SESSION_SUBJECT: &str = "SESSION";
const SESSION_ISSUE_SEC: u64 = 7 * 24 * 3600;
pub const SESSION_COOKIE: &str = "session";

/// Who is calling the relay, resolved from the API token.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: i64,
    pub token_id: i64,
    pub group: String,
    pub role: UserRole,
    /// Remaining token quota at auth time; `None` for unlimited tokens.
    pub token_quota: Option<i64>,
    /// Set by a `:<channel_id>` key suffix.
    pub pinned_channel: Option<i64>,
    /// Empty means every model.
    pub allowed_models: Vec<String>,
}

/// Caller of the admin API.
#[derive(Debug, Clone, Copy)]
pub struct AdminContext {
    pub user_id: i64,
    pub role: UserRole,
}

impl AdminContext {
    pub fn require(&self, role: UserRole) -> Result<(), BaseError> {
        if self.role >= role {
            Ok(())
        } else {
            Err(BaseError::Forbidden(Some(format!(
                "{:?} role required",
                role
            ))))
        }
    }
}

fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Splits `Bearer [sk-]<key>[:<channel_id>]` into key and channel suffix.
pub fn parse_token_header(value: &str) -> Option<(String, Option<String>)> {
    let value = value.trim();
    let value = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    let value = value.strip_prefix("sk-").unwrap_or(value);
    if value.is_empty() {
        return None;
    }
    let mut parts = value.splitn(2, ':');
    let key = parts.next().unwrap_or_default().to_string();
    let channel = parts.next().map(str::to_string);
    Some((key, channel))
}

pub fn client_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn subnet_allows(subnet: &str, ip: Option<IpAddr>) -> bool {
    let Some(ip) = ip else {
        return false;
    };
    subnet
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .any(|cidr| match cidr.parse::<IpNetwork>() {
            Ok(network) => network.contains(ip),
            Err(e) => {
                warn!("ignoring invalid token subnet {}: {}", cidr, e);
                false
            }
        })
}

/// Validates an API token header against the token store (C10).
pub async fn authenticate_token(
    app_state: &AppState,
    header_value: Option<&str>,
    ip: Option<IpAddr>,
) -> Result<AuthContext, RelayError> {
    let result = check_token(app_state, header_value, ip).await;
    app_state.metrics.record_token_auth(result.is_ok());
    result
}

async fn check_token(
    app_state: &AppState,
    header_value: Option<&str>,
    ip: Option<IpAddr>,
) -> Result<AuthContext, RelayError> {
    let (key, channel) = header_value
        .and_then(parse_token_header)
        .ok_or_else(|| RelayError::unauthorized("no api key provided"))?;
    let token = app_state
        .get_token(&key)
        .await
        .map_err(|e| RelayError::internal(e.to_string()))?
        .ok_or_else(|| RelayError::unauthorized("invalid api key"))?;

    match token.status {
        TokenStatus::Enabled => {}
        TokenStatus::Expired => return Err(RelayError::unauthorized("api key has expired")),
        TokenStatus::Exhausted => {
            return Err(RelayError::insufficient_quota("api key quota is used up"));
        }
        TokenStatus::Disabled => return Err(RelayError::unauthorized("api key is disabled")),
    }
    if let Some(expired_at) = token.expired_at {
        if expired_at > 0 && expired_at < chrono::Utc::now().timestamp_millis() {
            return Err(RelayError::unauthorized("api key has expired"));
        }
    }
    if !token.unlimited_quota && token.remain_quota <= 0 {
        return Err(RelayError::insufficient_quota("api key quota is used up"));
    }
    if let Some(subnet) = token.subnet.as_deref().filter(|s| !s.trim().is_empty()) {
        if !subnet_allows(subnet, ip) {
            return Err(RelayError::forbidden(format!(
                "api key may only be used from {}",
                subnet
            )));
        }
    }

    let user = User::get_by_id(token.user_id).map_err(|_| RelayError::unauthorized("invalid api key"))?;
    if !user.is_enabled {
        return Err(RelayError::forbidden("user is disabled"));
    }

    let pinned_channel = match channel {
        None => None,
        Some(raw) => {
            let id = raw.trim().parse::<i64>().map_err(|_| {
                RelayError::invalid_request(format!("invalid channel id: {}", raw))
            })?;
            if user.role < UserRole::Admin {
                return Err(RelayError::forbidden("only admins may pin a channel"));
            }
            Some(id)
        }
    };

    debug!("token {} authenticated for user {}", token.id, user.id);
    Ok(AuthContext {
        user_id: user.id,
        token_id: token.id,
        group: user.group_name,
        role: user.role,
        token_quota: (!token.unlimited_quota).then_some(token.remain_quota),
        pinned_channel,
        allowed_models: token.models.clone(),
    })
}

/// Relay routes: resolves the API token and stamps `AuthContext`.
pub async fn token_auth_middleware(
    State(app_state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.to_string())
        .unwrap_or_default();
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ip = client_ip(&request);
    match authenticate_token(&app_state, header_value.as_deref(), ip).await {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(err) => err.into_response_with(&request_id),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    aud: String,
    exp: u64,
    iat: u64,
    iss: String,
    sub: String,
    jti: String,
}

pub fn issue_session(user_id: i64, secret: &str) -> String {
    let now = get_current_timestamp();
    let claims = SessionClaims {
        aud: user_id.to_string(),
        exp: now + SESSION_ISSUE_SEC,
        iat: now,
        iss: ISSUER.to_string(),
        sub: SESSION_SUBJECT.to_string(),
        jti: Uuid::new_v4().to_string(),
    };
    issue_jwt(&EncodingKey::from_secret(secret.as_bytes()), &claims)
}

pub fn decode_session(token: &str, secret: &str) -> Result<i64, JwtError> {
    let validate = JwtValidation {
        validate_aud: false,
        issuer: ISSUER,
        required_spec: &["jti", "sub", "iat", "exp"],
    };
    let claims = decode_jwt::<SessionClaims>(
        &DecodingKey::from_secret(secret.as_bytes()),
        token,
        validate,
    )?;
    if claims.sub != SESSION_SUBJECT {
        return Err(JwtError::Invalid);
    }
    claims.aud.parse::<i64>().map_err(|_| JwtError::Parse)
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn admin_user(app_state: &AppState, headers: &HeaderMap) -> Result<User, BaseError> {
    if let Some(session) = cookie(headers, SESSION_COOKIE) {
        let user_id = decode_session(session, &app_state.settings.session_secret)
            .map_err(|_| BaseError::Unauthorized(Some("session invalid or expired".to_string())))?;
        return User::get_by_id(user_id);
    }
    let access_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_start_matches("Bearer ").trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BaseError::Unauthorized(Some("login required".to_string())))?;
    User::get_by_access_token(access_token)
}

/// Admin routes: session cookie or a user access token, admin role or above.
pub async fn admin_auth_middleware(
    State(app_state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = match admin_user(&app_state, request.headers()) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    if !user.is_enabled {
        return BaseError::Forbidden(Some("user is disabled".to_string())).into_response();
    }
    let context = AdminContext {
        user_id: user.id,
        role: user.role,
    };
    if let Err(e) = context.require(UserRole::Admin) {
        return e.into_response();
    }
    request.extensions_mut().insert(context);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::token::{NewTokenPayload, Token};
    use crate::service::app_state::AppSettings;
    use crate::testing::{create_user_with, setup_db, test_state, unique_name};
    use axum::http::StatusCode;

    #[test]
    fn header_forms() {
        assert_eq!(
            parse_token_header("Bearer sk-abc"),
            Some(("abc".to_string(), None))
        );
        assert_eq!(
            parse_token_header("Bearer abc:42"),
            Some(("abc".to_string(), Some("42".to_string())))
        );
        assert_eq!(parse_token_header("Bearer "), None);
    }

    #[test]
    fn subnet_matching() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(subnet_allows("10.0.0.0/8", Some(ip)));
        assert!(subnet_allows("192.168.0.0/16, 10.1.2.0/24", Some(ip)));
        assert!(!subnet_allows("192.168.0.0/16", Some(ip)));
        assert!(!subnet_allows("10.0.0.0/8", None));
    }

    #[test]
    fn session_roundtrip_and_wrong_secret() {
        let token = issue_session(7, "secret-a");
        assert_eq!(decode_session(&token, "secret-a").unwrap(), 7);
        assert!(decode_session(&token, "secret-b").is_err());
    }

    fn token_for(user_id: i64, payload: NewTokenPayload) -> Token {
        Token::create(&NewTokenPayload {
            user_id,
            name: unique_name("t"),
            ..payload
        })
        .unwrap()
    }

    #[tokio::test]
    async fn token_checks() {
        setup_db();
        let state = test_state(AppSettings::default());
        let user = create_user_with(1000, UserRole::Common, "default");

        let ok = token_for(
            user.id,
            NewTokenPayload {
                remain_quota: 10,
                models: Some("gpt-4".to_string()),
                subnet: Some("127.0.0.0/8".to_string()),
                ..Default::default()
            },
        );
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let header = format!("Bearer sk-{}", ok.key);
        let context = authenticate_token(&state, Some(&header), Some(local))
            .await
            .unwrap();
        assert_eq!(context.user_id, user.id);
        assert_eq!(context.token_quota, Some(10));
        assert_eq!(context.allowed_models, vec!["gpt-4".to_string()]);

        let remote: IpAddr = "8.8.8.8".parse().unwrap();
        let err = authenticate_token(&state, Some(&header), Some(remote))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let pinned = format!("Bearer sk-{}:5", ok.key);
        let err = authenticate_token(&state, Some(&pinned), Some(local))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = authenticate_token(&state, Some("Bearer sk-nope"), Some(local))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        let err = authenticate_token(&state, None, Some(local)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let empty = token_for(user.id, NewTokenPayload::default());
        let err = authenticate_token(&state, Some(&format!("Bearer {}", empty.key)), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admins_may_pin() {
        setup_db();
        let state = test_state(AppSettings::default());
        let admin = create_user_with(1000, UserRole::Admin, "default");
        let token = token_for(
            admin.id,
            NewTokenPayload {
                unlimited_quota: true,
                ..Default::default()
            },
        );
        let context = authenticate_token(&state, Some(&format!("Bearer {}:12", token.key)), None)
            .await
            .unwrap();
        assert_eq!(context.pinned_channel, Some(12));
        assert_eq!(context.token_quota, None);

        let err = authenticate_token(&state, Some(&format!("Bearer {}:x", token.key)), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
