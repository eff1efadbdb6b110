// Slim projections of database rows kept in the token cache.

use serde::{de, Deserialize, Serialize};
use serde_with::serde_as;
use std::sync::Arc;

use crate::database::token::Token;
use crate::schema::enum_def::TokenStatus;

/// Either a cached value (Positive) or a marker that the value does not
/// exist (Negative).
#[serde_as]
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum CacheEntry<T: Clone + Serialize + de::DeserializeOwned> {
    Positive(#[serde_as(as = "Arc<serde_with::Same>")] Arc<T>),
    Negative,
}

/// Everything the auth filter needs from a token row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheToken {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: TokenStatus,
    pub expired_at: Option<i64>,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub models: Vec<String>,
    pub subnet: Option<String>,
}

impl From<Token> for CacheToken {
    fn from(db: Token) -> Self {
        let models = db.model_allowlist();
        Self {
            id: db.id,
            user_id: db.user_id,
            name: db.name,
            status: db.status,
            expired_at: db.expired_at,
            remain_quota: db.remain_quota,
            unlimited_quota: db.unlimited_quota,
            models,
            subnet: db.subnet,
        }
    }
}
