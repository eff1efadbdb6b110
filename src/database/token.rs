use chrono::Utc;
use rand::{distr::Alphanumeric, rng, Rng};
use serde::Deserialize;

use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::schema::enum_def::TokenStatus;
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = tokens)]
    pub struct Token {
        pub id: i64,
        pub user_id: i64,
        pub key: String,
        pub name: String,
        pub status: TokenStatus,
        pub expired_at: Option<i64>,
        pub remain_quota: i64,
        pub unlimited_quota: bool,
        pub used_quota: i64,
        pub models: Option<String>,
        pub subnet: Option<String>,
        pub created_at: i64,
        pub accessed_at: i64,
    }

    #[derive(AsChangeset, Deserialize, Debug, Default)]
    #[diesel(table_name = tokens)]
    pub struct UpdateTokenData {
        pub name: Option<String>,
        pub status: Option<TokenStatus>,
        pub expired_at: Option<Option<i64>>,
        pub remain_quota: Option<i64>,
        pub unlimited_quota: Option<bool>,
        pub models: Option<Option<String>>,
        pub subnet: Option<Option<String>>,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTokenPayload {
    pub user_id: i64,
    pub name: String,
    /// Generated when absent.
    pub key: Option<String>,
    pub expired_at: Option<i64>,
    #[serde(default)]
    pub remain_quota: i64,
    #[serde(default)]
    pub unlimited_quota: bool,
    pub models: Option<String>,
    pub subnet: Option<String>,
}

/// Balances right after a successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balances {
    pub token_remain: i64,
    pub user_quota: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaShortfall {
    Token,
    User,
}

enum ReserveTxError {
    Short(QuotaShortfall),
    Db(diesel::result::Error),
}

impl From<diesel::result::Error> for ReserveTxError {
    fn from(err: diesel::result::Error) -> Self {
        ReserveTxError::Db(err)
    }
}

pub fn generate_token_key() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

impl Token {
    /// Allowed model names; empty means every model.
    pub fn model_allowlist(&self) -> Vec<String> {
        self.models
            .as_deref()
            .map(|m| {
                m.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn create(payload: &NewTokenPayload) -> DbResult<Token> {
        let now = Utc::now().timestamp_millis();
        let token = Token {
            id: ID_GENERATOR.generate_id(),
            user_id: payload.user_id,
            key: payload
                .key
                .clone()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(generate_token_key),
            name: payload.name.clone(),
            status: TokenStatus::Enabled,
            expired_at: payload.expired_at,
            remain_quota: payload.remain_quota,
            unlimited_quota: payload.unlimited_quota,
            used_quota: 0,
            models: payload.models.clone().filter(|m| !m.trim().is_empty()),
            subnet: payload.subnet.clone().filter(|s| !s.trim().is_empty()),
            created_at: now,
            accessed_at: now,
        };
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::insert_into(tokens::table)
                .values(TokenDb::to_db(&token))
                .execute(conn)
                .map_err(|e| match e {
                    diesel::result::Error::DatabaseError(
                        diesel::result::DatabaseErrorKind::UniqueViolation,
                        _,
                    ) => BaseError::DatabaseDup(Some("token key already exists".to_string())),
                    _ => BaseError::DatabaseFatal(Some(format!("Failed to create token: {}", e))),
                })?;
        });
        Ok(token)
    }

    pub fn update(id_value: i64, data: &UpdateTokenData) -> DbResult<Token> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let updated = diesel::update(tokens::table.find(id_value))
                .set(UpdateTokenDataDb::to_db(data))
                .returning(TokenDb::as_returning())
                .get_result::<TokenDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::NotFound(Some(format!("Token {} not found", id_value)))
                    }
                    _ => BaseError::DatabaseFatal(Some(format!(
                        "Failed to update token {}: {}",
                        id_value, e
                    ))),
                })?;
            Ok(updated.from_db())
        })
    }

    pub fn delete(id_value: i64) -> DbResult<usize> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::delete(tokens::table.find(id_value))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Failed to delete token {}: {}", id_value, e)))
                })
        })
    }

    pub fn get_by_id(id_value: i64) -> DbResult<Token> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let token = tokens::table
                .find(id_value)
                .select(TokenDb::as_select())
                .first::<TokenDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::NotFound(Some(format!("Token {} not found", id_value)))
                    }
                    _ => BaseError::DatabaseFatal(Some(format!("Error fetching token: {}", e))),
                })?;
            Ok(token.from_db())
        })
    }

    pub fn get_by_key(key_value: &str) -> DbResult<Token> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let token = tokens::table
                .filter(tokens::dsl::key.eq(key_value))
                .select(TokenDb::as_select())
                .first::<TokenDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::NotFound(Some("token not found".to_string()))
                    }
                    _ => BaseError::DatabaseFatal(Some(format!("Error fetching token: {}", e))),
                })?;
            Ok(token.from_db())
        })
    }

    pub fn list_by_user(user_id_value: i64) -> DbResult<Vec<Token>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = tokens::table
                .filter(tokens::dsl::user_id.eq(user_id_value))
                .order(tokens::dsl::created_at.desc())
                .select(TokenDb::as_select())
                .load::<TokenDb>(conn)?;
            Ok(rows.into_iter().map(|t| t.from_db()).collect())
        })
    }

    pub fn list_all() -> DbResult<Vec<Token>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = tokens::table
                .order(tokens::dsl::created_at.desc())
                .select(TokenDb::as_select())
                .load::<TokenDb>(conn)?;
            Ok(rows.into_iter().map(|t| t.from_db()).collect())
        })
    }

    /// Decrements token and user balances by `amount` in one transaction,
    /// provided the token is unlimited or holds at least `amount` and the
    /// user holds at least `amount`. Nothing changes on a shortfall.
    pub fn reserve_quota(
        token_id_value: i64,
        user_id_value: i64,
        amount: i64,
    ) -> DbResult<Result<Balances, QuotaShortfall>> {
        let conn = &mut get_connection()?;
        let outcome = db_execute!(conn, {
            conn.transaction::<Balances, ReserveTxError, _>(|conn| {
                let touched = diesel::update(
                    tokens::table
                        .filter(tokens::dsl::id.eq(token_id_value))
                        .filter(
                            tokens::dsl::unlimited_quota
                                .eq(true)
                                .or(tokens::dsl::remain_quota.ge(amount)),
                        ),
                )
                .set(tokens::dsl::remain_quota.eq(tokens::dsl::remain_quota - amount))
                .execute(conn)?;
                if touched == 0 {
                    return Err(ReserveTxError::Short(QuotaShortfall::Token));
                }

                let touched = diesel::update(
                    users::table
                        .filter(users::dsl::id.eq(user_id_value))
                        .filter(users::dsl::quota.ge(amount)),
                )
                .set(users::dsl::quota.eq(users::dsl::quota - amount))
                .execute(conn)?;
                if touched == 0 {
                    return Err(ReserveTxError::Short(QuotaShortfall::User));
                }

                let token_remain = tokens::table
                    .find(token_id_value)
                    .select(tokens::dsl::remain_quota)
                    .first::<i64>(conn)?;
                let user_quota = users::table
                    .find(user_id_value)
                    .select(users::dsl::quota)
                    .first::<i64>(conn)?;
                Ok(Balances {
                    token_remain,
                    user_quota,
                })
            })
        });
        match outcome {
            Ok(balances) => Ok(Ok(balances)),
            Err(ReserveTxError::Short(shortfall)) => Ok(Err(shortfall)),
            Err(ReserveTxError::Db(e)) => Err(BaseError::DatabaseFatal(Some(format!(
                "Failed to reserve quota for token {}: {}",
                token_id_value, e
            )))),
        }
    }

    /// Moves both balances by `-delta`: positive `delta` charges more,
    /// negative refunds.
    pub fn adjust_quota(token_id_value: i64, user_id_value: i64, delta: i64) -> DbResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            conn.transaction::<(), diesel::result::Error, _>(|conn| {
                diesel::update(tokens::table.find(token_id_value))
                    .set((
                        tokens::dsl::remain_quota.eq(tokens::dsl::remain_quota - delta),
                        tokens::dsl::accessed_at.eq(now),
                    ))
                    .execute(conn)?;
                diesel::update(users::table.find(user_id_value))
                    .set(users::dsl::quota.eq(users::dsl::quota - delta))
                    .execute(conn)?;
                Ok(())
            })
            .map_err(|e| {
                BaseError::DatabaseFatal(Some(format!(
                    "Failed to adjust quota for token {}: {}",
                    token_id_value, e
                )))
            })
        })
    }

    pub fn increase_used_quota(id_value: i64, quota_value: i64) -> DbResult<()> {
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(tokens::table.find(id_value))
                .set((
                    tokens::dsl::used_quota.eq(tokens::dsl::used_quota + quota_value),
                    tokens::dsl::accessed_at.eq(now),
                ))
                .execute(conn)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::user::User;
    use crate::testing::{create_user, setup_db, unique_name};

    fn create_token(user_id: i64, remain: i64, unlimited: bool) -> Token {
        Token::create(&NewTokenPayload {
            user_id,
            name: unique_name("token"),
            remain_quota: remain,
            unlimited_quota: unlimited,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn generated_keys_are_unique_and_long() {
        let a = generate_token_key();
        let b = generate_token_key();
        assert_eq!(a.len(), 48);
        assert_ne!(a, b);
    }

    #[test]
    fn allowlist_parses_csv() {
        let token = Token {
            models: Some("gpt-3.5-turbo, gpt-4 ,".to_string()),
            ..Default::default()
        };
        assert_eq!(token.model_allowlist(), vec!["gpt-3.5-turbo", "gpt-4"]);
        assert!(Token::default().model_allowlist().is_empty());
    }

    #[test]
    fn reserve_decrements_both_balances() {
        setup_db();
        let user = create_user(1_000);
        let token = create_token(user.id, 500, false);

        let balances = Token::reserve_quota(token.id, user.id, 200).unwrap().unwrap();
        assert_eq!(balances, Balances { token_remain: 300, user_quota: 800 });
    }

    #[test]
    fn reserve_refuses_short_token_without_side_effects() {
        setup_db();
        let user = create_user(1_000);
        let token = create_token(user.id, 100, false);

        let outcome = Token::reserve_quota(token.id, user.id, 200).unwrap();
        assert_eq!(outcome, Err(QuotaShortfall::Token));
        assert_eq!(Token::get_by_id(token.id).unwrap().remain_quota, 100);
        assert_eq!(User::get_by_id(user.id).unwrap().quota, 1_000);
    }

    #[test]
    fn reserve_rolls_back_token_when_user_is_short() {
        setup_db();
        let user = create_user(50);
        let token = create_token(user.id, 0, true);

        let outcome = Token::reserve_quota(token.id, user.id, 200).unwrap();
        assert_eq!(outcome, Err(QuotaShortfall::User));
        assert_eq!(Token::get_by_id(token.id).unwrap().remain_quota, 0);
        assert_eq!(User::get_by_id(user.id).unwrap().quota, 50);
    }

    #[test]
    fn adjust_charges_and_refunds() {
        setup_db();
        let user = create_user(1_000);
        let token = create_token(user.id, 1_000, false);

        Token::adjust_quota(token.id, user.id, 30).unwrap();
        Token::adjust_quota(token.id, user.id, -10).unwrap();
        assert_eq!(Token::get_by_id(token.id).unwrap().remain_quota, 980);
        assert_eq!(User::get_by_id(user.id).unwrap().quota, 980);
    }
}
