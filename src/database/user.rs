use chrono::Utc;
use serde::Deserialize;

use super::token::generate_token_key;
use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::schema::enum_def::UserRole;
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = users)]
    pub struct User {
        pub id: i64,
        pub username: String,
        pub role: UserRole,
        pub is_enabled: bool,
        pub group_name: String,
        pub quota: i64,
        pub used_quota: i64,
        pub request_count: i64,
        pub access_token: Option<String>,
        pub created_at: i64,
        pub updated_at: i64,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUserPayload {
    pub username: String,
    #[serde(default)]
    pub role: UserRole,
    pub group_name: Option<String>,
    #[serde(default)]
    pub quota: i64,
}

impl User {
    pub fn create(payload: &NewUserPayload) -> DbResult<User> {
        let now = Utc::now().timestamp_millis();
        let user = User {
            id: ID_GENERATOR.generate_id(),
            username: payload.username.clone(),
            role: payload.role,
            is_enabled: true,
            group_name: payload
                .group_name
                .clone()
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| "default".to_string()),
            quota: payload.quota,
            used_quota: 0,
            request_count: 0,
            access_token: Some(generate_token_key()),
            created_at: now,
            updated_at: now,
        };
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::insert_into(users::table)
                .values(UserDb::to_db(&user))
                .execute(conn)
                .map_err(|e| match e {
                    diesel::result::Error::DatabaseError(
                        diesel::result::DatabaseErrorKind::UniqueViolation,
                        _,
                    ) => BaseError::DatabaseDup(Some(format!(
                        "user {} already exists",
                        payload.username
                    ))),
                    _ => BaseError::DatabaseFatal(Some(format!("Failed to create user: {}", e))),
                })?;
        });
        Ok(user)
    }

    pub fn get_by_id(id_value: i64) -> DbResult<User> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let user = users::table
                .find(id_value)
                .select(UserDb::as_select())
                .first::<UserDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::NotFound(Some(format!("User {} not found", id_value)))
                    }
                    _ => BaseError::DatabaseFatal(Some(format!("Error fetching user: {}", e))),
                })?;
            Ok(user.from_db())
        })
    }

    pub fn get_by_access_token(token_value: &str) -> DbResult<User> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let user = users::table
                .filter(users::dsl::access_token.eq(token_value))
                .select(UserDb::as_select())
                .first::<UserDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::Unauthorized(Some("invalid access token".to_string()))
                    }
                    _ => BaseError::DatabaseFatal(Some(format!("Error fetching user: {}", e))),
                })?;
            Ok(user.from_db())
        })
    }

    /// Adds `amount` to the spendable balance.
    pub fn increase_quota(id_value: i64, amount: i64) -> DbResult<User> {
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let user = diesel::update(users::table.find(id_value))
                .set((
                    users::dsl::quota.eq(users::dsl::quota + amount),
                    users::dsl::updated_at.eq(now),
                ))
                .returning(UserDb::as_returning())
                .get_result::<UserDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::NotFound(Some(format!("User {} not found", id_value)))
                    }
                    _ => BaseError::DatabaseFatal(Some(format!(
                        "Failed to top up user {}: {}",
                        id_value, e
                    ))),
                })?;
            Ok(user.from_db())
        })
    }

    /// Usage counters only; balances move through the ledger.
    pub fn increase_usage(id_value: i64, used: i64, requests: i64) -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(users::table.find(id_value))
                .set((
                    users::dsl::used_quota.eq(users::dsl::used_quota + used),
                    users::dsl::request_count.eq(users::dsl::request_count + requests),
                ))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn set_enabled(id_value: i64, enabled: bool) -> DbResult<()> {
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(users::table.find(id_value))
                .set((
                    users::dsl::is_enabled.eq(enabled),
                    users::dsl::updated_at.eq(now),
                ))
                .execute(conn)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{setup_db, unique_name};

    #[test]
    fn create_assigns_default_group_and_access_token() {
        setup_db();
        let user = User::create(&NewUserPayload {
            username: unique_name("user"),
            quota: 10,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(user.group_name, "default");
        assert_eq!(user.role, UserRole::Common);
        let token = user.access_token.clone().unwrap();
        assert_eq!(User::get_by_access_token(&token).unwrap().id, user.id);
    }

    #[test]
    fn duplicate_username_is_reported() {
        setup_db();
        let payload = NewUserPayload {
            username: unique_name("user"),
            ..Default::default()
        };
        User::create(&payload).unwrap();
        assert!(matches!(User::create(&payload), Err(BaseError::DatabaseDup(_))));
    }

    #[test]
    fn counters_are_field_relative() {
        setup_db();
        let user = User::create(&NewUserPayload {
            username: unique_name("user"),
            quota: 100,
            ..Default::default()
        })
        .unwrap();
        User::increase_usage(user.id, 7, 1).unwrap();
        User::increase_usage(user.id, 3, 1).unwrap();
        let topped = User::increase_quota(user.id, 50).unwrap();
        assert_eq!(topped.quota, 150);
        assert_eq!(topped.used_quota, 10);
        assert_eq!(topped.request_count, 2);
    }
}
