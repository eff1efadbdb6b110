use chrono::Utc;

use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = user_request_costs)]
    pub struct UserRequestCost {
        pub id: i64,
        pub request_id: String,
        pub user_id: i64,
        pub quota: i64,
        pub created_at: i64,
    }
}

impl UserRequestCost {
    /// Rows are write-once; there is no update path.
    pub fn insert(request_id_value: &str, user_id_value: i64, quota_value: i64) -> DbResult<UserRequestCost> {
        let row = UserRequestCost {
            id: ID_GENERATOR.generate_id(),
            request_id: request_id_value.to_string(),
            user_id: user_id_value,
            quota: quota_value,
            created_at: Utc::now().timestamp_millis(),
        };
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::insert_into(user_request_costs::table)
                .values(UserRequestCostDb::to_db(&row))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Failed to record cost of request {}: {}",
                        request_id_value, e
                    )))
                })?;
        });
        Ok(row)
    }

    pub fn get_by_request_id(request_id_value: &str) -> DbResult<Option<UserRequestCost>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let row = user_request_costs::table
                .filter(user_request_costs::dsl::request_id.eq(request_id_value))
                .select(UserRequestCostDb::as_select())
                .first::<UserRequestCostDb>(conn)
                .optional()?;
            Ok(row.map(|r| r.from_db()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{setup_db, unique_name};

    #[test]
    fn insert_then_lookup_by_request() {
        setup_db();
        let request_id = unique_name("req");
        assert!(UserRequestCost::get_by_request_id(&request_id).unwrap().is_none());
        UserRequestCost::insert(&request_id, 9, 75).unwrap();
        let row = UserRequestCost::get_by_request_id(&request_id).unwrap().unwrap();
        assert_eq!(row.user_id, 9);
        assert_eq!(row.quota, 75);
    }
}
