use chrono::Utc;

use super::{get_connection, DbResult, ListResult};
use crate::controller::BaseError;
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = logs)]
    pub struct ConsumeLog {
        pub id: i64,
        pub user_id: i64,
        pub token_id: i64,
        pub model: String,
        pub prompt_tokens: i32,
        pub completion_tokens: i32,
        pub quota: i64,
        pub channel_id: i64,
        pub elapsed_ms: i64,
        pub is_stream: bool,
        pub request_id: String,
        pub content: Option<String>,
        pub created_at: i64,
    }
}

impl ConsumeLog {
    pub fn insert(mut log: ConsumeLog) -> DbResult<ConsumeLog> {
        if log.id == 0 {
            log.id = ID_GENERATOR.generate_id();
        }
        if log.created_at == 0 {
            log.created_at = Utc::now().timestamp_millis();
        }
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::insert_into(logs::table)
                .values(ConsumeLogDb::to_db(&log))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Failed to insert consume log: {}", e)))
                })?;
        });
        Ok(log)
    }

    pub fn list_by_request_id(request_id_value: &str) -> DbResult<Vec<ConsumeLog>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = logs::table
                .filter(logs::dsl::request_id.eq(request_id_value))
                .select(ConsumeLogDb::as_select())
                .load::<ConsumeLogDb>(conn)?;
            Ok(rows.into_iter().map(|r| r.from_db()).collect())
        })
    }

    pub fn list_by_user(
        user_id_value: i64,
        page: i64,
        page_size: i64,
    ) -> DbResult<ListResult<ConsumeLog>> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let total = logs::table
                .filter(logs::dsl::user_id.eq(user_id_value))
                .count()
                .get_result::<i64>(conn)?;
            let rows = logs::table
                .filter(logs::dsl::user_id.eq(user_id_value))
                .order(logs::dsl::created_at.desc())
                .limit(page_size)
                .offset((page - 1) * page_size)
                .select(ConsumeLogDb::as_select())
                .load::<ConsumeLogDb>(conn)?;
            Ok(ListResult {
                total,
                page,
                page_size,
                list: rows.into_iter().map(|r| r.from_db()).collect(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{setup_db, unique_name};

    #[test]
    fn insert_fills_id_and_timestamp() {
        setup_db();
        let request_id = unique_name("req");
        let log = ConsumeLog::insert(ConsumeLog {
            user_id: 42,
            model: "gpt-4".to_string(),
            prompt_tokens: 3,
            completion_tokens: 4,
            quota: 12,
            request_id: request_id.clone(),
            ..Default::default()
        })
        .unwrap();
        assert_ne!(log.id, 0);
        assert!(log.created_at > 0);

        let rows = ConsumeLog::list_by_request_id(&request_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quota, 12);
    }

    #[test]
    fn list_by_user_pages() {
        setup_db();
        let user_id = ID_GENERATOR.generate_id();
        for _ in 0..3 {
            ConsumeLog::insert(ConsumeLog {
                user_id,
                request_id: unique_name("req"),
                ..Default::default()
            })
            .unwrap();
        }
        let page = ConsumeLog::list_by_user(user_id, 1, 2).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.list.len(), 2);
        let page = ConsumeLog::list_by_user(user_id, 2, 2).unwrap();
        assert_eq!(page.list.len(), 1);
    }
}
