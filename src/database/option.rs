use std::collections::HashMap;

use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Insertable, Debug)]
    #[diesel(table_name = options)]
    pub struct OptionRow {
        pub key: String,
        pub value: String,
    }
}

impl OptionRow {
    pub fn get_all() -> DbResult<HashMap<String, String>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = options::table
                .select(OptionRowDb::as_select())
                .load::<OptionRowDb>(conn)?;
            Ok(rows
                .into_iter()
                .map(|r| {
                    let r = r.from_db();
                    (r.key, r.value)
                })
                .collect())
        })
    }

    pub fn get(key_value: &str) -> DbResult<Option<String>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let value = options::table
                .find(key_value)
                .select(options::dsl::value)
                .first::<String>(conn)
                .optional()?;
            Ok(value)
        })
    }

    pub fn upsert(key_value: &str, value_value: &str) -> DbResult<()> {
        let row = OptionRow {
            key: key_value.to_string(),
            value: value_value.to_string(),
        };
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::insert_into(options::table)
                .values(OptionRowDb::to_db(&row))
                .on_conflict(options::dsl::key)
                .do_update()
                .set(options::dsl::value.eq(value_value))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Failed to save option {}: {}", key_value, e)))
                })?;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{setup_db, unique_name};

    #[test]
    fn upsert_overwrites() {
        setup_db();
        let key = unique_name("Opt");
        OptionRow::upsert(&key, "1").unwrap();
        OptionRow::upsert(&key, "2").unwrap();
        assert_eq!(OptionRow::get(&key).unwrap().as_deref(), Some("2"));
        assert_eq!(OptionRow::get_all().unwrap().get(&key).map(String::as_str), Some("2"));
    }
}
