use std::collections::HashSet;

use chrono::Utc;
use diesel::dsl::max;
use serde::Serialize;

use super::channel::Channel;
use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::schema::enum_def::ChannelStatus;
use crate::service::selector::{pick_by_tier, SelectError, SelectMode};
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Debug)]
    #[diesel(table_name = abilities)]
    pub struct Ability {
        pub group_name: String,
        pub model: String,
        pub channel_id: i64,
        pub enabled: bool,
        pub priority: i64,
        pub suspend_until: Option<i64>,
    }
}

/// Replaces every ability row of one channel. Must run inside a transaction
/// opened by the caller, within a `db_execute!` block.
#[macro_export]
macro_rules! replace_channel_abilities {
    ($conn:ident, $channel_id:expr, $rows:expr) => {{
        diesel::delete(abilities::table.filter(abilities::channel_id.eq($channel_id)))
            .execute($conn)?;
        let values: Vec<_> = $rows
            .iter()
            .map(|row| {
                (
                    abilities::group_name.eq(row.group_name.as_str()),
                    abilities::model.eq(row.model.as_str()),
                    abilities::channel_id.eq(row.channel_id),
                    abilities::enabled.eq(row.enabled),
                    abilities::priority.eq(row.priority),
                )
            })
            .collect();
        if !values.is_empty() {
            diesel::insert_into(abilities::table)
                .values(&values)
                .execute($conn)?;
        }
        values.len()
    }};
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct GroupModel {
    pub model: String,
    pub channel_type: crate::schema::enum_def::ChannelType,
}

impl Ability {
    /// The cartesian product groups × models of a channel, carrying the
    /// channel's current status and priority.
    pub fn rows_for(channel: &Channel) -> Vec<Ability> {
        let enabled = channel.status == ChannelStatus::Enabled;
        let models = channel.model_names();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for group in channel.group_names() {
            for model in &models {
                if !seen.insert((group.clone(), model.clone())) {
                    continue;
                }
                rows.push(Ability {
                    group_name: group.clone(),
                    model: model.clone(),
                    channel_id: channel.id,
                    enabled,
                    priority: channel.priority,
                    suspend_until: None,
                });
            }
        }
        rows
    }

    /// Deletes every row of the channel and inserts its current projection in
    /// one transaction.
    pub fn rebuild(channel: &Channel) -> DbResult<usize> {
        let rows = Self::rows_for(channel);
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                Ok(crate::replace_channel_abilities!(conn, channel.id, rows))
            })
            .map_err(|e| {
                BaseError::DatabaseFatal(Some(format!(
                    "Failed to rebuild abilities for channel {}: {}",
                    channel.id, e
                )))
            })
        })
    }

    pub fn list_by_channel(channel_id_value: i64) -> DbResult<Vec<Ability>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = abilities::table
                .filter(abilities::dsl::channel_id.eq(channel_id_value))
                .select(AbilityDb::as_select())
                .load::<AbilityDb>(conn)?;
            Ok(rows.into_iter().map(|r| r.from_db()).collect())
        })
    }

    pub fn list_all() -> DbResult<Vec<Ability>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = abilities::table
                .select(AbilityDb::as_select())
                .load::<AbilityDb>(conn)?;
            Ok(rows.into_iter().map(|r| r.from_db()).collect())
        })
    }

    /// Active rows of one (group, model), highest priority first.
    pub fn list_active(group: &str, model_name: &str) -> DbResult<Vec<Ability>> {
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = abilities::table
                .filter(abilities::dsl::group_name.eq(group))
                .filter(abilities::dsl::model.eq(model_name))
                .filter(abilities::dsl::enabled.eq(true))
                .filter(
                    abilities::dsl::suspend_until
                        .is_null()
                        .or(abilities::dsl::suspend_until.lt(now)),
                )
                .order(abilities::dsl::priority.desc())
                .select(AbilityDb::as_select())
                .load::<AbilityDb>(conn)?;
            Ok(rows.into_iter().map(|r| r.from_db()).collect())
        })
    }

    /// MAX(priority) over enabled rows of (group, model), suspended or not.
    pub fn max_priority(group: &str, model_name: &str) -> DbResult<Option<i64>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let top = abilities::table
                .filter(abilities::dsl::group_name.eq(group))
                .filter(abilities::dsl::model.eq(model_name))
                .filter(abilities::dsl::enabled.eq(true))
                .select(max(abilities::dsl::priority))
                .first::<Option<i64>>(conn)?;
            Ok(top)
        })
    }

    /// Distinct (model, channel type) pairs a group can currently reach.
    pub fn list_group_models(group: &str) -> DbResult<Vec<GroupModel>> {
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        let pairs: Vec<(String, i64)> = db_execute!(conn, {
            abilities::table
                .filter(abilities::dsl::group_name.eq(group))
                .filter(abilities::dsl::enabled.eq(true))
                .filter(
                    abilities::dsl::suspend_until
                        .is_null()
                        .or(abilities::dsl::suspend_until.lt(now)),
                )
                .select((abilities::dsl::model, abilities::dsl::channel_id))
                .distinct()
                .load::<(String, i64)>(conn)?
        });

        let channel_ids: HashSet<i64> = pairs.iter().map(|(_, id)| *id).collect();
        let channels = Channel::list_by_ids(&channel_ids.into_iter().collect::<Vec<_>>())?;
        let mut result: Vec<GroupModel> = pairs
            .into_iter()
            .filter_map(|(model, id)| {
                channels.iter().find(|c| c.id == id).map(|c| GroupModel {
                    model,
                    channel_type: c.channel_type,
                })
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        result.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(result)
    }

    /// Masks exactly one (group, model, channel) row until `now + duration`.
    pub fn suspend(
        group: &str,
        model_name: &str,
        channel_id_value: i64,
        duration: std::time::Duration,
    ) -> DbResult<i64> {
        let until = Utc::now().timestamp_millis() + duration.as_millis() as i64;
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(
                abilities::table
                    .filter(abilities::dsl::group_name.eq(group))
                    .filter(abilities::dsl::model.eq(model_name))
                    .filter(abilities::dsl::channel_id.eq(channel_id_value)),
            )
            .set(abilities::dsl::suspend_until.eq(Some(until)))
            .execute(conn)
            .map_err(|e| {
                BaseError::DatabaseFatal(Some(format!(
                    "Failed to suspend ability {}/{}/{}: {}",
                    group, model_name, channel_id_value, e
                )))
            })?;
            Ok(until)
        })
    }

    /// Storage-backed selection: same tier rules as the cache path, with the
    /// pivot taken from `MAX(priority)`.
    pub fn pick_random(
        group: &str,
        model_name: &str,
        mode: SelectMode,
        exclude: &HashSet<i64>,
    ) -> Result<i64, SelectError> {
        let rows = Self::list_active(group, model_name)?;
        let pivot = Self::max_priority(group, model_name)?;
        let candidates: Vec<(i64, i64)> = rows
            .into_iter()
            .filter(|row| !exclude.contains(&row.channel_id))
            .map(|row| (row.channel_id, row.priority))
            .collect();
        let pivot = pivot.or_else(|| candidates.iter().map(|(_, p)| *p).max());
        pick_by_tier(&candidates, pivot, mode).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::NewChannelPayload;
    use crate::schema::enum_def::ChannelType;
    use crate::testing::{setup_db, unique_name};
    use std::time::Duration;

    fn create_channel(groups: &str, models: &str, priority: i64) -> Channel {
        Channel::create(&NewChannelPayload {
            channel_type: ChannelType::Openai,
            name: unique_name("ch"),
            api_key: "sk-upstream".to_string(),
            priority: Some(priority),
            models: models.to_string(),
            groups: Some(groups.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn rebuild_produces_cartesian_product_and_drops_old_rows() {
        setup_db();
        let g1 = unique_name("g");
        let g2 = unique_name("g");
        let channel = create_channel(&format!("{},{}", g1, g2), "m-a,m-b,m-c", 5);

        let rows = Ability::list_by_channel(channel.id).unwrap();
        assert_eq!(rows.len(), 6);

        let mut updated = channel.clone();
        updated.groups = g1.clone();
        updated.models = "m-z".to_string();
        assert_eq!(Ability::rebuild(&updated).unwrap(), 1);

        let rows = Ability::list_by_channel(channel.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_name, g1);
        assert_eq!(rows[0].model, "m-z");
    }

    #[test]
    fn suspended_rows_are_hidden_until_expiry() {
        setup_db();
        let group = unique_name("g");
        let model = unique_name("m");
        let a = create_channel(&group, &model, 10);
        let b = create_channel(&group, &model, 10);

        Ability::suspend(&group, &model, a.id, Duration::from_secs(60)).unwrap();

        let active = Ability::list_active(&group, &model).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].channel_id, b.id);

        for _ in 0..20 {
            let picked =
                Ability::pick_random(&group, &model, SelectMode::HighestPriority, &HashSet::new())
                    .unwrap();
            assert_eq!(picked, b.id);
        }

        // Suspension is per model: the same channel still serves other models.
        let other_model = unique_name("m");
        let c = create_channel(&group, &format!("{},{}", model, other_model), 1);
        Ability::suspend(&group, &model, c.id, Duration::from_secs(60)).unwrap();
        let other = Ability::list_active(&group, &other_model).unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].channel_id, c.id);
    }

    #[test]
    fn expired_suspension_is_selectable_again() {
        setup_db();
        let group = unique_name("g");
        let model = unique_name("m");
        let a = create_channel(&group, &model, 10);
        Ability::suspend(&group, &model, a.id, Duration::from_millis(0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let active = Ability::list_active(&group, &model).unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn lower_priority_pivot_uses_max_priority_of_storage() {
        setup_db();
        let group = unique_name("g");
        let model = unique_name("m");
        let top = create_channel(&group, &model, 100);
        let low = create_channel(&group, &model, 50);

        Ability::suspend(&group, &model, top.id, Duration::from_secs(60)).unwrap();
        let picked =
            Ability::pick_random(&group, &model, SelectMode::LowerPriority, &HashSet::new()).unwrap();
        assert_eq!(picked, low.id);

        let mut exclude = HashSet::new();
        exclude.insert(low.id);
        let err = Ability::pick_random(&group, &model, SelectMode::LowerPriority, &exclude)
            .unwrap_err();
        assert!(matches!(err, SelectError::NoneAvailable));
    }

    #[test]
    fn group_models_lists_distinct_reachable_models() {
        setup_db();
        let group = unique_name("g");
        let m1 = unique_name("m");
        let m2 = unique_name("m");
        let a = create_channel(&group, &format!("{},{}", m1, m2), 1);
        create_channel(&group, &m1, 1);
        Ability::suspend(&group, &m2, a.id, Duration::from_secs(60)).unwrap();

        let models = Ability::list_group_models(&group).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].model, m1);
        assert_eq!(models[0].channel_type, ChannelType::Openai);
    }
}
