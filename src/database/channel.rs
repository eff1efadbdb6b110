use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::ability::Ability;
use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::relay::pricing::{parse_model_configs, PricingEntry};
use crate::schema::enum_def::{ChannelStatus, ChannelType};
use crate::utils::ID_GENERATOR;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Debug)]
    #[diesel(table_name = channels)]
    pub struct Channel {
        pub id: i64,
        pub channel_type: ChannelType,
        pub name: String,
        pub api_key: String,
        pub base_url: Option<String>,
        pub status: ChannelStatus,
        pub priority: i64,
        pub models: String,
        pub groups: String,
        pub model_mapping: Option<String>,
        pub model_configs: Option<String>,
        pub rate_limit: Option<i32>,
        pub system_prompt: Option<String>,
        pub config: Option<String>,
        pub used_quota: i64,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(AsChangeset, Deserialize, Debug, Default)]
    #[diesel(table_name = channels)]
    pub struct UpdateChannelData {
        pub channel_type: Option<ChannelType>,
        pub name: Option<String>,
        pub api_key: Option<String>,
        pub base_url: Option<Option<String>>,
        pub priority: Option<i64>,
        pub models: Option<String>,
        pub groups: Option<String>,
        pub model_mapping: Option<Option<String>>,
        pub model_configs: Option<Option<String>>,
        pub rate_limit: Option<Option<i32>>,
        pub system_prompt: Option<Option<String>>,
        pub config: Option<Option<String>>,
    }
}

/// Provider specific knobs stored in the channel's `config` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    pub region: Option<String>,
    pub api_version: Option<String>,
    pub project_id: Option<String>,
    pub plugin: Option<String>,
    /// Multiplier applied on top of the group ratio; absent means 1.
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewChannelPayload {
    pub channel_type: ChannelType,
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub priority: Option<i64>,
    pub models: String,
    pub groups: Option<String>,
    pub model_mapping: Option<String>,
    pub model_configs: Option<String>,
    pub rate_limit: Option<i32>,
    pub system_prompt: Option<String>,
    pub config: Option<String>,
    pub status: Option<ChannelStatus>,
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Channel {
    pub fn model_names(&self) -> Vec<String> {
        split_csv(&self.models)
    }

    pub fn group_names(&self) -> Vec<String> {
        split_csv(&self.groups)
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn settings(&self) -> ChannelSettings {
        self.config
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn channel_ratio(&self) -> f64 {
        self.settings().ratio.filter(|r| *r >= 0.0).unwrap_or(1.0)
    }

    pub fn model_mapping_table(&self) -> HashMap<String, String> {
        self.model_mapping
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    /// Upstream model name for an incoming one.
    pub fn map_model(&self, model: &str) -> String {
        self.model_mapping_table()
            .get(model)
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn pricing_table(&self) -> HashMap<String, PricingEntry> {
        match self.model_configs.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_model_configs(raw).unwrap_or_default(),
            _ => HashMap::new(),
        }
    }

    pub fn create(payload: &NewChannelPayload) -> DbResult<Channel> {
        if let Some(raw) = payload.model_configs.as_deref() {
            parse_model_configs(raw).map_err(|e| BaseError::ParamInvalid(Some(e.to_string())))?;
        }
        let now = Utc::now().timestamp_millis();
        let channel = Channel {
            id: ID_GENERATOR.generate_id(),
            channel_type: payload.channel_type,
            name: payload.name.clone(),
            api_key: payload.api_key.clone(),
            base_url: payload.base_url.clone().filter(|s| !s.is_empty()),
            status: payload.status.unwrap_or(ChannelStatus::Enabled),
            priority: payload.priority.unwrap_or(0),
            models: payload.models.clone(),
            groups: payload.groups.clone().unwrap_or_else(|| "default".to_string()),
            model_mapping: payload.model_mapping.clone(),
            model_configs: payload.model_configs.clone(),
            rate_limit: payload.rate_limit,
            system_prompt: payload.system_prompt.clone(),
            config: payload.config.clone(),
            used_quota: 0,
            created_at: now,
            updated_at: now,
        };
        let rows = Ability::rows_for(&channel);

        let conn = &mut get_connection()?;
        db_execute!(conn, {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::insert_into(channels::table)
                    .values(ChannelDb::to_db(&channel))
                    .execute(conn)?;
                crate::replace_channel_abilities!(conn, channel.id, rows);
                Ok(())
            })
            .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to create channel: {}", e))))?;
        });
        Ok(channel)
    }

    pub fn update(id_value: i64, data: &UpdateChannelData) -> DbResult<Channel> {
        if let Some(Some(raw)) = data.model_configs.as_ref() {
            parse_model_configs(raw).map_err(|e| BaseError::ParamInvalid(Some(e.to_string())))?;
        }
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            conn.transaction::<Channel, diesel::result::Error, _>(|conn| {
                let updated = diesel::update(channels::table.find(id_value))
                    .set((
                        UpdateChannelDataDb::to_db(data),
                        channels::dsl::updated_at.eq(now),
                    ))
                    .returning(ChannelDb::as_returning())
                    .get_result::<ChannelDb>(conn)?
                    .from_db();
                let rows = Ability::rows_for(&updated);
                crate::replace_channel_abilities!(conn, updated.id, rows);
                Ok(updated)
            })
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    BaseError::NotFound(Some(format!("Channel {} not found", id_value)))
                }
                _ => BaseError::DatabaseFatal(Some(format!(
                    "Failed to update channel {}: {}",
                    id_value, e
                ))),
            })
        })
    }

    pub fn update_status(id_value: i64, status_value: ChannelStatus) -> DbResult<Channel> {
        let now = Utc::now().timestamp_millis();
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            conn.transaction::<Channel, diesel::result::Error, _>(|conn| {
                let updated = diesel::update(channels::table.find(id_value))
                    .set((
                        channels::dsl::status.eq(status_value),
                        channels::dsl::updated_at.eq(now),
                    ))
                    .returning(ChannelDb::as_returning())
                    .get_result::<ChannelDb>(conn)?
                    .from_db();
                let rows = Ability::rows_for(&updated);
                crate::replace_channel_abilities!(conn, updated.id, rows);
                Ok(updated)
            })
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    BaseError::NotFound(Some(format!("Channel {} not found", id_value)))
                }
                _ => BaseError::DatabaseFatal(Some(format!(
                    "Failed to update status of channel {}: {}",
                    id_value, e
                ))),
            })
        })
    }

    pub fn delete(id_value: i64) -> DbResult<usize> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                diesel::delete(abilities::table.filter(abilities::dsl::channel_id.eq(id_value)))
                    .execute(conn)?;
                diesel::delete(channels::table.find(id_value)).execute(conn)
            })
            .map_err(|e| {
                BaseError::DatabaseFatal(Some(format!("Failed to delete channel {}: {}", id_value, e)))
            })
        })
    }

    pub fn get_by_id(id_value: i64) -> DbResult<Channel> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let channel = channels::table
                .find(id_value)
                .select(ChannelDb::as_select())
                .first::<ChannelDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::NotFound(Some(format!("Channel {} not found", id_value)))
                    }
                    _ => BaseError::DatabaseFatal(Some(format!(
                        "Error fetching channel {}: {}",
                        id_value, e
                    ))),
                })?;
            Ok(channel.from_db())
        })
    }

    pub fn list_by_ids(ids: &[i64]) -> DbResult<Vec<Channel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = channels::table
                .filter(channels::dsl::id.eq_any(ids))
                .select(ChannelDb::as_select())
                .load::<ChannelDb>(conn)?;
            Ok(rows.into_iter().map(|c| c.from_db()).collect())
        })
    }

    pub fn list_all() -> DbResult<Vec<Channel>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = channels::table
                .order(channels::dsl::priority.desc())
                .select(ChannelDb::as_select())
                .load::<ChannelDb>(conn)?;
            Ok(rows.into_iter().map(|c| c.from_db()).collect())
        })
    }

    pub fn list_enabled() -> DbResult<Vec<Channel>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = channels::table
                .filter(channels::dsl::status.eq(ChannelStatus::Enabled))
                .select(ChannelDb::as_select())
                .load::<ChannelDb>(conn)?;
            Ok(rows.into_iter().map(|c| c.from_db()).collect())
        })
    }

    pub fn increase_used_quota(id_value: i64, quota_value: i64) -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(channels::table.find(id_value))
                .set(channels::dsl::used_quota.eq(channels::dsl::used_quota + quota_value))
                .execute(conn)?;
            Ok(())
        })
    }

    /// Rewrites the pricing column without touching abilities.
    pub fn set_model_configs(id_value: i64, configs: Option<String>) -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(channels::table.find(id_value))
                .set(channels::dsl::model_configs.eq(configs))
                .execute(conn)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{setup_db, unique_name};

    fn payload(models: &str, groups: &str) -> NewChannelPayload {
        NewChannelPayload {
            channel_type: ChannelType::Openai,
            name: unique_name("channel"),
            api_key: "sk-test".to_string(),
            models: models.to_string(),
            groups: Some(groups.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn csv_fields_are_trimmed() {
        let channel = Channel {
            models: " gpt-4 , ,gpt-3.5-turbo".to_string(),
            groups: "default,vip ".to_string(),
            ..Default::default()
        };
        assert_eq!(channel.model_names(), vec!["gpt-4", "gpt-3.5-turbo"]);
        assert_eq!(channel.group_names(), vec!["default", "vip"]);
    }

    #[test]
    fn model_mapping_and_settings_parse_json_columns() {
        let channel = Channel {
            model_mapping: Some(r#"{"gpt-4":"gpt-4-0613","empty":""}"#.to_string()),
            config: Some(r#"{"region":"us-east-1","ratio":0.5}"#.to_string()),
            ..Default::default()
        };
        assert_eq!(channel.map_model("gpt-4"), "gpt-4-0613");
        assert_eq!(channel.map_model("empty"), "empty");
        assert_eq!(channel.map_model("other"), "other");
        assert_eq!(channel.settings().region.as_deref(), Some("us-east-1"));
        assert_eq!(channel.channel_ratio(), 0.5);

        let broken = Channel {
            config: Some("not json".to_string()),
            ..Default::default()
        };
        assert_eq!(broken.channel_ratio(), 1.0);
    }

    #[test]
    fn status_change_rebuilds_abilities_disabled() {
        setup_db();
        let group = unique_name("g");
        let channel = Channel::create(&payload("m1,m2", &group)).unwrap();
        assert!(Ability::list_by_channel(channel.id).unwrap().iter().all(|a| a.enabled));

        let disabled = Channel::update_status(channel.id, ChannelStatus::AutoDisabled).unwrap();
        assert_eq!(disabled.status, ChannelStatus::AutoDisabled);
        let rows = Ability::list_by_channel(channel.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|a| !a.enabled));
    }

    #[test]
    fn update_regenerates_projection() {
        setup_db();
        let group = unique_name("g");
        let channel = Channel::create(&payload("m1", &group)).unwrap();
        let updated = Channel::update(
            channel.id,
            &UpdateChannelData {
                models: Some("m1,m2,m3".to_string()),
                priority: Some(7),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.priority, 7);
        let rows = Ability::list_by_channel(channel.id).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|a| a.priority == 7));
    }

    #[test]
    fn delete_removes_abilities() {
        setup_db();
        let channel = Channel::create(&payload("m1", &unique_name("g"))).unwrap();
        assert_eq!(Channel::delete(channel.id).unwrap(), 1);
        assert!(Ability::list_by_channel(channel.id).unwrap().is_empty());
        assert!(matches!(Channel::get_by_id(channel.id), Err(BaseError::NotFound(_))));
    }

    #[test]
    fn create_rejects_unknown_pricing_shape() {
        setup_db();
        let mut p = payload("m1", "default");
        p.model_configs = Some(r#"{"m1": "cheap"}"#.to_string());
        assert!(matches!(Channel::create(&p), Err(BaseError::ParamInvalid(_))));
    }

    #[test]
    fn used_quota_is_field_relative() {
        setup_db();
        let channel = Channel::create(&payload("m1", &unique_name("g"))).unwrap();
        Channel::increase_used_quota(channel.id, 10).unwrap();
        Channel::increase_used_quota(channel.id, 5).unwrap();
        assert_eq!(Channel::get_by_id(channel.id).unwrap().used_quota, 15);
    }
}
