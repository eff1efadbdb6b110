use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cyder_tools::log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::controller::BaseError;
use crate::database::option::OptionRow;
use crate::database::DbResult;

pub const RETRY_TIMES: &str = "RetryTimes";
pub const RETRY_MULTIPLIER_ON_429: &str = "RetryMultiplierOn429";
pub const PRE_CONSUMED_QUOTA: &str = "PreConsumedQuota";
pub const QUOTA_REMIND_THRESHOLD: &str = "QuotaRemindThreshold";
pub const GROUP_RATIO: &str = "GroupRatio";
pub const AUTOMATIC_DISABLE_CHANNEL_ENABLED: &str = "AutomaticDisableChannelEnabled";
pub const CHANNEL_SUCCESS_RATE_THRESHOLD: &str = "ChannelSuccessRateThreshold";
pub const CHANNEL_HEALTH_WINDOW: &str = "ChannelHealthWindow";
pub const QUOTA_PER_UNIT: &str = "QuotaPerUnit";
pub const MODEL_CONFIGS_MIGRATED: &str = "ModelConfigsMigrated";

/// System-wide knobs editable at runtime.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuntimeOptions {
    pub retry_times: u32,
    /// Factor applied to `retry_times` once a request meets an upstream 429.
    pub retry_multiplier_on_429: u32,
    pub pre_consumed_quota: i64,
    pub quota_remind_threshold: i64,
    pub group_ratio: HashMap<String, f64>,
    pub automatic_disable_channel_enabled: bool,
    pub channel_success_rate_threshold: f64,
    pub channel_health_window: usize,
    pub quota_per_unit: f64,
    pub model_configs_migrated: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            retry_times: 2,
            retry_multiplier_on_429: 2,
            pre_consumed_quota: 500,
            quota_remind_threshold: 1000,
            group_ratio: HashMap::from([
                ("default".to_string(), 1.0),
                ("vip".to_string(), 1.0),
                ("svip".to_string(), 1.0),
            ]),
            automatic_disable_channel_enabled: false,
            channel_success_rate_threshold: 0.2,
            channel_health_window: 20,
            quota_per_unit: 500_000.0,
            model_configs_migrated: false,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BaseError> {
    value
        .trim()
        .parse()
        .map_err(|_| BaseError::ParamInvalid(Some(format!("invalid value for {}: {}", key, value))))
}

impl RuntimeOptions {
    /// Ratio of a user group; unknown groups bill at 1.
    pub fn group_ratio_of(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), BaseError> {
        match key {
            RETRY_TIMES => self.retry_times = parse(key, value)?,
            RETRY_MULTIPLIER_ON_429 => self.retry_multiplier_on_429 = parse::<u32>(key, value)?.max(1),
            PRE_CONSUMED_QUOTA => self.pre_consumed_quota = parse::<i64>(key, value)?.max(0),
            QUOTA_REMIND_THRESHOLD => self.quota_remind_threshold = parse(key, value)?,
            GROUP_RATIO => {
                self.group_ratio = serde_json::from_str(value).map_err(|e| {
                    BaseError::ParamInvalid(Some(format!("invalid value for {}: {}", key, e)))
                })?
            }
            AUTOMATIC_DISABLE_CHANNEL_ENABLED => {
                self.automatic_disable_channel_enabled = parse(key, value)?
            }
            CHANNEL_SUCCESS_RATE_THRESHOLD => {
                let threshold: f64 = parse(key, value)?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(BaseError::ParamInvalid(Some(format!(
                        "{} must be within [0, 1]",
                        key
                    ))));
                }
                self.channel_success_rate_threshold = threshold;
            }
            CHANNEL_HEALTH_WINDOW => self.channel_health_window = parse::<usize>(key, value)?.max(1),
            QUOTA_PER_UNIT => self.quota_per_unit = parse(key, value)?,
            MODEL_CONFIGS_MIGRATED => self.model_configs_migrated = parse(key, value)?,
            _ => {
                return Err(BaseError::ParamInvalid(Some(format!("unknown option {}", key))));
            }
        }
        Ok(())
    }

    /// Builds options from stored rows; bad rows are skipped with a warning.
    pub fn from_rows(rows: &HashMap<String, String>) -> Self {
        let mut options = Self::default();
        for (key, value) in rows {
            if let Err(e) = options.apply(key, value) {
                warn!("ignoring stored option {}: {}", key, e);
            }
        }
        options
    }

    pub fn to_rows(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (RETRY_TIMES, self.retry_times.to_string()),
            (RETRY_MULTIPLIER_ON_429, self.retry_multiplier_on_429.to_string()),
            (PRE_CONSUMED_QUOTA, self.pre_consumed_quota.to_string()),
            (QUOTA_REMIND_THRESHOLD, self.quota_remind_threshold.to_string()),
            (
                GROUP_RATIO,
                serde_json::to_string(&self.group_ratio).unwrap_or_else(|_| "{}".to_string()),
            ),
            (
                AUTOMATIC_DISABLE_CHANNEL_ENABLED,
                self.automatic_disable_channel_enabled.to_string(),
            ),
            (
                CHANNEL_SUCCESS_RATE_THRESHOLD,
                self.channel_success_rate_threshold.to_string(),
            ),
            (CHANNEL_HEALTH_WINDOW, self.channel_health_window.to_string()),
            (QUOTA_PER_UNIT, self.quota_per_unit.to_string()),
            (MODEL_CONFIGS_MIGRATED, self.model_configs_migrated.to_string()),
        ])
    }
}

/// Owner of the runtime options. Readers take the current `Arc` or
/// subscribe to changes; `update` persists first, then broadcasts.
pub struct OptionsCoordinator {
    tx: watch::Sender<Arc<RuntimeOptions>>,
}

impl OptionsCoordinator {
    pub fn new(options: RuntimeOptions) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(options));
        Self { tx }
    }

    pub fn load() -> DbResult<Self> {
        let rows = OptionRow::get_all()?;
        info!("loaded {} runtime options from storage", rows.len());
        Ok(Self::new(RuntimeOptions::from_rows(&rows)))
    }

    pub fn current(&self) -> Arc<RuntimeOptions> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RuntimeOptions>> {
        self.tx.subscribe()
    }

    pub fn update(&self, key: &str, value: &str) -> DbResult<Arc<RuntimeOptions>> {
        let mut next = (*self.current()).clone();
        next.apply(key, value)?;
        OptionRow::upsert(key, value)?;
        let next = Arc::new(next);
        self.tx.send_replace(next.clone());
        info!("option {} updated", key);
        Ok(next)
    }

    /// Replaces options without persisting.
    pub fn replace(&self, options: RuntimeOptions) {
        self.tx.send_replace(Arc::new(options));
    }
}
