use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cyder_tools::log::{debug, error, info};
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::database::ability::Ability;
use crate::database::channel::Channel;
use crate::database::DbResult;

/// A channel listed for one (group, model) pair, with the stored suspension
/// of that ability. Suspensions are evaluated when candidates are read.
#[derive(Debug, Clone)]
pub struct ListedChannel {
    pub channel: Arc<Channel>,
    pub suspend_until: Option<i64>,
}

impl ListedChannel {
    fn is_suspended(&self, now: i64) -> bool {
        self.suspend_until.is_some_and(|until| until >= now)
    }
}

/// Immutable view of routable channels: group → model → channels, each list
/// sorted by priority, highest first.
#[derive(Debug, Default)]
pub struct ChannelSnapshot {
    by_group: HashMap<String, HashMap<String, Vec<ListedChannel>>>,
    channels: HashMap<i64, Arc<Channel>>,
    pub built_at: i64,
}

impl ChannelSnapshot {
    pub fn build(channels: Vec<Channel>, abilities: Vec<Ability>, now: i64) -> Self {
        let channels: HashMap<i64, Arc<Channel>> = channels
            .into_iter()
            .filter(|c| c.is_enabled())
            .map(|c| (c.id, Arc::new(c)))
            .collect();

        let mut by_group: HashMap<String, HashMap<String, Vec<ListedChannel>>> = HashMap::new();
        for ability in abilities.into_iter().filter(|a| a.enabled) {
            let Some(channel) = channels.get(&ability.channel_id) else {
                continue;
            };
            by_group
                .entry(ability.group_name)
                .or_default()
                .entry(ability.model)
                .or_default()
                .push(ListedChannel {
                    channel: channel.clone(),
                    suspend_until: ability.suspend_until,
                });
        }
        for models in by_group.values_mut() {
            for list in models.values_mut() {
                list.sort_by(|a, b| b.channel.priority.cmp(&a.channel.priority));
            }
        }

        Self {
            by_group,
            channels,
            built_at: now,
        }
    }

    pub fn channels_for(&self, group: &str, model: &str) -> &[ListedChannel] {
        self.by_group
            .get(group)
            .and_then(|models| models.get(model))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

type SuspensionKey = (String, String, i64);

/// Process-local channel cache (C2). Readers clone the snapshot `Arc` under a
/// read lock; a refresh swaps it under the write lock.
///
/// Suspensions recorded by this process are overlaid on the snapshot until
/// the next refresh picks them up from storage.
pub struct ChannelCache {
    snapshot: RwLock<Arc<ChannelSnapshot>>,
    suspensions: DashMap<SuspensionKey, i64>,
}

impl Default for ChannelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(ChannelSnapshot::default())),
            suspensions: DashMap::new(),
        }
    }

    pub async fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Rebuilds the snapshot from storage and swaps it in.
    pub async fn refresh(&self) -> DbResult<usize> {
        let now = Utc::now().timestamp_millis();
        let channels = Channel::list_enabled()?;
        let abilities = Ability::list_all()?;
        let snapshot = Arc::new(ChannelSnapshot::build(channels, abilities, now));
        let count = snapshot.len();

        *self.snapshot.write().await = snapshot;
        self.suspensions.retain(|_, until| *until >= now);
        debug!("channel cache rebuilt with {} channels", count);
        Ok(count)
    }

    /// Masks (group, model, channel) locally until `until_ms`, ahead of the
    /// next refresh reading the stored suspension.
    pub fn suspend_local(&self, group: &str, model: &str, channel_id: i64, until_ms: i64) {
        self.suspensions
            .insert((group.to_string(), model.to_string(), channel_id), until_ms);
    }

    fn is_suspended(&self, group: &str, model: &str, channel_id: i64, now: i64) -> bool {
        self.suspensions
            .get(&(group.to_string(), model.to_string(), channel_id))
            .is_some_and(|until| *until >= now)
    }

    /// Selectable channels for (group, model) minus `exclude`, highest
    /// priority first, plus the tier pivot: the top priority of every channel
    /// listed for the pair, excluded or suspended ones included.
    pub async fn candidates(
        &self,
        group: &str,
        model: &str,
        exclude: &HashSet<i64>,
    ) -> (Vec<Arc<Channel>>, Option<i64>) {
        let snapshot = self.snapshot().await;
        let listed = snapshot.channels_for(group, model);
        let pivot = listed.first().map(|l| l.channel.priority);
        let now = Utc::now().timestamp_millis();
        let candidates = listed
            .iter()
            .filter(|l| !l.is_suspended(now))
            .filter(|l| !exclude.contains(&l.channel.id))
            .filter(|l| !self.is_suspended(group, model, l.channel.id, now))
            .map(|l| l.channel.clone())
            .collect();
        (candidates, pivot)
    }

    pub async fn get_channel(&self, channel_id: i64) -> Option<Arc<Channel>> {
        self.snapshot().await.channels.get(&channel_id).cloned()
    }

    /// Periodic refresh loop; runs until the task is dropped.
    pub fn spawn_sync_task(self: &Arc<Self>, period: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match cache.refresh().await {
                    Ok(count) => info!("channels synced from storage: {} enabled", count),
                    Err(e) => error!("failed to sync channels: {}", e),
                }
            }
        });
    }
}
