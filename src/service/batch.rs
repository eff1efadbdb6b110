use std::sync::Arc;
use std::time::Duration;

use cyder_tools::log::{debug, error};
use dashmap::DashMap;

use crate::database::channel::Channel;
use crate::database::user::User;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct UserUsage {
    used_quota: i64,
    request_count: i64,
}

/// Accumulates usage counters in memory and writes them out periodically.
/// Only `used_quota`/`request_count` style counters pass through here;
/// spendable balances are always written directly by the ledger.
#[derive(Default)]
pub struct BatchUpdater {
    users: DashMap<i64, UserUsage>,
    channels: DashMap<i64, i64>,
}

impl BatchUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user_usage(&self, user_id: i64, quota: i64) {
        let mut entry = self.users.entry(user_id).or_default();
        entry.used_quota += quota;
        entry.request_count += 1;
    }

    pub fn add_channel_usage(&self, channel_id: i64, quota: i64) {
        *self.channels.entry(channel_id).or_default() += quota;
    }

    /// Writes every pending delta. A failed write is put back for the next
    /// round.
    pub fn flush(&self) -> usize {
        let mut written = 0;

        let user_ids: Vec<i64> = self.users.iter().map(|e| *e.key()).collect();
        for user_id in user_ids {
            let Some((_, usage)) = self.users.remove(&user_id) else {
                continue;
            };
            match User::increase_usage(user_id, usage.used_quota, usage.request_count) {
                Ok(()) => written += 1,
                Err(e) => {
                    error!("failed to flush usage of user {}: {}", user_id, e);
                    let mut entry = self.users.entry(user_id).or_default();
                    entry.used_quota += usage.used_quota;
                    entry.request_count += usage.request_count;
                }
            }
        }

        let channel_ids: Vec<i64> = self.channels.iter().map(|e| *e.key()).collect();
        for channel_id in channel_ids {
            let Some((_, quota)) = self.channels.remove(&channel_id) else {
                continue;
            };
            match Channel::increase_used_quota(channel_id, quota) {
                Ok(()) => written += 1,
                Err(e) => {
                    error!("failed to flush usage of channel {}: {}", channel_id, e);
                    *self.channels.entry(channel_id).or_default() += quota;
                }
            }
        }

        if written > 0 {
            debug!("batch updater flushed {} rows", written);
        }
        written
    }

    pub fn spawn_flush_task(self: &Arc<Self>, period: Duration) {
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                updater.flush();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::NewChannelPayload;
    use crate::testing::{create_user, setup_db, unique_name};

    #[test]
    fn flush_applies_accumulated_deltas() {
        setup_db();
        let user = create_user(100);
        let channel = Channel::create(&NewChannelPayload {
            name: unique_name("ch"),
            models: "m".to_string(),
            ..Default::default()
        })
        .unwrap();

        let updater = BatchUpdater::new();
        updater.add_user_usage(user.id, 10);
        updater.add_user_usage(user.id, 5);
        updater.add_channel_usage(channel.id, 15);

        assert_eq!(User::get_by_id(user.id).unwrap().used_quota, 0);
        assert_eq!(updater.flush(), 2);

        let user = User::get_by_id(user.id).unwrap();
        assert_eq!(user.used_quota, 15);
        assert_eq!(user.request_count, 2);
        assert_eq!(user.quota, 100);
        assert_eq!(Channel::get_by_id(channel.id).unwrap().used_quota, 15);
        assert_eq!(updater.flush(), 0);
    }
}
