use std::collections::VecDeque;
use std::sync::Arc;

use cyder_tools::log::{error, warn};
use dashmap::DashMap;

use crate::database::channel::Channel;
use crate::schema::enum_def::ChannelStatus;
use crate::service::channel_cache::ChannelCache;
use crate::service::metrics::MetricsRecorder;
use crate::service::options::RuntimeOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// Upstream rejected the channel's credentials.
    Unauthorized,
}

/// Per-channel sliding window of attempt outcomes. A channel whose success
/// rate falls below the threshold over a full window is disabled for good,
/// as is one whose key is rejected, when automatic disabling is on.
pub struct ChannelHealth {
    windows: DashMap<i64, VecDeque<bool>>,
    cache: Arc<ChannelCache>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl ChannelHealth {
    pub fn new(cache: Arc<ChannelCache>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            windows: DashMap::new(),
            cache,
            metrics,
        }
    }

    /// Records one outcome and returns the success rate when the window is
    /// full.
    fn push(&self, channel_id: i64, success: bool, window: usize) -> Option<f64> {
        let mut slot = self.windows.entry(channel_id).or_default();
        slot.push_back(success);
        while slot.len() > window {
            slot.pop_front();
        }
        if slot.len() < window {
            return None;
        }
        let ok = slot.iter().filter(|s| **s).count();
        Some(ok as f64 / slot.len() as f64)
    }

    /// Returns true when the channel got disabled by this report.
    pub async fn report(
        &self,
        channel_id: i64,
        outcome: AttemptOutcome,
        options: &RuntimeOptions,
    ) -> bool {
        let rate = self.push(
            channel_id,
            outcome == AttemptOutcome::Success,
            options.channel_health_window,
        );
        if let Some(rate) = rate {
            self.metrics.update_channel_metrics(channel_id, rate, true);
        }
        if !options.automatic_disable_channel_enabled {
            return false;
        }

        let reason = match (outcome, rate) {
            (AttemptOutcome::Unauthorized, _) => "upstream rejected the channel key".to_string(),
            (_, Some(rate)) if rate < options.channel_success_rate_threshold => format!(
                "success rate {:.2} below threshold {:.2}",
                rate, options.channel_success_rate_threshold
            ),
            _ => return false,
        };

        warn!("automatically disabling channel {}: {}", channel_id, reason);
        if let Err(e) = Channel::update_status(channel_id, ChannelStatus::AutoDisabled) {
            error!("failed to disable channel {}: {}", channel_id, e);
            return false;
        }
        self.windows.remove(&channel_id);
        self.metrics.update_channel_metrics(channel_id, rate.unwrap_or(0.0), false);
        if let Err(e) = self.cache.refresh().await {
            error!("failed to refresh channel cache after disabling {}: {}", channel_id, e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ability::Ability;
    use crate::database::channel::NewChannelPayload;
    use crate::schema::enum_def::ChannelType;
    use crate::service::metrics::NoopRecorder;
    use crate::testing::{setup_db, unique_name};

    fn health() -> ChannelHealth {
        ChannelHealth::new(Arc::new(ChannelCache::new()), Arc::new(NoopRecorder))
    }

    fn create_channel() -> Channel {
        Channel::create(&NewChannelPayload {
            channel_type: ChannelType::Openai,
            name: unique_name("ch"),
            api_key: "k".to_string(),
            models: unique_name("m"),
            groups: Some(unique_name("g")),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn window_reports_rate_only_when_full() {
        let health = health();
        assert_eq!(health.push(1, true, 3), None);
        assert_eq!(health.push(1, false, 3), None);
        assert_eq!(health.push(1, false, 3), Some(1.0 / 3.0));
        assert_eq!(health.push(1, true, 3), Some(1.0 / 3.0));
    }

    #[tokio::test]
    async fn disabled_switch_keeps_channel() {
        setup_db();
        let channel = create_channel();
        let health = health();
        let options = RuntimeOptions::default();
        assert!(!health.report(channel.id, AttemptOutcome::Unauthorized, &options).await);
        assert_eq!(Channel::get_by_id(channel.id).unwrap().status, ChannelStatus::Enabled);
    }

    #[tokio::test]
    async fn low_success_rate_disables_channel() {
        setup_db();
        let channel = create_channel();
        let health = health();
        let options = RuntimeOptions {
            automatic_disable_channel_enabled: true,
            channel_health_window: 4,
            channel_success_rate_threshold: 0.5,
            ..Default::default()
        };

        assert!(!health.report(channel.id, AttemptOutcome::Success, &options).await);
        assert!(!health.report(channel.id, AttemptOutcome::Failure, &options).await);
        assert!(!health.report(channel.id, AttemptOutcome::Failure, &options).await);
        assert!(health.report(channel.id, AttemptOutcome::Failure, &options).await);

        assert_eq!(
            Channel::get_by_id(channel.id).unwrap().status,
            ChannelStatus::AutoDisabled
        );
        assert!(Ability::list_by_channel(channel.id).unwrap().iter().all(|a| !a.enabled));
    }

    #[tokio::test]
    async fn unauthorized_disables_immediately() {
        setup_db();
        let channel = create_channel();
        let options = RuntimeOptions {
            automatic_disable_channel_enabled: true,
            ..Default::default()
        };
        assert!(health().report(channel.id, AttemptOutcome::Unauthorized, &options).await);
        assert_eq!(
            Channel::get_by_id(channel.id).unwrap().status,
            ChannelStatus::AutoDisabled
        );
    }
}
