use std::collections::HashSet;
use std::sync::Arc;

use cyder_tools::log::debug;
use rand::{rng, Rng};
use thiserror::Error;

use crate::controller::BaseError;
use crate::database::ability::Ability;
use crate::database::channel::Channel;
use crate::service::channel_cache::ChannelCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    HighestPriority,
    LowerPriority,
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no available channel")]
    NoneAvailable,
    #[error("no channel below the current priority tier")]
    NoLowerTier,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<BaseError> for SelectError {
    fn from(err: BaseError) -> Self {
        SelectError::Storage(err.to_string())
    }
}

/// Picks one item out of `(item, priority)` candidates.
///
/// `HighestPriority` draws uniformly from the top tier of the candidates.
/// `LowerPriority` draws uniformly from candidates strictly below `pivot`
/// (the top tier of the candidates when no pivot is given).
pub fn pick_by_tier<T>(
    candidates: &[(T, i64)],
    pivot: Option<i64>,
    mode: SelectMode,
) -> Result<&T, SelectError> {
    let Some(top) = candidates.iter().map(|(_, p)| *p).max() else {
        return Err(SelectError::NoneAvailable);
    };
    let tier: Vec<&T> = match mode {
        SelectMode::HighestPriority => candidates
            .iter()
            .filter(|(_, p)| *p == top)
            .map(|(item, _)| item)
            .collect(),
        SelectMode::LowerPriority => {
            let pivot = pivot.unwrap_or(top);
            candidates
                .iter()
                .filter(|(_, p)| *p < pivot)
                .map(|(item, _)| item)
                .collect()
        }
    };
    if tier.is_empty() {
        return Err(SelectError::NoLowerTier);
    }
    Ok(tier[rng().random_range(0..tier.len())])
}

/// Channel selection over the cache snapshot, with storage as fallback.
pub struct Selector {
    cache: Arc<ChannelCache>,
    memory_cache_enabled: bool,
}

impl Selector {
    pub fn new(cache: Arc<ChannelCache>, memory_cache_enabled: bool) -> Self {
        Self {
            cache,
            memory_cache_enabled,
        }
    }

    pub async fn select(
        &self,
        group: &str,
        model: &str,
        mode: SelectMode,
        exclude: &HashSet<i64>,
    ) -> Result<Arc<Channel>, SelectError> {
        if self.memory_cache_enabled {
            let (candidates, pivot) = self.cache.candidates(group, model, exclude).await;
            if !candidates.is_empty() {
                let weighted: Vec<(Arc<Channel>, i64)> = candidates
                    .into_iter()
                    .map(|c| {
                        let priority = c.priority;
                        (c, priority)
                    })
                    .collect();
                return pick_by_tier(&weighted, pivot, mode).cloned();
            }
            debug!(
                "channel cache has no candidate for {}/{}, falling back to storage",
                group, model
            );
        }

        let channel_id = Ability::pick_random(group, model, mode, exclude)?;
        if let Some(channel) = self.cache.get_channel(channel_id).await {
            return Ok(channel);
        }
        Ok(Arc::new(Channel::get_by_id(channel_id)?))
    }
}
