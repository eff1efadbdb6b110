use std::collections::HashSet;

use axum::http::StatusCode;
use cyder_tools::log::info;

use crate::relay::error::{ErrorKind, RelayError, ALL_CHANNELS_RATE_LIMITED, GROUP_LOAD_SATURATED};
use crate::service::selector::SelectMode;

/// Next step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Select again with `mode`. `fallback` is tried when `mode` finds no
    /// lower tier.
    Retry {
        mode: SelectMode,
        fallback: Option<SelectMode>,
    },
    Stop,
}

/// Why the retry loop ended without a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The failure is not retryable, or routing was pinned.
    Final,
    /// Every attempt the budget allowed has been made.
    BudgetSpent,
    /// The selector has nothing left for this request.
    SelectionExhausted,
}

/// Per-request retry bookkeeping (C8).
#[derive(Debug)]
pub struct RetryController {
    request_id: String,
    remaining: usize,
    multiplier_on_429: usize,
    pinned: bool,
    boosted: bool,
    retries: usize,
    failures: usize,
    rate_limited_failures: usize,
    tried: Vec<i64>,
    excluded: HashSet<i64>,
}

impl RetryController {
    pub fn new(request_id: &str, retry_times: usize, multiplier_on_429: usize, pinned: bool) -> Self {
        Self {
            request_id: request_id.to_string(),
            remaining: if pinned { 0 } else { retry_times },
            multiplier_on_429: multiplier_on_429.max(1),
            pinned,
            boosted: false,
            retries: 0,
            failures: 0,
            rate_limited_failures: 0,
            tried: Vec::new(),
            excluded: HashSet::new(),
        }
    }

    pub fn excluded(&self) -> &HashSet<i64> {
        &self.excluded
    }

    /// Channel ids that got an upstream attempt, in order.
    pub fn tried(&self) -> &[i64] {
        &self.tried
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn record_attempt(&mut self, channel_id: i64) {
        self.tried.push(channel_id);
        self.excluded.insert(channel_id);
    }

    /// Drops a channel from this request without spending an attempt, as
    /// for a channel whose own request budget is saturated.
    pub fn skip(&mut self, channel_id: i64) {
        self.excluded.insert(channel_id);
    }

    pub fn on_failure(&mut self, channel_id: i64, err: &RelayError) -> RetryDecision {
        self.failures += 1;
        if err.is_rate_limited() {
            self.rate_limited_failures += 1;
        }
        if self.pinned || !err.is_retryable() {
            return RetryDecision::Stop;
        }

        let decision = if err.is_rate_limited() {
            if !self.boosted {
                self.boosted = true;
                self.remaining *= self.multiplier_on_429;
            }
            RetryDecision::Retry {
                mode: SelectMode::LowerPriority,
                fallback: None,
            }
        } else if self.retries == 0 {
            RetryDecision::Retry {
                mode: SelectMode::HighestPriority,
                fallback: None,
            }
        } else {
            RetryDecision::Retry {
                mode: SelectMode::LowerPriority,
                fallback: Some(SelectMode::HighestPriority),
            }
        };

        if self.remaining == 0 {
            return RetryDecision::Stop;
        }
        self.remaining -= 1;
        self.retries += 1;
        if let RetryDecision::Retry { mode, .. } = decision {
            info!(
                "[{}] channel {} failed ({}), retrying with {:?}, {} retries left",
                self.request_id,
                channel_id,
                err.status.as_u16(),
                mode,
                self.remaining
            );
        }
        decision
    }

    fn all_rate_limited(&self) -> bool {
        self.failures > 0 && self.failures == self.rate_limited_failures
    }

    /// The error the caller finally sees.
    pub fn final_error(&self, last: RelayError, reason: StopReason) -> RelayError {
        if !last.is_rate_limited() || self.pinned {
            return last;
        }
        let message = match reason {
            StopReason::SelectionExhausted if self.all_rate_limited() => ALL_CHANNELS_RATE_LIMITED,
            StopReason::BudgetSpent => GROUP_LOAD_SATURATED,
            _ => return last,
        };
        RelayError::new(ErrorKind::RateLimit, StatusCode::TOO_MANY_REQUESTS, message)
    }
}
