use std::sync::Arc;
use std::time::Duration;

use cyder_tools::log::{error, info, warn};
use thiserror::Error;

use crate::controller::BaseError;
use crate::database::channel::Channel;
use crate::database::consume_log::ConsumeLog;
use crate::database::token::{QuotaShortfall, Token};
use crate::database::user::User;
use crate::database::user_request_cost::UserRequestCost;
use crate::relay::error::RelayError;
use crate::service::batch::BatchUpdater;
use crate::service::metrics::MetricsRecorder;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    InsufficientQuota(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl From<BaseError> for LedgerError {
    fn from(err: BaseError) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<LedgerError> for RelayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientQuota(msg) => RelayError::insufficient_quota(msg),
            LedgerError::Storage(msg) => RelayError::internal(msg),
        }
    }
}

/// One settled request, as written to the audit log.
#[derive(Debug, Clone, Default)]
pub struct ConsumeRecord {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub elapsed: Duration,
    pub is_stream: bool,
    pub content: Option<String>,
}

/// Quota ledger (C5). Balances move through single field-relative updates;
/// usage counters go through the batch updater when one is configured.
pub struct QuotaLedger {
    batch: Option<Arc<BatchUpdater>>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl QuotaLedger {
    pub fn new(batch: Option<Arc<BatchUpdater>>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { batch, metrics }
    }

    /// Reserves `amount` on both the token and its user. `remind_threshold`
    /// is the balance under which a near-exhaustion warning is emitted.
    pub fn pre_consume(
        &self,
        token_id: i64,
        user_id: i64,
        amount: i64,
        remind_threshold: i64,
    ) -> Result<(), LedgerError> {
        let amount = amount.max(0);
        match Token::reserve_quota(token_id, user_id, amount)? {
            Ok(balances) => {
                if balances.user_quota < remind_threshold
                    && balances.user_quota + amount >= remind_threshold
                {
                    warn!(
                        "user {} quota is running low: {} left (threshold {})",
                        user_id, balances.user_quota, remind_threshold
                    );
                }
                Ok(())
            }
            Err(QuotaShortfall::Token) => Err(LedgerError::InsufficientQuota(
                "token quota is not enough".to_string(),
            )),
            Err(QuotaShortfall::User) => Err(LedgerError::InsufficientQuota(
                "user quota is not enough".to_string(),
            )),
        }
    }

    /// Positive `delta` charges more, negative refunds.
    pub fn settle(&self, token_id: i64, user_id: i64, delta: i64) -> Result<(), LedgerError> {
        Token::adjust_quota(token_id, user_id, delta)?;
        Ok(())
    }

    /// Writes the audit rows of a settled request and bumps usage counters.
    pub fn record(&self, record: &ConsumeRecord) -> Result<(), LedgerError> {
        ConsumeLog::insert(ConsumeLog {
            user_id: record.user_id,
            token_id: record.token_id,
            model: record.model.clone(),
            prompt_tokens: record.prompt_tokens as i32,
            completion_tokens: record.completion_tokens as i32,
            quota: record.quota,
            channel_id: record.channel_id,
            elapsed_ms: record.elapsed.as_millis() as i64,
            is_stream: record.is_stream,
            request_id: record.request_id.clone(),
            content: record.content.clone(),
            ..Default::default()
        })?;
        UserRequestCost::insert(&record.request_id, record.user_id, record.quota)?;
        Token::increase_used_quota(record.token_id, record.quota)?;

        match &self.batch {
            Some(batch) => {
                batch.add_user_usage(record.user_id, record.quota);
                batch.add_channel_usage(record.channel_id, record.quota);
            }
            None => {
                User::increase_usage(record.user_id, record.quota, 1)?;
                Channel::increase_used_quota(record.channel_id, record.quota)?;
            }
        }

        self.metrics.record_model_usage(
            &record.model,
            record.prompt_tokens,
            record.completion_tokens,
            record.quota,
        );
        Ok(())
    }
}

/// A pre-consumed amount that has not been reconciled yet. Dropping it
/// without `commit` or `refund` gives the amount back in the background,
/// which covers client cancellation and panics.
pub struct Reservation {
    ledger: Arc<QuotaLedger>,
    request_id: String,
    token_id: i64,
    user_id: i64,
    amount: i64,
    done: bool,
}

impl Reservation {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        request_id: &str,
        token_id: i64,
        user_id: i64,
        amount: i64,
    ) -> Self {
        Self {
            ledger,
            request_id: request_id.to_string(),
            token_id,
            user_id,
            amount,
            done: false,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    /// Moves the reservation to the final cost.
    pub fn commit(mut self, cost: i64) -> Result<(), LedgerError> {
        self.done = true;
        let delta = cost - self.amount;
        self.ledger.settle(self.token_id, self.user_id, delta)?;
        info!(
            "[{}] settled quota: pre-consumed {}, cost {}, delta {}",
            self.request_id, self.amount, cost, delta
        );
        Ok(())
    }

    pub fn refund(mut self) {
        self.done = true;
        refund(&self.ledger, &self.request_id, self.token_id, self.user_id, self.amount);
    }
}

fn refund(ledger: &QuotaLedger, request_id: &str, token_id: i64, user_id: i64, amount: i64) {
    if amount == 0 {
        return;
    }
    match ledger.settle(token_id, user_id, -amount) {
        Ok(()) => info!("[{}] refunded pre-consumed quota {}", request_id, amount),
        Err(e) => error!("[{}] failed to refund quota {}: {}", request_id, amount, e),
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.done || self.amount == 0 {
            return;
        }
        warn!(
            "[{}] request ended before settlement, refunding {}",
            self.request_id, self.amount
        );
        let ledger = Arc::clone(&self.ledger);
        let request_id = std::mem::take(&mut self.request_id);
        let (token_id, user_id, amount) = (self.token_id, self.user_id, self.amount);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    refund(&ledger, &request_id, token_id, user_id, amount);
                });
            }
            Err(_) => refund(&ledger, &request_id, token_id, user_id, amount),
        }
    }
}
