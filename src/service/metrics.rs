use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Emission points of the gateway. Every method defaults to a no-op so a
/// recorder only implements what it stores.
pub trait MetricsRecorder: Send + Sync {
    fn record_http_request(&self, _method: &str, _path: &str, _status: u16, _elapsed: Duration) {}
    fn record_relay_request(&self, _channel_id: i64, _model: &str, _success: bool, _elapsed: Duration) {}
    fn update_channel_metrics(&self, _channel_id: i64, _success_rate: f64, _enabled: bool) {}
    fn record_rate_limit_hit(&self, _scope: &str) {}
    fn record_token_auth(&self, _success: bool) {}
    fn record_error(&self, _kind: &str) {}
    fn record_model_usage(&self, _model: &str, _prompt_tokens: i64, _completion_tokens: i64, _quota: i64) {}

    /// Current counters, for recorders that keep any.
    fn snapshot(&self) -> Option<MetricsSnapshot> {
        None
    }
}

#[derive(Debug, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
}

/// In-process counters keyed by `name{label=value,...}`; durations are
/// accumulated as `_ms_sum` counters next to their `_total`.
#[derive(Debug, Default)]
pub struct CounterRecorder {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, f64>,
}

impl CounterRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, key: String, value: u64) {
        if let Some(counter) = self.counters.get(&key) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(key)
            .or_default()
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl MetricsRecorder for CounterRecorder {
    fn record_http_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        self.add(
            format!("http_requests_total{{method={},path={},status={}}}", method, path, status),
            1,
        );
        self.add(
            format!("http_request_duration_ms_sum{{path={}}}", path),
            elapsed.as_millis() as u64,
        );
    }

    fn record_relay_request(&self, channel_id: i64, model: &str, success: bool, elapsed: Duration) {
        self.add(
            format!(
                "relay_requests_total{{channel={},model={},success={}}}",
                channel_id, model, success
            ),
            1,
        );
        self.add(
            format!("relay_request_duration_ms_sum{{channel={}}}", channel_id),
            elapsed.as_millis() as u64,
        );
    }

    fn update_channel_metrics(&self, channel_id: i64, success_rate: f64, enabled: bool) {
        self.gauges
            .insert(format!("channel_success_rate{{channel={}}}", channel_id), success_rate);
        self.gauges.insert(
            format!("channel_enabled{{channel={}}}", channel_id),
            if enabled { 1.0 } else { 0.0 },
        );
    }

    fn record_rate_limit_hit(&self, scope: &str) {
        self.add(format!("rate_limit_hits_total{{scope={}}}", scope), 1);
    }

    fn record_token_auth(&self, success: bool) {
        self.add(format!("token_auth_total{{success={}}}", success), 1);
    }

    fn record_error(&self, kind: &str) {
        self.add(format!("errors_total{{kind={}}}", kind), 1);
    }

    fn record_model_usage(&self, model: &str, prompt_tokens: i64, completion_tokens: i64, quota: i64) {
        self.add(
            format!("model_prompt_tokens_total{{model={}}}", model),
            prompt_tokens.max(0) as u64,
        );
        self.add(
            format!("model_completion_tokens_total{{model={}}}", model),
            completion_tokens.max(0) as u64,
        );
        self.add(format!("model_quota_total{{model={}}}", model), quota.max(0) as u64);
    }

    fn snapshot(&self) -> Option<MetricsSnapshot> {
        Some(MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_has_no_snapshot() {
        let recorder = NoopRecorder;
        recorder.record_error("one_api_error");
        assert!(recorder.snapshot().is_none());
    }

    #[test]
    fn counters_accumulate() {
        let recorder = CounterRecorder::new();
        recorder.record_rate_limit_hit("CT");
        recorder.record_rate_limit_hit("CT");
        recorder.record_model_usage("gpt-4", 10, 20, 75);
        recorder.update_channel_metrics(7, 0.5, true);

        assert_eq!(recorder.counter("rate_limit_hits_total{scope=CT}"), 2);
        let snapshot = recorder.snapshot().unwrap();
        assert_eq!(snapshot.counters["model_quota_total{model=gpt-4}"], 75);
        assert_eq!(snapshot.gauges["channel_success_rate{channel=7}"], 0.5);
    }
}
