use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use cyder_tools::log::{error, info, warn};
use futures::{FutureExt, StreamExt};
use serde_json::json;

use crate::config::RateLimitRule;
use crate::database::ability::Ability;
use crate::database::channel::Channel;
use crate::relay::adaptor::{build_json_body, ChunkStream, UpstreamBody, UpstreamReply};
use crate::relay::error::{ErrorKind, RelayError};
use crate::relay::meta::{RelayMeta, RelayMode};
use crate::relay::model::{GeneralOpenAIRequest, Usage};
use crate::relay::pricing::{self, PricingEntry};
use crate::relay::quota::{ConsumeRecord, Reservation};
use crate::relay::retry::{RetryController, RetryDecision, StopReason};
use crate::relay::token_meter::count_text_exact;
use crate::service::app_state::AppState;
use crate::service::health::AttemptOutcome;
use crate::service::options::RuntimeOptions;
use crate::service::selector::{SelectError, SelectMode};
use crate::utils::auth::AuthContext;
use crate::utils::limit::{channel_key, RateLimitError};
use crate::utils::sse::SseEvent;

/// A parsed relay call, ready for dispatch.
#[derive(Debug, Clone)]
pub struct RelayInput {
    pub mode: RelayMode,
    pub request_id: String,
    pub auth: AuthContext,
    pub request: GeneralOpenAIRequest,
    /// Content type and body of a multipart form, forwarded unchanged.
    pub multipart: Option<(String, Bytes)>,
    /// Body as received, kept for the panic log.
    pub raw_body: Bytes,
}

impl RelayInput {
    fn is_stream(&self) -> bool {
        matches!(self.mode, RelayMode::ChatCompletions | RelayMode::Completions)
            && self.request.is_stream()
    }
}

/// Pricing inputs of one attempt.
#[derive(Debug, Clone, Copy)]
struct PriceContext {
    entry: PricingEntry,
    group_ratio: f64,
    channel_ratio: f64,
}

impl PriceContext {
    fn tokens(&self, usage: &Usage) -> i64 {
        pricing::token_cost(usage, &self.entry, self.group_ratio, self.channel_ratio)
    }
}

/// A failed attempt and what it says about the channel.
struct AttemptFailure {
    error: RelayError,
    outcome: Option<AttemptOutcome>,
}

impl AttemptFailure {
    fn local(error: RelayError) -> Self {
        Self {
            error,
            outcome: None,
        }
    }

    fn upstream(error: RelayError) -> Self {
        let outcome = if error.status == StatusCode::UNAUTHORIZED {
            AttemptOutcome::Unauthorized
        } else {
            AttemptOutcome::Failure
        };
        Self {
            error,
            outcome: Some(outcome),
        }
    }
}

impl From<RelayError> for AttemptFailure {
    fn from(error: RelayError) -> Self {
        Self::local(error)
    }
}

/// Entry point of the relay path (C7 + C8). Never fails: every error is
/// rendered as an envelope carrying the request id. A panic anywhere below
/// becomes a 500; an outstanding reservation is refunded by its drop.
pub async fn relay(state: Arc<AppState>, input: RelayInput) -> Response {
    let request_id = input.request_id.clone();
    let raw_body = input.raw_body.clone();
    let result = AssertUnwindSafe(run(state.clone(), input)).catch_unwind().await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                "[{}] relay panicked: {}; request body: {}",
                request_id,
                message,
                String::from_utf8_lossy(&raw_body)
            );
            Err(RelayError::internal(format!("internal error: {}", message)))
        }
    };
    match outcome {
        Ok(response) => response,
        Err(err) => {
            state.metrics.record_error(err.kind.as_str());
            warn!("[{}] relay failed: {}", request_id, err);
            err.into_response_with(&request_id)
        }
    }
}

async fn run(state: Arc<AppState>, input: RelayInput) -> Result<Response, RelayError> {
    let model = input.request.model.clone();
    if model.is_empty() {
        return Err(RelayError::invalid_request("model is required"));
    }
    if !input.auth.allowed_models.is_empty() && !input.auth.allowed_models.contains(&model) {
        return Err(RelayError::forbidden(format!(
            "this token has no access to model {}",
            model
        )));
    }

    let options = state.options.current();
    let prompt_tokens = state.meter.count_prompt(input.mode, &input.request).await;
    let group = input.auth.group.clone();

    let mut retry = RetryController::new(
        &input.request_id,
        options.retry_times as usize,
        options.retry_multiplier_on_429 as usize,
        input.auth.pinned_channel.is_some(),
    );
    let mut mode = SelectMode::HighestPriority;
    let mut fallback: Option<SelectMode> = None;
    let mut last_error: Option<RelayError> = None;

    loop {
        let channel = match pick_channel(&state, &input, &retry, mode, fallback).await {
            Ok(channel) => channel,
            Err(SelectError::Storage(msg)) => return Err(RelayError::internal(msg)),
            Err(err) => {
                return Err(match last_error {
                    Some(last) => retry.final_error(last, StopReason::SelectionExhausted),
                    None => {
                        info!(
                            "[{}] no channel for {}/{}: {}",
                            input.request_id, group, model, err
                        );
                        RelayError::model_not_found(&model, &group)
                    }
                });
            }
        };

        if let Some(limit) = channel.rate_limit.filter(|limit| *limit > 0) {
            let rule = RateLimitRule::new(limit as usize, 60);
            if let Err(RateLimitError::TooManyRequests) =
                state.rate_limiter.check(&channel_key(channel.id), rule).await
            {
                state.metrics.record_rate_limit_hit("channel");
                let err = RelayError::rate_limited(format!(
                    "channel {} is over its request budget",
                    channel.id
                ));
                if retry.is_pinned() {
                    return Err(err);
                }
                info!(
                    "[{}] channel {} saturated, skipping",
                    input.request_id, channel.id
                );
                retry.skip(channel.id);
                last_error = Some(err);
                continue;
            }
        }

        info!(
            "[{}] relaying {} to channel {} ({:?}, priority {})",
            input.request_id, model, channel.id, channel.channel_type, channel.priority
        );
        retry.record_attempt(channel.id);
        let failure = match attempt(&state, &input, &channel, &options, prompt_tokens).await {
            Ok(response) => return Ok(response),
            Err(failure) => failure,
        };
        let err = failure.error;

        if let Some(outcome) = failure.outcome {
            state.health.report(channel.id, outcome, &options).await;
        }
        if err.is_rate_limited() && failure.outcome.is_some() {
            suspend(&state, &input.request_id, &group, &model, channel.id);
        }

        match retry.on_failure(channel.id, &err) {
            RetryDecision::Retry {
                mode: next,
                fallback: next_fallback,
            } => {
                mode = next;
                fallback = next_fallback;
                last_error = Some(err);
            }
            RetryDecision::Stop => {
                let reason = if retry.is_pinned() || !err.is_retryable() {
                    StopReason::Final
                } else {
                    StopReason::BudgetSpent
                };
                return Err(retry.final_error(err, reason));
            }
        }
    }
}

async fn pick_channel(
    state: &AppState,
    input: &RelayInput,
    retry: &RetryController,
    mode: SelectMode,
    fallback: Option<SelectMode>,
) -> Result<Arc<Channel>, SelectError> {
    if let Some(channel_id) = input.auth.pinned_channel {
        if !retry.tried().is_empty() {
            return Err(SelectError::NoneAvailable);
        }
        let channel = match state.channel_cache.get_channel(channel_id).await {
            Some(channel) => channel,
            None => Arc::new(Channel::get_by_id(channel_id).map_err(|_| SelectError::NoneAvailable)?),
        };
        if !channel.is_enabled() {
            return Err(SelectError::NoneAvailable);
        }
        return Ok(channel);
    }

    let group = &input.auth.group;
    let model = &input.request.model;
    match state.selector.select(group, model, mode, retry.excluded()).await {
        Err(SelectError::NoLowerTier) => match fallback {
            Some(fallback) => state.selector.select(group, model, fallback, retry.excluded()).await,
            None => Err(SelectError::NoLowerTier),
        },
        other => other,
    }
}

fn suspend(state: &AppState, request_id: &str, group: &str, model: &str, channel_id: i64) {
    let duration = state.settings.channel_suspend;
    let until = match Ability::suspend(group, model, channel_id, duration) {
        Ok(until) => until,
        Err(e) => {
            error!("[{}] failed to persist suspension: {}", request_id, e);
            chrono::Utc::now().timestamp_millis() + duration.as_millis() as i64
        }
    };
    state.channel_cache.suspend_local(group, model, channel_id, until);
    info!(
        "[{}] suspended channel {} for {}/{} for {}s",
        request_id,
        channel_id,
        group,
        model,
        duration.as_secs()
    );
}

/// Amount reserved before the upstream call, by relay mode.
fn pre_consume_amount(
    input: &RelayInput,
    price: &PriceContext,
    prompt_tokens: i64,
    options: &RuntimeOptions,
) -> Result<i64, RelayError> {
    let request = &input.request;
    let amount = match input.mode {
        RelayMode::ImagesGenerations | RelayMode::ImagesEdits => {
            let size = request.size.as_deref().unwrap_or("1024x1024");
            let size_ratio = pricing::image_size_ratio(&request.model, size, request.quality.as_deref())
                .ok_or_else(|| {
                    RelayError::invalid_request(format!(
                        "size {} is not supported by {}",
                        size, request.model
                    ))
                })?;
            pricing::image_cost(
                &price.entry,
                size_ratio,
                request.n.unwrap_or(1),
                price.group_ratio,
                price.channel_ratio,
            )
        }
        RelayMode::AudioSpeech => pricing::character_cost(
            speech_input(request).chars().count(),
            &price.entry,
            price.group_ratio,
            price.channel_ratio,
        ),
        _ => pricing::pre_consume_amount(
            prompt_tokens,
            request.output_limit(),
            options.pre_consumed_quota,
            &price.entry,
            price.group_ratio,
            price.channel_ratio,
        ),
    };
    Ok(amount)
}

fn speech_input(request: &GeneralOpenAIRequest) -> String {
    request.input_texts().concat()
}

fn with_timeout_error(timeout: Duration) -> RelayError {
    RelayError::new(
        ErrorKind::UpstreamUnreachable,
        StatusCode::GATEWAY_TIMEOUT,
        format!("upstream did not answer within {}s", timeout.as_secs()),
    )
}

async fn attempt(
    state: &Arc<AppState>,
    input: &RelayInput,
    channel: &Channel,
    options: &RuntimeOptions,
    prompt_tokens: i64,
) -> Result<Response, AttemptFailure> {
    let is_stream = input.is_stream();
    let mut meta = RelayMeta::new(
        input.mode,
        &input.request_id,
        channel,
        input.auth.user_id,
        input.auth.token_id,
        &input.auth.group,
        &input.request.model,
        is_stream,
    );
    meta.prompt_tokens = prompt_tokens;

    let mut adaptor = state.registry.get(channel.channel_type).ok_or_else(|| {
        RelayError::not_implemented(format!("no adaptor for {:?}", channel.channel_type))
    })?;
    adaptor.init(&meta);

    let price = PriceContext {
        entry: pricing::resolve(channel, &meta.original_model, &meta.actual_model, adaptor.as_ref()),
        group_ratio: options.group_ratio_of(&meta.group),
        channel_ratio: channel.channel_ratio(),
    };
    let amount = pre_consume_amount(input, &price, prompt_tokens, options)?;
    state
        .ledger
        .pre_consume(meta.token_id, meta.user_id, amount, options.quota_remind_threshold)
        .map_err(RelayError::from)?;
    let reservation = Reservation::new(
        state.ledger.clone(),
        &meta.request_id,
        meta.token_id,
        meta.user_id,
        amount,
    );

    let body = match &input.multipart {
        Some((content_type, bytes)) => UpstreamBody::Multipart {
            content_type: content_type.clone(),
            bytes: bytes.clone(),
        },
        None => {
            let mut request = input.request.clone();
            if let Some(prompt) = channel.system_prompt.as_deref() {
                request.apply_system_prompt(prompt);
            }
            if state.settings.enforce_include_usage {
                request.force_include_usage();
            }
            UpstreamBody::Json(build_json_body(adaptor.as_ref(), &meta, &request)?)
        }
    };

    let timeout = state.settings.relay_timeout;
    let sent = adaptor.do_request(&state.relay_client, &meta, body);
    let response = match timeout {
        Some(limit) => tokio::time::timeout(limit, sent)
            .await
            .map_err(|_| with_timeout_error(limit))
            .and_then(|r| r),
        None => sent.await,
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            reservation.refund();
            return Err(AttemptFailure::upstream(err));
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        reservation.refund();
        let err = RelayError::from_upstream(status, &body);
        warn!(
            "[{}] channel {} answered {}: {}",
            meta.request_id,
            channel.id,
            status.as_u16(),
            err.message
        );
        return Err(AttemptFailure::upstream(err));
    }

    let handled = adaptor.do_response(&meta, response);
    let reply = match (timeout, is_stream) {
        (Some(limit), false) => tokio::time::timeout(limit, handled)
            .await
            .map_err(|_| with_timeout_error(limit))
            .and_then(|r| r),
        _ => handled.await,
    };
    let reply = match reply {
        Ok(reply) => reply,
        Err(err) => {
            reservation.refund();
            return Err(AttemptFailure::upstream(err));
        }
    };

    let settlement = Settlement {
        state: state.clone(),
        meta,
        price,
        speech_chars: speech_input(&input.request).chars().count(),
        pre_consumed: amount,
    };
    match reply {
        UpstreamReply::Buffered {
            body,
            content_type,
            usage,
            text,
        } => {
            let usage = settlement.buffered_usage(usage, &text);
            settlement.finish(reservation, &usage).await;
            Ok(buffered_response(&settlement.meta.request_id, body, &content_type))
        }
        UpstreamReply::Streaming(chunks) => Ok(stream_response(settlement, reservation, chunks)),
    }
}

/// What is needed to bill an attempt once the upstream has answered.
struct Settlement {
    state: Arc<AppState>,
    meta: RelayMeta,
    price: PriceContext,
    speech_chars: usize,
    pre_consumed: i64,
}

impl Settlement {
    fn buffered_usage(&self, reported: Option<Usage>, text: &str) -> Usage {
        match self.meta.mode {
            RelayMode::AudioTranscription | RelayMode::AudioTranslation => reported
                .unwrap_or_else(|| Usage::new(0, count_text_exact(text, &self.meta.actual_model))),
            _ => reported.unwrap_or_else(|| {
                Usage::new(
                    self.meta.prompt_tokens,
                    self.state.meter.count_text(text, &self.meta.actual_model),
                )
            }),
        }
    }

    fn cost(&self, usage: &Usage) -> i64 {
        match self.meta.mode {
            RelayMode::ImagesGenerations | RelayMode::ImagesEdits => self.pre_consumed,
            RelayMode::AudioSpeech => pricing::character_cost(
                self.speech_chars,
                &self.price.entry,
                self.price.group_ratio,
                self.price.channel_ratio,
            ),
            _ => self.price.tokens(usage),
        }
    }

    async fn finish(&self, reservation: Reservation, usage: &Usage) {
        let cost = self.cost(usage);
        let meta = &self.meta;
        if let Err(e) = reservation.commit(cost) {
            error!("[{}] failed to settle quota: {}", meta.request_id, e);
        }
        let record = ConsumeRecord {
            request_id: meta.request_id.clone(),
            user_id: meta.user_id,
            token_id: meta.token_id,
            channel_id: meta.channel_id,
            model: meta.original_model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: cost,
            elapsed: meta.started_at.elapsed(),
            is_stream: meta.is_stream,
            content: (meta.original_model != meta.actual_model)
                .then(|| format!("model mapped to {}", meta.actual_model)),
        };
        if let Err(e) = self.state.ledger.record(&record) {
            error!("[{}] failed to write consume log: {}", meta.request_id, e);
        }
        let options = self.state.options.current();
        self.state
            .health
            .report(meta.channel_id, AttemptOutcome::Success, &options)
            .await;
        self.state.metrics.record_relay_request(
            meta.channel_id,
            &meta.original_model,
            true,
            meta.started_at.elapsed(),
        );
        info!(
            "[{}] settled on channel {}: prompt {}, completion {}, quota {}",
            meta.request_id, meta.channel_id, usage.prompt_tokens, usage.completion_tokens, cost
        );
    }
}

fn request_id_header(request_id: &str) -> HeaderValue {
    HeaderValue::from_str(request_id).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

fn buffered_response(request_id: &str, body: Bytes, content_type: &str) -> Response {
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert("x-request-id", request_id_header(request_id));
    response
}

/// Forwards chunks in arrival order, then settles. A broken upstream ends
/// the stream with an error event and refunds.
fn stream_response(
    settlement: Settlement,
    reservation: Reservation,
    mut chunks: ChunkStream,
) -> Response {
    let request_id = settlement.meta.request_id.clone();
    let stream = async_stream::stream! {
        let mut reservation = Some(reservation);
        let mut usage: Option<Usage> = None;
        let mut completion = String::new();
        let mut failed = None;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    completion.push_str(&chunk.delta);
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    yield Ok::<Bytes, std::convert::Infallible>(chunk.frame);
                }
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }

        let meta = &settlement.meta;
        match failed {
            Some(err) => {
                warn!("[{}] upstream stream failed: {}", meta.request_id, err);
                if let Some(reservation) = reservation.take() {
                    reservation.refund();
                }
                let options = settlement.state.options.current();
                settlement
                    .state
                    .health
                    .report(meta.channel_id, AttemptOutcome::Failure, &options)
                    .await;
                settlement
                    .state
                    .metrics
                    .record_relay_request(meta.channel_id, &meta.original_model, false, meta.started_at.elapsed());
                let body = json!({ "error": err.to_json(&meta.request_id)["error"] });
                yield Ok(SseEvent::data(body.to_string()).to_bytes());
            }
            None => {
                let usage = usage.unwrap_or_else(|| {
                    Usage::new(meta.prompt_tokens, count_text_exact(&completion, &meta.actual_model))
                });
                if let Some(reservation) = reservation.take() {
                    settlement.finish(reservation, &usage).await;
                }
                yield Ok(SseEvent::done().to_bytes());
            }
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert("x-request-id", request_id_header(&request_id));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::NewChannelPayload;
    use crate::database::consume_log::ConsumeLog;
    use crate::database::token::{NewTokenPayload, Token};
    use crate::database::user::User;
    use crate::schema::enum_def::{ChannelStatus, ChannelType, UserRole};
    use crate::service::app_state::AppSettings;
    use crate::testing::{create_user_with, setup_db, test_state, test_state_with_options, unique_name};
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::collections::HashSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const PRICING_1_5_X2: &str = r#"{"gpt-3.5-turbo":{"ratio":1.5,"completion_ratio":2.0}}"#;

    struct Fixture {
        state: Arc<AppState>,
        user: User,
        token: Token,
        group: String,
    }

    async fn fixture(quota: i64) -> Fixture {
        setup_db();
        let group = unique_name("grp");
        let user = create_user_with(quota, UserRole::Common, &group);
        let token = Token::create(&NewTokenPayload {
            user_id: user.id,
            name: unique_name("t"),
            unlimited_quota: true,
            ..Default::default()
        })
        .unwrap();
        let state = test_state(AppSettings::default());
        Fixture {
            state,
            user,
            token,
            group,
        }
    }

    fn channel(group: &str, model: &str, base_url: &str, priority: i64) -> Channel {
        Channel::create(&NewChannelPayload {
            channel_type: ChannelType::Openai,
            name: unique_name("ch"),
            api_key: "sk-upstream".to_string(),
            base_url: Some(base_url.to_string()),
            priority: Some(priority),
            models: model.to_string(),
            groups: Some(group.to_string()),
            model_configs: Some(PRICING_1_5_X2.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn input(f: &Fixture, model: &str, body: Value) -> RelayInput {
        let mut request: GeneralOpenAIRequest = serde_json::from_value(body).unwrap();
        request.model = model.to_string();
        RelayInput {
            mode: RelayMode::ChatCompletions,
            request_id: unique_name("rid"),
            auth: AuthContext {
                user_id: f.user.id,
                token_id: f.token.id,
                group: f.group.clone(),
                role: UserRole::Common,
                token_quota: None,
                pinned_channel: None,
                allowed_models: Vec::new(),
            },
            request,
            multipart: None,
            raw_body: Bytes::new(),
        }
    }

    fn chat_body() -> Value {
        json!({"messages": [{"role": "user", "content": "hello world"}], "max_tokens": 20})
    }

    fn completion(usage: (i64, i64)) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-3.5-turbo",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": usage.0, "completion_tokens": usage.1, "total_tokens": usage.0 + usage.1}
        })
    }

    async fn upstream(status: u16, body: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn buffered_happy_path_settles_exact_cost() {
        let f = fixture(1_000_000).await;
        let server = upstream(200, completion((10, 20))).await;
        channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let input = input(&f, "gpt-3.5-turbo", chat_body());
        let request_id = input.request_id.clone();
        let response = relay(f.state.clone(), input).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], request_id.as_str());
        let body = body_json(response).await;
        assert_eq!(body["choices"][0]["message"]["content"], "hi");

        assert_eq!(User::get_by_id(f.user.id).unwrap().quota, 999_925);
        let logs = ConsumeLog::list_by_request_id(&request_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].quota, 75);
        assert_eq!(logs[0].prompt_tokens, 10);
        assert_eq!(logs[0].completion_tokens, 20);
    }

    #[tokio::test]
    async fn upstream_failure_refunds_everything() {
        let f = fixture(1_000_000).await;
        let server = upstream(500, json!({"error": {"message": "boom", "type": ""}})).await;
        channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let input = input(&f, "gpt-3.5-turbo", chat_body());
        let request_id = input.request_id.clone();
        let response = relay(f.state.clone(), input).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "upstream_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .ends_with(&format!("(request id: {})", request_id)));

        assert_eq!(User::get_by_id(f.user.id).unwrap().quota, 1_000_000);
        assert!(ConsumeLog::list_by_request_id(&request_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_channel_is_suspended_and_lower_tier_serves() {
        let f = fixture(1_000_000).await;
        let busy = upstream(429, json!({"error": {"message": "slow down", "type": "rate_limit"}})).await;
        let spare = upstream(200, completion((10, 20))).await;
        let a = channel(&f.group, "gpt-4,gpt-3.5", &busy.uri(), 100);
        let b = channel(&f.group, "gpt-4", &spare.uri(), 50);
        f.state.channel_cache.refresh().await.unwrap();

        let response = relay(f.state.clone(), input(&f, "gpt-4", chat_body())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(spare.received_requests().await.unwrap().len(), 1);

        let suspended: Vec<_> = Ability::list_by_channel(a.id)
            .unwrap()
            .into_iter()
            .filter(|row| row.suspend_until.is_some())
            .collect();
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].model, "gpt-4");

        let none = HashSet::new();
        for _ in 0..10 {
            let picked = f
                .state
                .selector
                .select(&f.group, "gpt-4", SelectMode::HighestPriority, &none)
                .await
                .unwrap();
            assert_eq!(picked.id, b.id);
        }
        let other = f
            .state
            .selector
            .select(&f.group, "gpt-3.5", SelectMode::HighestPriority, &none)
            .await
            .unwrap();
        assert_eq!(other.id, a.id);
    }

    #[tokio::test]
    async fn failing_channels_are_never_retried() {
        let f = fixture(1_000_000).await;
        let x = upstream(500, json!({})).await;
        let y = upstream(500, json!({})).await;
        let z = upstream(200, completion((10, 20))).await;
        let servers = [&x, &y, &z];
        for server in servers {
            channel(&f.group, "gpt-3.5-turbo", &server.uri(), 10);
        }
        f.state.channel_cache.refresh().await.unwrap();

        let response = relay(f.state.clone(), input(&f, "gpt-3.5-turbo", chat_body())).await;
        assert_eq!(response.status(), StatusCode::OK);
        for server in servers {
            assert!(server.received_requests().await.unwrap().len() <= 1);
        }
        assert_eq!(z.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn token_model_gate_blocks_before_billing() {
        let f = fixture(1_000_000).await;
        let mut input = input(&f, "gpt-4", chat_body());
        input.auth.allowed_models = vec!["gpt-3.5-turbo".to_string()];
        let response = relay(f.state.clone(), input).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(User::get_by_id(f.user.id).unwrap().quota, 1_000_000);
    }

    #[tokio::test]
    async fn insufficient_quota_is_not_retried() {
        let f = fixture(10).await;
        let server = upstream(200, completion((10, 20))).await;
        channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let response = relay(f.state.clone(), input(&f, "gpt-3.5-turbo", chat_body())).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "insufficient_quota");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_model_is_reported() {
        let f = fixture(1_000).await;
        let response = relay(f.state.clone(), input(&f, "no-such-model", chat_body())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "model_not_found");
    }

    #[tokio::test]
    async fn stream_keeps_order_and_bills_reported_usage() {
        let f = fixture(1_000_000).await;
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"A\"}}]}\n\n",
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"B\"}}]}\n\n",
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20,\"total_tokens\":30}}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;
        channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let mut body = chat_body();
        body["stream"] = json!(true);
        let input = input(&f, "gpt-3.5-turbo", body);
        let request_id = input.request_id.clone();
        let response = relay(f.state.clone(), input).await;
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let a = text.find("\"A\"").unwrap();
        let b = text.find("\"B\"").unwrap();
        assert!(a < b);
        assert!(text.ends_with("data: [DONE]\n\n"));

        assert_eq!(User::get_by_id(f.user.id).unwrap().quota, 999_925);
        assert_eq!(ConsumeLog::list_by_request_id(&request_id).unwrap()[0].is_stream, true);
    }

    #[tokio::test]
    async fn stream_without_usage_is_recounted() {
        let f = fixture(1_000_000).await;
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hello world\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse))
            .mount(&server)
            .await;
        channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let mut body = chat_body();
        body["stream"] = json!(true);
        let input = input(&f, "gpt-3.5-turbo", body);
        let request_id = input.request_id.clone();
        let response = relay(f.state.clone(), input).await;
        to_bytes(response.into_body(), usize::MAX).await.unwrap();

        let log = &ConsumeLog::list_by_request_id(&request_id).unwrap()[0];
        assert_eq!(log.completion_tokens, 2);
        assert_eq!(log.prompt_tokens, 9);
    }

    #[tokio::test]
    async fn mid_stream_error_ends_with_error_event_and_refund() {
        let f = fixture(1_000_000).await;
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"A\"}}]}\n\ndata: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse))
            .mount(&server)
            .await;
        channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let mut body = chat_body();
        body["stream"] = json!(true);
        let response = relay(f.state.clone(), input(&f, "gpt-3.5-turbo", body)).await;
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"overloaded"));
        assert!(!text.contains("[DONE]"));
        assert_eq!(User::get_by_id(f.user.id).unwrap().quota, 1_000_000);
    }

    #[tokio::test]
    async fn mid_stream_error_counts_against_channel_health() {
        let options = RuntimeOptions {
            automatic_disable_channel_enabled: true,
            channel_success_rate_threshold: 0.5,
            channel_health_window: 1,
            ..Default::default()
        };
        let f = Fixture {
            state: test_state_with_options(AppSettings::default(), options),
            ..fixture(1_000_000).await
        };
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"A\"}}]}\n\ndata: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse))
            .mount(&server)
            .await;
        let created = channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let mut body = chat_body();
        body["stream"] = json!(true);
        let response = relay(f.state.clone(), input(&f, "gpt-3.5-turbo", body)).await;
        to_bytes(response.into_body(), usize::MAX).await.unwrap();

        assert_eq!(
            Channel::get_by_id(created.id).unwrap().status,
            ChannelStatus::AutoDisabled
        );
    }

    #[tokio::test]
    async fn system_prompt_and_mapping_reach_upstream() {
        let f = fixture(1_000_000).await;
        let server = upstream(200, completion((10, 20))).await;
        let created = channel(&f.group, "gpt-3.5-turbo", &server.uri(), 0);
        Channel::update(
            created.id,
            &crate::database::channel::UpdateChannelData {
                system_prompt: Some(Some("be terse".to_string())),
                model_mapping: Some(Some(r#"{"gpt-3.5-turbo":"gpt-35-internal"}"#.to_string())),
                ..Default::default()
            },
        )
        .unwrap();
        f.state.channel_cache.refresh().await.unwrap();

        let response = relay(f.state.clone(), input(&f, "gpt-3.5-turbo", chat_body())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let requests: Vec<Request> = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["model"], "gpt-35-internal");
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["messages"][0]["content"], "be terse");
    }

    #[tokio::test]
    async fn saturated_channel_is_skipped_without_an_attempt() {
        let f = fixture(1_000_000).await;
        let limited = upstream(200, completion((10, 20))).await;
        let other = upstream(200, completion((10, 20))).await;
        let created = channel(&f.group, "gpt-3.5-turbo", &limited.uri(), 100);
        Channel::update(
            created.id,
            &crate::database::channel::UpdateChannelData {
                rate_limit: Some(Some(1)),
                ..Default::default()
            },
        )
        .unwrap();
        channel(&f.group, "gpt-3.5-turbo", &other.uri(), 10);
        f.state.channel_cache.refresh().await.unwrap();

        for _ in 0..2 {
            let response = relay(f.state.clone(), input(&f, "gpt-3.5-turbo", chat_body())).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(limited.received_requests().await.unwrap().len(), 1);
        assert_eq!(other.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pinned_channel_gets_a_single_attempt() {
        let f = fixture(1_000_000).await;
        let failing = upstream(500, json!({})).await;
        let healthy = upstream(200, completion((10, 20))).await;
        let pinned = channel(&f.group, "gpt-3.5-turbo", &failing.uri(), 0);
        channel(&f.group, "gpt-3.5-turbo", &healthy.uri(), 0);
        f.state.channel_cache.refresh().await.unwrap();

        let mut input = input(&f, "gpt-3.5-turbo", chat_body());
        input.auth.pinned_channel = Some(pinned.id);
        let response = relay(f.state.clone(), input).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(healthy.received_requests().await.unwrap().is_empty());
    }
}
