use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{sse_chunks, Adaptor, StreamChunk, UpstreamReply};
use crate::relay::error::RelayError;
use crate::relay::meta::{RelayMeta, RelayMode};
use crate::relay::model::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChunkChoice, ChunkDelta, Content,
    ContentPart, GeneralOpenAIRequest, Message, Usage,
};
use crate::relay::pricing::PricingEntry;
use crate::utils::sse::SseEvent;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const ANTHROPIC_PRICING: &[(&str, f64, f64)] = &[
    ("claude-3-haiku-20240307", 0.125, 5.0),
    ("claude-3-5-haiku-20241022", 0.4, 5.0),
    ("claude-3-5-sonnet-20241022", 1.5, 5.0),
    ("claude-3-7-sonnet-20250219", 1.5, 5.0),
    ("claude-sonnet-4-20250514", 1.5, 5.0),
    ("claude-3-opus-20240229", 7.5, 5.0),
    ("claude-opus-4-20250514", 7.5, 5.0),
];

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicRequestPayload {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<AnthropicContentBlock>,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicEvent {
    MessageStart { message: AnthropicStreamMessage },
    ContentBlockStart { index: u32, content_block: Value },
    ContentBlockDelta { index: u32, delta: AnthropicContentDelta },
    ContentBlockStop { index: u32 },
    MessageDelta { delta: MessageDelta, #[serde(default)] usage: AnthropicUsage },
    MessageStop,
    Ping,
    Error { error: Value },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicStreamMessage {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageDelta {
    pub stop_reason: Option<String>,
}

fn finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        _ => "stop",
    }
}

fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            });
        }
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

fn content_blocks(message: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    if let Some(content) = &message.content {
        for part in content.parts() {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    blocks.push(json!({"type": "text", "text": text}))
                }
                ContentPart::ImageUrl { image_url } => blocks.push(image_block(&image_url.url)),
                _ => {}
            }
        }
    }
    if let Some(calls) = message.tool_calls.as_ref().and_then(Value::as_array) {
        for call in calls {
            let arguments = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .and_then(|a| serde_json::from_str::<Value>(a).ok())
                .unwrap_or_else(|| json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
                "input": arguments,
            }));
        }
    }
    blocks
}

/// OpenAI chat request → Messages API payload.
pub fn to_anthropic_request(model: &str, request: &GeneralOpenAIRequest) -> AnthropicRequestPayload {
    let mut system = Vec::new();
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    for message in &request.messages {
        let (role, blocks) = match message.role.as_str() {
            "system" | "developer" => {
                system.push(message.content_text());
                continue;
            }
            "tool" => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content_text(),
                })],
            ),
            "assistant" => ("assistant", content_blocks(message)),
            _ => ("user", content_blocks(message)),
        };
        if blocks.is_empty() {
            continue;
        }
        // consecutive turns of one role are merged
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(AnthropicMessage {
                role: role.to_string(),
                content: blocks,
            }),
        }
    }

    let tools = request.tools.as_ref().and_then(Value::as_array).map(|tools| {
        tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(AnthropicTool {
                    name: function.get("name")?.as_str()?.to_string(),
                    description: function
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    input_schema: function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect::<Vec<_>>()
    });

    let stop_sequences = match &request.stop {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    };

    AnthropicRequestPayload {
        model: model.to_string(),
        messages,
        system: (!system.is_empty()).then(|| system.join("\n")),
        max_tokens: request.output_limit().unwrap_or(DEFAULT_MAX_TOKENS),
        tools: tools.filter(|t| !t.is_empty()),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences,
        stream: request.stream,
    }
}

pub fn to_openai_response(response: AnthropicResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            AnthropicContentBlock::Text { text: t } => text.push_str(&t),
            AnthropicContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": input.to_string()},
            })),
            AnthropicContentBlock::Other => {}
        }
    }
    let usage = Usage::new(response.usage.input_tokens, response.usage.output_tokens);
    ChatCompletionResponse {
        id: response.id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: response.model,
        choices: vec![ChatChoice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content: Some(Content::Text(text)),
                tool_calls: (!tool_calls.is_empty()).then(|| Value::Array(tool_calls)),
                ..Default::default()
            },
            finish_reason: response.stop_reason.as_deref().map(|r| finish_reason(r).to_string()),
        }],
        usage: Some(usage),
    }
}

/// Stream state carried across events of one message.
#[derive(Debug, Default)]
struct StreamState {
    id: String,
    model: String,
    input_tokens: i64,
}

impl StreamState {
    fn chunk(&self, delta: ChunkDelta, finish: Option<String>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: Utc::now().timestamp(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage,
        }
    }

    fn convert(&mut self, event: SseEvent) -> Result<Option<StreamChunk>, RelayError> {
        let Ok(event) = serde_json::from_str::<AnthropicEvent>(&event.data) else {
            return Ok(None);
        };
        let chunk = match event {
            AnthropicEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.input_tokens = message.usage.input_tokens;
                self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..Default::default()
                    },
                    None,
                    None,
                )
            }
            AnthropicEvent::ContentBlockDelta {
                delta: AnthropicContentDelta::TextDelta { text },
                ..
            } => self.chunk(
                ChunkDelta {
                    content: Some(text),
                    ..Default::default()
                },
                None,
                None,
            ),
            AnthropicEvent::MessageDelta { delta, usage } => self.chunk(
                ChunkDelta::default(),
                delta.stop_reason.as_deref().map(|r| finish_reason(r).to_string()),
                Some(Usage::new(
                    self.input_tokens + usage.input_tokens,
                    usage.output_tokens,
                )),
            ),
            AnthropicEvent::Error { error } => {
                return Err(RelayError::from_upstream(
                    reqwest::StatusCode::BAD_GATEWAY,
                    json!({ "error": error }).to_string().as_bytes(),
                ));
            }
            _ => return Ok(None),
        };
        let delta = chunk.delta_text();
        let usage = chunk.usage.clone();
        let data = serde_json::to_string(&chunk)
            .map_err(|e| RelayError::internal(format!("failed to encode chunk: {}", e)))?;
        Ok(Some(StreamChunk {
            frame: SseEvent::data(data).to_bytes(),
            delta,
            usage,
        }))
    }
}

#[derive(Default)]
pub struct AnthropicAdaptor {
    api_version: Option<String>,
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn init(&mut self, meta: &RelayMeta) {
        self.api_version = meta.settings.api_version.clone().filter(|v| !v.is_empty());
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError> {
        match meta.mode {
            RelayMode::ChatCompletions => Ok(format!("{}/v1/messages", meta.base_url)),
            mode => Err(RelayError::not_implemented(format!(
                "{} is not supported by anthropic channels",
                mode.path()
            ))),
        }
    }

    fn setup_request_headers(&self, meta: &RelayMeta, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", &meta.api_key)
            .header(
                "anthropic-version",
                self.api_version.as_deref().unwrap_or(ANTHROPIC_VERSION),
            )
    }

    fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &GeneralOpenAIRequest,
    ) -> Result<Value, RelayError> {
        if meta.mode != RelayMode::ChatCompletions {
            return Err(RelayError::not_implemented(format!(
                "{} is not supported by anthropic channels",
                meta.mode.path()
            )));
        }
        serde_json::to_value(to_anthropic_request(&meta.actual_model, request))
            .map_err(|e| RelayError::internal(format!("failed to encode request: {}", e)))
    }

    async fn do_response(
        &self,
        meta: &RelayMeta,
        response: reqwest::Response,
    ) -> Result<UpstreamReply, RelayError> {
        if meta.is_stream {
            let mut state = StreamState::default();
            return Ok(UpstreamReply::Streaming(sse_chunks(response, move |event| {
                state.convert(event)
            })));
        }
        let body = response.bytes().await?;
        let parsed: AnthropicResponse = serde_json::from_slice(&body).map_err(|e| {
            RelayError::unreachable(format!("unexpected anthropic response: {}", e))
        })?;
        let converted = to_openai_response(parsed);
        let text = converted.choices.iter().map(|c| c.message.content_text()).collect();
        let usage = converted.usage.clone();
        let body = serde_json::to_vec(&converted)
            .map_err(|e| RelayError::internal(format!("failed to encode response: {}", e)))?;
        Ok(UpstreamReply::Buffered {
            body: Bytes::from(body),
            content_type: "application/json".to_string(),
            usage,
            text,
        })
    }

    fn model_list(&self) -> Vec<String> {
        ANTHROPIC_PRICING.iter().map(|(m, _, _)| m.to_string()).collect()
    }

    fn channel_name(&self) -> &'static str {
        "anthropic"
    }

    fn default_pricing(&self) -> HashMap<String, PricingEntry> {
        ANTHROPIC_PRICING
            .iter()
            .map(|(model, ratio, completion)| (model.to_string(), PricingEntry::new(*ratio, *completion)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::model::ImageUrl;

    #[test]
    fn request_moves_system_and_merges_turns() {
        let request = GeneralOpenAIRequest {
            model: "claude".to_string(),
            messages: vec![
                Message::text("system", "be brief"),
                Message::text("user", "hello"),
                Message {
                    role: "user".to_string(),
                    content: Some(Content::Parts(vec![ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,AAAA".to_string(),
                            detail: None,
                        },
                    }])),
                    ..Default::default()
                },
                Message::text("assistant", "hi"),
            ],
            stop: Some(json!("END")),
            ..Default::default()
        };
        let payload = to_anthropic_request("claude-3-5-sonnet-20241022", &request);
        assert_eq!(payload.system.as_deref(), Some("be brief"));
        assert_eq!(payload.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.messages[0].content.len(), 2);
        assert_eq!(payload.messages[0].content[1]["source"]["media_type"], "image/png");
        assert_eq!(payload.stop_sequences, Some(vec!["END".to_string()]));
    }

    #[test]
    fn response_maps_stop_reason_and_usage() {
        let response: AnthropicResponse = serde_json::from_value(json!({
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        }))
        .unwrap();
        let converted = to_openai_response(response);
        assert_eq!(converted.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(converted.usage, Some(Usage::new(10, 20)));
    }

    #[test]
    fn stream_events_become_openai_chunks() {
        let mut state = StreamState::default();
        let start = SseEvent {
            event: Some("message_start".to_string()),
            data: r#"{"type":"message_start","message":{"id":"msg_1","model":"claude","usage":{"input_tokens":12,"output_tokens":1}}}"#.to_string(),
        };
        assert!(state.convert(start).unwrap().is_some());

        let delta = SseEvent::data(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        let chunk = state.convert(delta).unwrap().unwrap();
        assert_eq!(chunk.delta, "Hel");

        let ping = SseEvent::data(r#"{"type":"ping"}"#);
        assert!(state.convert(ping).unwrap().is_none());

        let end = SseEvent::data(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
        );
        let chunk = state.convert(end).unwrap().unwrap();
        assert_eq!(chunk.usage, Some(Usage::new(12, 7)));
        let frame = String::from_utf8(chunk.frame.to_vec()).unwrap();
        assert!(frame.contains("\"finish_reason\":\"stop\""));

        let error = SseEvent::data(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#);
        assert_eq!(state.convert(error).unwrap_err().message, "Overloaded");
    }
}
