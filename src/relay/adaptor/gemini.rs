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
use crate::utils::ID_GENERATOR;

const GEMINI_PRICING: &[(&str, f64, f64)] = &[
    ("gemini-1.5-flash", 0.0375, 4.0),
    ("gemini-1.5-pro", 0.625, 4.0),
    ("gemini-2.0-flash", 0.05, 4.0),
    ("gemini-2.0-flash-lite", 0.0375, 4.0),
    ("gemini-2.5-flash", 0.15, 8.33),
    ("gemini-2.5-pro", 0.625, 8.0),
];

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<GeminiInlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<GeminiFileData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiInlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequestPayload {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: i64,
    #[serde(default)]
    pub candidates_token_count: i64,
    #[serde(default)]
    pub total_token_count: i64,
}

impl From<&GeminiUsageMetadata> for Usage {
    fn from(meta: &GeminiUsageMetadata) -> Self {
        Usage::new(meta.prompt_token_count, meta.candidates_token_count)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

fn finish_reason(reason: &str) -> &'static str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

fn image_part(url: &str) -> GeminiPart {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime_type, data)) = rest.split_once(";base64,") {
            return GeminiPart {
                inline_data: Some(GeminiInlineData {
                    mime_type: mime_type.to_string(),
                    data: data.to_string(),
                }),
                ..Default::default()
            };
        }
    }
    let mime_type = match url.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    };
    GeminiPart {
        file_data: Some(GeminiFileData {
            mime_type: mime_type.to_string(),
            file_uri: url.to_string(),
        }),
        ..Default::default()
    }
}

fn message_parts(message: &Message) -> Vec<GeminiPart> {
    let mut parts = Vec::new();
    if let Some(content) = &message.content {
        for part in content.parts() {
            match part {
                ContentPart::Text { text } if !text.is_empty() => parts.push(GeminiPart {
                    text: Some(text),
                    ..Default::default()
                }),
                ContentPart::ImageUrl { image_url } => parts.push(image_part(&image_url.url)),
                _ => {}
            }
        }
    }
    if let Some(calls) = message.tool_calls.as_ref().and_then(Value::as_array) {
        for call in calls {
            let Some(name) = call.pointer("/function/name").and_then(Value::as_str) else {
                continue;
            };
            let args = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .and_then(|a| serde_json::from_str(a).ok())
                .unwrap_or_else(|| json!({}));
            parts.push(GeminiPart {
                function_call: Some(GeminiFunctionCall {
                    name: name.to_string(),
                    args,
                }),
                ..Default::default()
            });
        }
    }
    parts
}

pub fn to_gemini_request(request: &GeneralOpenAIRequest) -> GeminiRequestPayload {
    let mut system = Vec::new();
    let mut contents: Vec<GeminiContent> = Vec::new();
    // tool_call_id → function name, for tool replies
    let mut call_names = HashMap::new();

    for message in &request.messages {
        if let Some(calls) = message.tool_calls.as_ref().and_then(Value::as_array) {
            for call in calls {
                if let (Some(id), Some(name)) = (
                    call.get("id").and_then(Value::as_str),
                    call.pointer("/function/name").and_then(Value::as_str),
                ) {
                    call_names.insert(id.to_string(), name.to_string());
                }
            }
        }
        let (role, parts) = match message.role.as_str() {
            "system" | "developer" => {
                system.push(GeminiPart {
                    text: Some(message.content_text()),
                    ..Default::default()
                });
                continue;
            }
            "tool" => {
                let name = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
                    .or_else(|| message.name.clone())
                    .unwrap_or_default();
                let text = message.content_text();
                let response = serde_json::from_str::<Value>(&text)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({ "content": text }));
                (
                    "user",
                    vec![GeminiPart {
                        function_response: Some(json!({"name": name, "response": response})),
                        ..Default::default()
                    }],
                )
            }
            "assistant" => ("model", message_parts(message)),
            _ => ("user", message_parts(message)),
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(GeminiContent {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let tools = request.tools.as_ref().and_then(Value::as_array).map(|tools| {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function").cloned())
            .collect();
        vec![json!({ "functionDeclarations": declarations })]
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

    GeminiRequestPayload {
        contents,
        system_instruction: (!system.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system,
        }),
        tools,
        generation_config: Some(GeminiGenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.output_limit(),
            top_p: request.top_p,
            stop_sequences,
        }),
    }
}

fn candidate_text(candidate: &GeminiCandidate) -> String {
    candidate
        .content
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .collect()
}

fn candidate_tool_calls(candidate: &GeminiCandidate) -> Option<Value> {
    let calls: Vec<Value> = candidate
        .content
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.function_call.as_ref())
        .map(|call| {
            json!({
                "id": format!("call_{}", ID_GENERATOR.generate_id()),
                "type": "function",
                "function": {"name": call.name, "arguments": call.args.to_string()},
            })
        })
        .collect();
    (!calls.is_empty()).then(|| Value::Array(calls))
}

pub fn to_openai_response(response: GeminiResponse, model: &str) -> ChatCompletionResponse {
    let choices = response
        .candidates
        .iter()
        .map(|candidate| {
            let tool_calls = candidate_tool_calls(candidate);
            let finish = if tool_calls.is_some() {
                Some("tool_calls".to_string())
            } else {
                candidate.finish_reason.as_deref().map(|r| finish_reason(r).to_string())
            };
            ChatChoice {
                index: candidate.index,
                message: Message {
                    role: "assistant".to_string(),
                    content: Some(Content::Text(candidate_text(candidate))),
                    tool_calls,
                    ..Default::default()
                },
                finish_reason: finish,
            }
        })
        .collect();
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", ID_GENERATOR.generate_id()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: response.model_version.clone().unwrap_or_else(|| model.to_string()),
        choices,
        usage: response.usage_metadata.as_ref().map(Usage::from),
    }
}

fn convert_stream_event(id: &str, model: &str, event: SseEvent) -> Result<Option<StreamChunk>, RelayError> {
    let value: Value = match serde_json::from_str(&event.data) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    if value.get("error").is_some() {
        return Err(RelayError::from_upstream(
            reqwest::StatusCode::BAD_GATEWAY,
            event.data.as_bytes(),
        ));
    }
    let response: GeminiResponse = serde_json::from_value(value)
        .map_err(|e| RelayError::unreachable(format!("unexpected gemini chunk: {}", e)))?;
    let chunk = ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices: response
            .candidates
            .iter()
            .map(|candidate| ChunkChoice {
                index: candidate.index,
                delta: ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(candidate_text(candidate)),
                    tool_calls: candidate_tool_calls(candidate),
                },
                finish_reason: candidate
                    .finish_reason
                    .as_deref()
                    .map(|r| finish_reason(r).to_string()),
            })
            .collect(),
        usage: response.usage_metadata.as_ref().map(Usage::from),
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

#[derive(Default)]
pub struct GeminiAdaptor {
    api_version: Option<String>,
}

impl GeminiAdaptor {
    fn version(&self) -> &str {
        self.api_version.as_deref().unwrap_or("v1beta")
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn init(&mut self, meta: &RelayMeta) {
        self.api_version = meta.settings.api_version.clone().filter(|v| !v.is_empty());
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError> {
        if meta.mode != RelayMode::ChatCompletions {
            return Err(RelayError::not_implemented(format!(
                "{} is not supported by gemini channels",
                meta.mode.path()
            )));
        }
        let action = if meta.is_stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(format!(
            "{}/{}/models/{}:{}",
            meta.base_url,
            self.version(),
            meta.actual_model,
            action
        ))
    }

    fn setup_request_headers(&self, meta: &RelayMeta, builder: RequestBuilder) -> RequestBuilder {
        builder.header("x-goog-api-key", &meta.api_key)
    }

    fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &GeneralOpenAIRequest,
    ) -> Result<Value, RelayError> {
        if meta.mode != RelayMode::ChatCompletions {
            return Err(RelayError::not_implemented(format!(
                "{} is not supported by gemini channels",
                meta.mode.path()
            )));
        }
        serde_json::to_value(to_gemini_request(request))
            .map_err(|e| RelayError::internal(format!("failed to encode request: {}", e)))
    }

    async fn do_response(
        &self,
        meta: &RelayMeta,
        response: reqwest::Response,
    ) -> Result<UpstreamReply, RelayError> {
        if meta.is_stream {
            let id = format!("chatcmpl-{}", ID_GENERATOR.generate_id());
            let model = meta.actual_model.clone();
            return Ok(UpstreamReply::Streaming(sse_chunks(response, move |event| {
                convert_stream_event(&id, &model, event)
            })));
        }
        let body = response.bytes().await?;
        let parsed: GeminiResponse = serde_json::from_slice(&body)
            .map_err(|e| RelayError::unreachable(format!("unexpected gemini response: {}", e)))?;
        let converted = to_openai_response(parsed, &meta.actual_model);
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
        GEMINI_PRICING.iter().map(|(m, _, _)| m.to_string()).collect()
    }

    fn channel_name(&self) -> &'static str {
        "google gemini"
    }

    fn default_pricing(&self) -> HashMap<String, PricingEntry> {
        GEMINI_PRICING
            .iter()
            .map(|(model, ratio, completion)| (model.to_string(), PricingEntry::new(*ratio, *completion)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::Channel;
    use crate::schema::enum_def::ChannelType;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta(base_url: &str, stream: bool) -> RelayMeta {
        let channel = Channel {
            id: 3,
            channel_type: ChannelType::Gemini,
            api_key: "g-key".to_string(),
            base_url: Some(base_url.to_string()),
            ..Default::default()
        };
        RelayMeta::new(
            RelayMode::ChatCompletions,
            "rid",
            &channel,
            1,
            1,
            "default",
            "gemini-2.0-flash",
            stream,
        )
    }

    #[test]
    fn request_shape() {
        let request = GeneralOpenAIRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                Message::text("system", "be brief"),
                Message::text("user", "hello"),
                Message::text("assistant", "hi"),
                Message::text("user", "again"),
            ],
            max_tokens: Some(64),
            temperature: Some(0.2),
            ..Default::default()
        };
        let payload = serde_json::to_value(to_gemini_request(&request)).unwrap();
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(payload["contents"].as_array().unwrap().len(), 3);
        assert_eq!(payload["contents"][1]["role"], "model");
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(payload["generationConfig"]["temperature"], 0.2);
    }

    #[test]
    fn stream_url_uses_sse() {
        let adaptor = GeminiAdaptor::default();
        let url = adaptor.request_url(&meta("https://g.local", true)).unwrap();
        assert_eq!(
            url,
            "https://g.local/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[tokio::test]
    async fn buffered_reply_is_converted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "index": 0,
                    "content": {"role": "model", "parts": [{"text": "Hello"}, {"text": " there"}]},
                    "finishReason": "MAX_TOKENS"
                }],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
            })))
            .mount(&server)
            .await;

        let meta = meta(&server.uri(), false);
        let adaptor = GeminiAdaptor::default();
        let body = adaptor
            .convert_request(
                &meta,
                &GeneralOpenAIRequest {
                    messages: vec![Message::text("user", "hi")],
                    ..Default::default()
                },
            )
            .unwrap();
        let response = adaptor
            .do_request(&reqwest::Client::new(), &meta, super::super::UpstreamBody::Json(body))
            .await
            .unwrap();
        let UpstreamReply::Buffered { body, usage, text, .. } =
            adaptor.do_response(&meta, response).await.unwrap()
        else {
            panic!("expected buffered reply");
        };
        assert_eq!(usage, Some(Usage::new(4, 2)));
        assert_eq!(text, "Hello there");
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn stream_chunk_carries_usage() {
        let event = SseEvent::data(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1,"totalTokenCount":4}}"#,
        );
        let chunk = convert_stream_event("id", "gemini-2.0-flash", event).unwrap().unwrap();
        assert_eq!(chunk.delta, "Hi");
        assert_eq!(chunk.usage, Some(Usage::new(3, 1)));
    }
}
