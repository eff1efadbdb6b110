use std::collections::HashMap;

use async_trait::async_trait;
use cyder_tools::log::warn;
use reqwest::RequestBuilder;
use serde_json::Value;

use super::{content_type_of, sse_chunks, Adaptor, StreamChunk, UpstreamReply};
use crate::relay::error::RelayError;
use crate::relay::meta::{RelayMeta, RelayMode};
use crate::relay::model::{GeneralOpenAIRequest, Usage};
use crate::relay::pricing::PricingEntry;
use crate::schema::enum_def::ChannelType;
use crate::utils::sse::SseEvent;

const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

const OPENAI_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-3.5-turbo", 0.25, 3.0),
    ("gpt-3.5-turbo-0125", 0.25, 3.0),
    ("gpt-3.5-turbo-instruct", 0.75, 4.0 / 3.0),
    ("gpt-4", 15.0, 2.0),
    ("gpt-4-turbo", 5.0, 3.0),
    ("gpt-4o", 1.25, 4.0),
    ("gpt-4o-mini", 0.075, 4.0),
    ("gpt-4.1", 1.0, 4.0),
    ("gpt-4.1-mini", 0.2, 4.0),
    ("o1", 7.5, 4.0),
    ("o3-mini", 0.55, 4.0),
    ("text-embedding-3-small", 0.01, 1.0),
    ("text-embedding-3-large", 0.065, 1.0),
    ("text-embedding-ada-002", 0.05, 1.0),
    ("text-moderation-latest", 0.1, 1.0),
    ("omni-moderation-latest", 0.1, 1.0),
    ("dall-e-2", 8.0, 1.0),
    ("dall-e-3", 20.0, 1.0),
    ("tts-1", 7.5, 1.0),
    ("tts-1-hd", 15.0, 1.0),
    ("whisper-1", 15.0, 1.0),
];

const DEEPSEEK_PRICING: &[(&str, f64, f64)] = &[
    ("deepseek-chat", 0.135, 4.0),
    ("deepseek-reasoner", 0.275, 4.0),
];

const MOONSHOT_PRICING: &[(&str, f64, f64)] = &[
    ("moonshot-v1-8k", 0.5, 1.0),
    ("moonshot-v1-32k", 1.0, 1.0),
    ("moonshot-v1-128k", 2.5, 1.0),
];

const GROQ_PRICING: &[(&str, f64, f64)] = &[
    ("llama-3.1-8b-instant", 0.025, 1.6),
    ("llama-3.3-70b-versatile", 0.295, 1.34),
    ("gemma2-9b-it", 0.1, 1.0),
];

const MISTRAL_PRICING: &[(&str, f64, f64)] = &[
    ("mistral-small-latest", 0.1, 3.0),
    ("mistral-large-latest", 1.0, 3.0),
    ("codestral-latest", 0.15, 3.0),
    ("mistral-embed", 0.05, 1.0),
];

fn pricing_table(channel_type: ChannelType) -> &'static [(&'static str, f64, f64)] {
    match channel_type {
        ChannelType::Openai | ChannelType::Azure => OPENAI_PRICING,
        ChannelType::Deepseek => DEEPSEEK_PRICING,
        ChannelType::Moonshot => MOONSHOT_PRICING,
        ChannelType::Groq => GROQ_PRICING,
        ChannelType::Mistral => MISTRAL_PRICING,
        // OpenRouter and custom endpoints expose arbitrary catalogues
        ChannelType::Openrouter | ChannelType::OpenaiCompatible => OPENAI_PRICING,
        ChannelType::Anthropic | ChannelType::Gemini => &[],
    }
}

/// Adaptor of every channel speaking the OpenAI wire format.
pub struct OpenAIAdaptor {
    channel_type: ChannelType,
    api_version: String,
}

impl OpenAIAdaptor {
    pub fn new(channel_type: ChannelType) -> Self {
        Self {
            channel_type,
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
        }
    }
}

/// Text and usage of one OpenAI stream chunk; chat chunks carry
/// `delta.content`, legacy completion chunks carry `text`.
fn chunk_parts(value: &Value) -> (String, Option<Usage>) {
    let mut delta = String::new();
    if let Some(choices) = value.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
                delta.push_str(text);
            } else if let Some(text) = choice.get("text").and_then(Value::as_str) {
                delta.push_str(text);
            }
        }
    }
    let usage = value
        .get("usage")
        .filter(|u| u.is_object())
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
    (delta, usage)
}

/// Generated text of a buffered reply, for modes billed on it.
fn response_text(mode: RelayMode, value: &Value) -> String {
    match mode {
        RelayMode::AudioTranscription | RelayMode::AudioTranslation => value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => value
            .get("choices")
            .and_then(Value::as_array)
            .map(|choices| {
                choices
                    .iter()
                    .filter_map(|c| {
                        c.pointer("/message/content")
                            .or_else(|| c.get("text"))
                            .and_then(Value::as_str)
                    })
                    .collect::<String>()
            })
            .unwrap_or_default(),
    }
}

pub(crate) fn relay_openai_event(event: SseEvent) -> Result<Option<StreamChunk>, RelayError> {
    let frame = event.to_bytes();
    match serde_json::from_str::<Value>(&event.data) {
        Ok(value) => {
            if let Some(error) = value.get("error").filter(|e| e.is_object()) {
                return Err(RelayError::from_upstream(
                    reqwest::StatusCode::BAD_GATEWAY,
                    serde_json::json!({ "error": error }).to_string().as_bytes(),
                ));
            }
            let (delta, usage) = chunk_parts(&value);
            Ok(Some(StreamChunk { frame, delta, usage }))
        }
        Err(e) => {
            warn!("forwarding unparsable stream event: {}", e);
            Ok(Some(StreamChunk {
                frame,
                delta: String::new(),
                usage: None,
            }))
        }
    }
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn init(&mut self, meta: &RelayMeta) {
        if let Some(version) = meta.settings.api_version.as_deref().filter(|v| !v.is_empty()) {
            self.api_version = version.to_string();
        }
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError> {
        if meta.base_url.is_empty() {
            return Err(RelayError::invalid_request(format!(
                "channel {} has no base url",
                meta.channel_id
            )));
        }
        if self.channel_type == ChannelType::Azure {
            let deployment = meta.actual_model.replace('.', "");
            let path = meta.mode.path().trim_start_matches("/v1");
            return Ok(format!(
                "{}/openai/deployments/{}{}?api-version={}",
                meta.base_url, deployment, path, self.api_version
            ));
        }
        Ok(format!("{}{}", meta.base_url, meta.mode.path()))
    }

    fn setup_request_headers(&self, meta: &RelayMeta, builder: RequestBuilder) -> RequestBuilder {
        match self.channel_type {
            ChannelType::Azure => builder.header("api-key", &meta.api_key),
            ChannelType::Openrouter => builder.bearer_auth(&meta.api_key).header("X-Title", "one-relay"),
            _ => builder.bearer_auth(&meta.api_key),
        }
    }

    fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &GeneralOpenAIRequest,
    ) -> Result<Value, RelayError> {
        let mut request = request.clone();
        request.model = meta.actual_model.clone();
        serde_json::to_value(&request)
            .map_err(|e| RelayError::internal(format!("failed to encode request: {}", e)))
    }

    fn convert_image_request(
        &self,
        meta: &RelayMeta,
        request: &GeneralOpenAIRequest,
    ) -> Result<Value, RelayError> {
        self.convert_request(meta, request)
    }

    async fn do_response(
        &self,
        meta: &RelayMeta,
        response: reqwest::Response,
    ) -> Result<UpstreamReply, RelayError> {
        if meta.is_stream {
            return Ok(UpstreamReply::Streaming(sse_chunks(response, relay_openai_event)));
        }

        let content_type = content_type_of(&response);
        let body = response.bytes().await?;
        let (usage, text) = match serde_json::from_slice::<Value>(&body) {
            Ok(value) => (
                value
                    .get("usage")
                    .filter(|u| u.is_object())
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok()),
                response_text(meta.mode, &value),
            ),
            // text, srt and vtt transcription formats
            Err(_) if meta.mode.is_multipart() => (None, String::from_utf8_lossy(&body).into_owned()),
            Err(_) => (None, String::new()),
        };
        Ok(UpstreamReply::Buffered {
            body,
            content_type,
            usage,
            text,
        })
    }

    fn model_list(&self) -> Vec<String> {
        match self.channel_type {
            ChannelType::OpenaiCompatible | ChannelType::Openrouter => Vec::new(),
            other => pricing_table(other)
                .iter()
                .map(|(model, _, _)| model.to_string())
                .collect(),
        }
    }

    fn channel_name(&self) -> &'static str {
        match self.channel_type {
            ChannelType::Openai => "openai",
            ChannelType::Azure => "azure",
            ChannelType::OpenaiCompatible => "openai-compatible",
            ChannelType::Deepseek => "deepseek",
            ChannelType::Moonshot => "moonshot",
            ChannelType::Groq => "groq",
            ChannelType::Mistral => "mistral",
            ChannelType::Openrouter => "openrouter",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Gemini => "gemini",
        }
    }

    fn default_pricing(&self) -> HashMap<String, PricingEntry> {
        pricing_table(self.channel_type)
            .iter()
            .map(|(model, ratio, completion)| (model.to_string(), PricingEntry::new(*ratio, *completion)))
            .collect()
    }
}
