use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::RequestBuilder;
use serde_json::Value;

use crate::relay::error::RelayError;
use crate::relay::meta::{RelayMeta, RelayMode};
use crate::relay::model::{GeneralOpenAIRequest, Usage};
use crate::relay::pricing::{PricingEntry, DEFAULT_MODEL_RATIO};
use crate::schema::enum_def::ChannelType;
use crate::utils::sse::{SseEvent, SseParser};

pub mod anthropic;
pub mod gemini;
pub mod openai;

/// Wire family of a channel type. Adaptors of one family share request and
/// response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    OpenAI,
    Anthropic,
    Gemini,
}

impl From<ChannelType> for ApiType {
    fn from(channel_type: ChannelType) -> Self {
        match channel_type {
            ChannelType::Anthropic => ApiType::Anthropic,
            ChannelType::Gemini => ApiType::Gemini,
            ChannelType::Openai
            | ChannelType::Azure
            | ChannelType::OpenaiCompatible
            | ChannelType::Deepseek
            | ChannelType::Moonshot
            | ChannelType::Groq
            | ChannelType::Mistral
            | ChannelType::Openrouter => ApiType::OpenAI,
        }
    }
}

pub enum UpstreamBody {
    Json(Value),
    /// Multipart forms are forwarded untouched with their boundary.
    Multipart { content_type: String, bytes: Bytes },
}

/// One event relayed to the client, already in OpenAI chunk form.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub frame: Bytes,
    /// Completion text carried by the chunk.
    pub delta: String,
    pub usage: Option<Usage>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, RelayError>> + Send>>;

pub enum UpstreamReply {
    Buffered {
        body: Bytes,
        content_type: String,
        usage: Option<Usage>,
        /// Generated text, for modes billed on output text.
        text: String,
    },
    Streaming(ChunkStream),
}

/// Provider contract (C6). An adaptor instance serves exactly one attempt.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Latches per-request settings such as region or API version.
    fn init(&mut self, _meta: &RelayMeta) {}

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError>;

    fn setup_request_headers(&self, meta: &RelayMeta, builder: RequestBuilder) -> RequestBuilder;

    fn convert_request(
        &self,
        meta: &RelayMeta,
        request: &GeneralOpenAIRequest,
    ) -> Result<Value, RelayError>;

    fn convert_image_request(
        &self,
        _meta: &RelayMeta,
        _request: &GeneralOpenAIRequest,
    ) -> Result<Value, RelayError> {
        Err(RelayError::not_implemented(format!(
            "image generation is not supported by {}",
            self.channel_name()
        )))
    }

    async fn do_request(
        &self,
        client: &reqwest::Client,
        meta: &RelayMeta,
        body: UpstreamBody,
    ) -> Result<reqwest::Response, RelayError> {
        let url = self.request_url(meta)?;
        let builder = self.setup_request_headers(meta, client.post(url));
        let builder = match body {
            UpstreamBody::Json(value) => builder.json(&value),
            UpstreamBody::Multipart {
                content_type,
                bytes,
            } => builder.header(CONTENT_TYPE, content_type).body(bytes),
        };
        Ok(builder.send().await?)
    }

    /// Turns a successful upstream reply into an OpenAI shaped one.
    async fn do_response(
        &self,
        meta: &RelayMeta,
        response: reqwest::Response,
    ) -> Result<UpstreamReply, RelayError>;

    fn model_list(&self) -> Vec<String>;

    fn channel_name(&self) -> &'static str;

    fn default_pricing(&self) -> HashMap<String, PricingEntry> {
        HashMap::new()
    }

    fn model_ratio(&self, model: &str) -> f64 {
        self.default_pricing()
            .get(model)
            .map(|entry| entry.ratio)
            .unwrap_or(DEFAULT_MODEL_RATIO)
    }

    fn completion_ratio(&self, model: &str) -> f64 {
        self.default_pricing()
            .get(model)
            .map(|entry| entry.completion_ratio)
            .unwrap_or(1.0)
    }
}

type AdaptorConstructor = fn(ChannelType) -> Box<dyn Adaptor>;

fn openai_adaptor(channel_type: ChannelType) -> Box<dyn Adaptor> {
    Box::new(openai::OpenAIAdaptor::new(channel_type))
}

fn anthropic_adaptor(_: ChannelType) -> Box<dyn Adaptor> {
    Box::new(anthropic::AnthropicAdaptor::default())
}

fn gemini_adaptor(_: ChannelType) -> Box<dyn Adaptor> {
    Box::new(gemini::GeminiAdaptor::default())
}

/// channel type → adaptor constructor.
pub struct AdaptorRegistry {
    constructors: HashMap<ChannelType, AdaptorConstructor>,
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        let mut constructors: HashMap<ChannelType, AdaptorConstructor> = HashMap::new();
        for channel_type in <ChannelType as strum::IntoEnumIterator>::iter() {
            let constructor: AdaptorConstructor = match ApiType::from(channel_type) {
                ApiType::OpenAI => openai_adaptor,
                ApiType::Anthropic => anthropic_adaptor,
                ApiType::Gemini => gemini_adaptor,
            };
            constructors.insert(channel_type, constructor);
        }
        Self { constructors }
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Box<dyn Adaptor>> {
        self.constructors
            .get(&channel_type)
            .map(|constructor| constructor(channel_type))
    }

    /// Every model any adaptor lists, with the owning channel name.
    pub fn all_models(&self) -> Vec<(String, &'static str)> {
        let mut seen = std::collections::HashSet::new();
        let mut models = Vec::new();
        for channel_type in <ChannelType as strum::IntoEnumIterator>::iter() {
            if let Some(adaptor) = self.get(channel_type) {
                for model in adaptor.model_list() {
                    if seen.insert(model.clone()) {
                        models.push((model, adaptor.channel_name()));
                    }
                }
            }
        }
        models
    }
}

/// Shared JSON relay: convert, then hand the mode to the adaptor's body
/// builders. Multipart modes never come through here.
pub fn build_json_body(
    adaptor: &dyn Adaptor,
    meta: &RelayMeta,
    request: &GeneralOpenAIRequest,
) -> Result<Value, RelayError> {
    match meta.mode {
        RelayMode::ImagesGenerations => adaptor.convert_image_request(meta, request),
        _ => adaptor.convert_request(meta, request),
    }
}

/// Feeds the SSE events of an upstream body through `convert`. A body that
/// ends without a terminal event just ends the stream.
pub fn sse_chunks<F>(response: reqwest::Response, mut convert: F) -> ChunkStream
where
    F: FnMut(SseEvent) -> Result<Option<StreamChunk>, RelayError> + Send + 'static,
{
    let mut body = Box::pin(response.bytes_stream());
    let stream = async_stream::stream! {
        let mut parser = SseParser::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(RelayError::unreachable(format!("upstream stream broke: {}", e)));
                    return;
                }
            };
            for event in parser.push(&chunk) {
                if event.is_done() {
                    return;
                }
                match convert(event) {
                    Ok(Some(out)) => yield Ok(out),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
        if let Some(event) = parser.finish() {
            if !event.is_done() {
                match convert(event) {
                    Ok(Some(out)) => yield Ok(out),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        }
    };
    Box::pin(stream)
}

pub(crate) fn content_type_of(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_type_coalesces_openai_family() {
        assert_eq!(ApiType::from(ChannelType::Groq), ApiType::OpenAI);
        assert_eq!(ApiType::from(ChannelType::Azure), ApiType::OpenAI);
        assert_eq!(ApiType::from(ChannelType::Anthropic), ApiType::Anthropic);
        assert_eq!(ApiType::from(ChannelType::Gemini), ApiType::Gemini);
    }

    #[test]
    fn registry_covers_every_channel_type() {
        let registry = AdaptorRegistry::new();
        for channel_type in <ChannelType as strum::IntoEnumIterator>::iter() {
            assert!(registry.get(channel_type).is_some(), "{:?}", channel_type);
        }
        assert_eq!(registry.get(ChannelType::Deepseek).unwrap().channel_name(), "deepseek");
        assert!(registry
            .all_models()
            .iter()
            .any(|(model, owner)| model == "claude-3-5-sonnet-20241022" && *owner == "anthropic"));
    }

    #[test]
    fn unpriced_model_uses_default_ratio() {
        let adaptor = AdaptorRegistry::new().get(ChannelType::OpenaiCompatible).unwrap();
        assert_eq!(adaptor.model_ratio("my-private-model"), DEFAULT_MODEL_RATIO);
        assert_eq!(adaptor.completion_ratio("my-private-model"), 1.0);
        assert_eq!(adaptor.model_ratio("gpt-3.5-turbo"), 0.25);
    }
}
