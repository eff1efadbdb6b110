use std::time::Instant;

use crate::database::channel::{Channel, ChannelSettings};
use crate::relay::adaptor::ApiType;
use crate::schema::enum_def::ChannelType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImagesGenerations,
    ImagesEdits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        let mode = match path {
            p if p.ends_with("/chat/completions") => RelayMode::ChatCompletions,
            p if p.ends_with("/completions") => RelayMode::Completions,
            p if p.ends_with("/embeddings") => RelayMode::Embeddings,
            p if p.ends_with("/moderations") => RelayMode::Moderations,
            p if p.ends_with("/images/generations") => RelayMode::ImagesGenerations,
            p if p.ends_with("/images/edits") => RelayMode::ImagesEdits,
            p if p.ends_with("/audio/speech") => RelayMode::AudioSpeech,
            p if p.ends_with("/audio/transcriptions") => RelayMode::AudioTranscription,
            p if p.ends_with("/audio/translations") => RelayMode::AudioTranslation,
            _ => return None,
        };
        Some(mode)
    }

    pub fn path(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Moderations => "/v1/moderations",
            RelayMode::ImagesGenerations => "/v1/images/generations",
            RelayMode::ImagesEdits => "/v1/images/edits",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
        }
    }

    /// Bodies of these modes are multipart forms, forwarded as received.
    pub fn is_multipart(&self) -> bool {
        matches!(
            self,
            RelayMode::ImagesEdits | RelayMode::AudioTranscription | RelayMode::AudioTranslation
        )
    }

    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            RelayMode::AudioSpeech | RelayMode::AudioTranscription | RelayMode::AudioTranslation
        )
    }
}

/// Everything one attempt against one channel needs to know.
#[derive(Debug, Clone)]
pub struct RelayMeta {
    pub mode: RelayMode,
    pub request_id: String,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub api_type: ApiType,
    pub base_url: String,
    pub api_key: String,
    pub settings: ChannelSettings,
    pub user_id: i64,
    pub token_id: i64,
    pub group: String,
    /// Model name the caller asked for; used for retries, suspension and
    /// billing.
    pub original_model: String,
    /// Model name sent upstream after channel mapping.
    pub actual_model: String,
    pub is_stream: bool,
    pub prompt_tokens: i64,
    pub started_at: Instant,
}

impl RelayMeta {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: RelayMode,
        request_id: &str,
        channel: &Channel,
        user_id: i64,
        token_id: i64,
        group: &str,
        original_model: &str,
        is_stream: bool,
    ) -> Self {
        let base_url = channel
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| default_base_url(channel.channel_type).to_string());
        Self {
            mode,
            request_id: request_id.to_string(),
            channel_id: channel.id,
            channel_type: channel.channel_type,
            api_type: ApiType::from(channel.channel_type),
            base_url,
            api_key: channel.api_key.clone(),
            settings: channel.settings(),
            user_id,
            token_id,
            group: group.to_string(),
            original_model: original_model.to_string(),
            actual_model: channel.map_model(original_model),
            is_stream,
            prompt_tokens: 0,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }
}

pub fn default_base_url(channel_type: ChannelType) -> &'static str {
    match channel_type {
        ChannelType::Openai | ChannelType::OpenaiCompatible => "https://api.openai.com",
        ChannelType::Azure => "",
        ChannelType::Deepseek => "https://api.deepseek.com",
        ChannelType::Moonshot => "https://api.moonshot.cn",
        ChannelType::Groq => "https://api.groq.com/openai",
        ChannelType::Mistral => "https://api.mistral.ai",
        ChannelType::Openrouter => "https://openrouter.ai/api",
        ChannelType::Anthropic => "https://api.anthropic.com",
        ChannelType::Gemini => "https://generativelanguage.googleapis.com",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_from_paths() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions"),
            Some(RelayMode::ChatCompletions)
        );
        assert_eq!(RelayMode::from_path("/v1/completions"), Some(RelayMode::Completions));
        assert_eq!(
            RelayMode::from_path("/v1/audio/translations"),
            Some(RelayMode::AudioTranslation)
        );
        assert_eq!(RelayMode::from_path("/v1/files"), None);
        assert!(RelayMode::ImagesEdits.is_multipart());
    }

    #[test]
    fn meta_maps_model_and_keeps_original() {
        let channel = Channel {
            id: 9,
            channel_type: ChannelType::Deepseek,
            model_mapping: Some(r#"{"gpt-4":"deepseek-chat"}"#.to_string()),
            base_url: Some("https://proxy.local/".to_string()),
            ..Default::default()
        };
        let meta = RelayMeta::new(
            RelayMode::ChatCompletions,
            "rid",
            &channel,
            1,
            2,
            "default",
            "gpt-4",
            false,
        );
        assert_eq!(meta.original_model, "gpt-4");
        assert_eq!(meta.actual_model, "deepseek-chat");
        assert_eq!(meta.base_url, "https://proxy.local");
        assert_eq!(meta.api_type, ApiType::OpenAI);
    }
}
