use cyder_tools::log::warn;
use tiktoken_rs::tokenizer::{self, Tokenizer};
use tiktoken_rs::CoreBPE;

use crate::relay::image::image_size;
use crate::relay::meta::RelayMode;
use crate::relay::model::{ContentPart, GeneralOpenAIRequest, ImageUrl, Message};

const APPROXIMATE_TOKENS_PER_CHAR: f64 = 0.38;
const LOW_DETAIL_IMAGE_TOKENS: i64 = 85;
const IMAGE_TILE_TOKENS: i64 = 170;
const IMAGE_TILE_SIZE: u32 = 512;
/// Charged when an image cannot be measured.
const UNKNOWN_IMAGE_TOKENS: i64 = 255;
/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: i64 = 3;

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    match tokenizer::get_tokenizer(model).unwrap_or(Tokenizer::Cl100kBase) {
        Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

/// Loads the common encoders outside the request path.
pub fn preload_tokenizers() {
    let _ = tiktoken_rs::cl100k_base_singleton();
    let _ = tiktoken_rs::o200k_base_singleton();
}

/// BPE count, regardless of the approximate switch.
pub fn count_text_exact(text: &str, model: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    bpe_for_model(model).encode_with_special_tokens(text).len() as i64
}

pub fn count_text_approximate(text: &str) -> i64 {
    (text.chars().count() as f64 * APPROXIMATE_TOKENS_PER_CHAR).round() as i64
}

/// (per message, per name) framing overhead of a model family.
fn message_overhead(model: &str) -> (i64, i64) {
    if model.starts_with("gpt-3.5-turbo-0301") {
        (4, -1)
    } else {
        (3, 1)
    }
}

pub fn image_tokens_for_size(detail: Option<&str>, width: u32, height: u32) -> i64 {
    if detail == Some("low") {
        return LOW_DETAIL_IMAGE_TOKENS;
    }
    let tiles_w = width.div_ceil(IMAGE_TILE_SIZE) as i64;
    let tiles_h = height.div_ceil(IMAGE_TILE_SIZE) as i64;
    LOW_DETAIL_IMAGE_TOKENS + IMAGE_TILE_TOKENS * tiles_w * tiles_h
}

/// Prompt and completion counting (C4).
#[derive(Clone)]
pub struct TokenMeter {
    approximate: bool,
    image_client: reqwest::Client,
}

impl TokenMeter {
    pub fn new(approximate: bool, image_client: reqwest::Client) -> Self {
        Self {
            approximate,
            image_client,
        }
    }

    pub fn count_text(&self, text: &str, model: &str) -> i64 {
        if self.approximate {
            count_text_approximate(text)
        } else {
            count_text_exact(text, model)
        }
    }

    pub async fn count_image(&self, image: &ImageUrl) -> i64 {
        if image.detail.as_deref() == Some("low") {
            return LOW_DETAIL_IMAGE_TOKENS;
        }
        match image_size(&self.image_client, &image.url).await {
            Ok((width, height)) => image_tokens_for_size(image.detail.as_deref(), width, height),
            Err(e) => {
                warn!("failed to measure image, charging {} tokens: {}", UNKNOWN_IMAGE_TOKENS, e);
                UNKNOWN_IMAGE_TOKENS
            }
        }
    }

    pub async fn count_messages(&self, messages: &[Message], model: &str) -> i64 {
        let (per_message, per_name) = message_overhead(model);
        let mut total = 0;
        for message in messages {
            total += per_message;
            total += self.count_text(&message.role, model);
            if let Some(content) = &message.content {
                for part in content.parts() {
                    total += match &part {
                        ContentPart::Text { text } => self.count_text(text, model),
                        ContentPart::ImageUrl { image_url } => self.count_image(image_url).await,
                        ContentPart::InputAudio { .. } => 0,
                    };
                }
            }
            if let Some(name) = &message.name {
                total += per_name + self.count_text(name, model);
            }
        }
        total + REPLY_PRIMING_TOKENS
    }

    /// Prompt tokens of a request, as charged before the upstream replies.
    /// Image and audio modes are priced on other units and count zero here.
    pub async fn count_prompt(&self, mode: RelayMode, request: &GeneralOpenAIRequest) -> i64 {
        match mode {
            RelayMode::ChatCompletions => self.count_messages(&request.messages, &request.model).await,
            RelayMode::Completions | RelayMode::Embeddings | RelayMode::Moderations => request
                .input_texts()
                .iter()
                .map(|text| self.count_text(text, &request.model))
                .sum(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::model::Content;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn meter(approximate: bool) -> TokenMeter {
        TokenMeter::new(approximate, reqwest::Client::new())
    }

    fn png_data_url(width: u32, height: u32) -> String {
        let mut bytes = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        format!("data:image/png;base64,{}", STANDARD.encode(bytes))
    }

    #[test]
    fn approximate_is_char_based() {
        assert_eq!(count_text_approximate("abcdefghij"), 4);
        assert_eq!(count_text_approximate(""), 0);
        assert_eq!(meter(true).count_text("abcdefghij", "gpt-4"), 4);
    }

    #[test]
    fn exact_uses_model_encoder() {
        assert_eq!(count_text_exact("hello world", "gpt-3.5-turbo"), 2);
        assert_eq!(count_text_exact("hello world", "some-unknown-model"), 2);
    }

    #[tokio::test]
    async fn message_framing_overhead() {
        let meter = meter(false);
        let messages = vec![Message::text("user", "hello world")];
        // 3 per message + "user" + 2 content + 3 priming
        assert_eq!(meter.count_messages(&messages, "gpt-3.5-turbo").await, 9);

        let named = vec![Message {
            name: Some("bob".to_string()),
            ..Message::text("user", "hello world")
        }];
        let plain = meter.count_messages(&messages, "gpt-3.5-turbo").await;
        let with_name = meter.count_messages(&named, "gpt-3.5-turbo").await;
        assert_eq!(with_name - plain, 1 + count_text_exact("bob", "gpt-3.5-turbo"));

        let legacy = meter.count_messages(&messages, "gpt-3.5-turbo-0301").await;
        assert_eq!(legacy, plain + 1);
    }

    #[test]
    fn image_tiles() {
        assert_eq!(image_tokens_for_size(Some("low"), 4096, 4096), 85);
        assert_eq!(image_tokens_for_size(Some("high"), 1024, 768), 85 + 170 * 2 * 2);
        assert_eq!(image_tokens_for_size(None, 512, 512), 255);
    }

    #[tokio::test]
    async fn vision_parts_are_measured() {
        let meter = meter(true);
        let low = ImageUrl {
            url: "https://unreachable.invalid/a.png".to_string(),
            detail: Some("low".to_string()),
        };
        assert_eq!(meter.count_image(&low).await, 85);

        let high = ImageUrl {
            url: png_data_url(1024, 768),
            detail: Some("high".to_string()),
        };
        assert_eq!(meter.count_image(&high).await, 765);

        let broken = ImageUrl {
            url: "data:image/png;base64,AAAA".to_string(),
            detail: None,
        };
        assert_eq!(meter.count_image(&broken).await, 255);

        let message = Message {
            role: "user".to_string(),
            content: Some(Content::Parts(vec![
                ContentPart::Text {
                    text: "abcdefghij".to_string(),
                },
                ContentPart::ImageUrl { image_url: high },
            ])),
            ..Default::default()
        };
        // 3 + round(4 * 0.38) + 4 + 765 + 3
        assert_eq!(meter.count_messages(&[message], "gpt-4o").await, 3 + 2 + 4 + 765 + 3);
    }

    #[tokio::test]
    async fn prompt_by_mode() {
        let meter = meter(true);
        let request = GeneralOpenAIRequest {
            model: "text-embedding-3-small".to_string(),
            input: Some(serde_json::json!(["abcdefghij", "abcdefghij"])),
            ..Default::default()
        };
        assert_eq!(meter.count_prompt(RelayMode::Embeddings, &request).await, 8);
        assert_eq!(meter.count_prompt(RelayMode::ImagesGenerations, &request).await, 0);
    }
}
