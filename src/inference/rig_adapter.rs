//! Bridges a rig-core `CompletionModel` to the [`Inference`] trait.
//!
//! rig owns the HTTP transport and wire format; this adapter builds the
//! prompt for an [`OutputSchema`], pulls the JSON object out of the reply and
//! sorts failures into transient and permanent.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rig::OneOrMany;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};
use rig::message::{ImageMediaType, UserContent};

use super::{Inference, InferenceInput, OutputSchema};
use crate::error::InferenceError;

/// Structured inference through any rig completion model.
pub struct RigInference<M: CompletionModel> {
    model: M,
    provider: String,
    model_name: String,
    timeout: Duration,
    max_tokens: u64,
}

impl<M: CompletionModel> RigInference<M> {
    pub fn new(
        model: M,
        provider: &str,
        model_name: &str,
        timeout: Duration,
        max_tokens: u32,
    ) -> Self {
        Self {
            model,
            provider: provider.to_string(),
            model_name: model_name.to_string(),
            timeout,
            max_tokens: u64::from(max_tokens),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

fn preamble(schema: OutputSchema) -> String {
    format!(
        "{}\n\nRespond with a single JSON object and nothing else. \
         It must validate against this JSON schema:\n{}",
        schema.instructions(),
        schema.json_schema()
    )
}

fn media_type(mime: &str) -> Option<ImageMediaType> {
    match mime {
        "image/jpeg" | "image/jpg" => Some(ImageMediaType::JPEG),
        "image/png" => Some(ImageMediaType::PNG),
        "image/gif" => Some(ImageMediaType::GIF),
        "image/webp" => Some(ImageMediaType::WEBP),
        _ => None,
    }
}

/// The user turn for one inference call.
fn user_message(provider: &str, input: InferenceInput) -> Result<Message, InferenceError> {
    match input {
        InferenceInput::Text(text) => Ok(Message::user(text)),
        InferenceInput::Context(value) => {
            let text = serde_json::to_string_pretty(&value).map_err(|e| {
                InferenceError::permanent(provider, format!("context not serializable: {e}"))
            })?;
            Ok(Message::user(text))
        }
        InferenceInput::Image { bytes, media_type: mime } => {
            let kind = media_type(&mime).ok_or_else(|| {
                InferenceError::permanent(provider, format!("unsupported image type {mime}"))
            })?;
            let content = OneOrMany::many(vec![
                UserContent::image_base64(BASE64.encode(&bytes), Some(kind), None),
                UserContent::text("Analyze this progress photo."),
            ])
            .map_err(|e| InferenceError::permanent(provider, e.to_string()))?;
            Ok(Message::User { content })
        }
    }
}

/// Sort a rig failure into the retryable/permanent split.
///
/// rig folds the provider's HTTP status into the error text, so rate limits,
/// overload and 5xx are recognized from it.
fn classify(provider: &str, e: CompletionError) -> InferenceError {
    let reason = e.to_string();
    match e {
        CompletionError::HttpError(_) => InferenceError::transient(provider, reason),
        CompletionError::ProviderError(_) if is_transient_text(&reason) => {
            InferenceError::transient(provider, reason)
        }
        _ => InferenceError::permanent(provider, reason),
    }
}

fn is_transient_text(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    [
        "rate_limit",
        "rate limit",
        "overloaded",
        "timeout",
        "timed out",
        "api_error",
        "internal server error",
        "service unavailable",
        "bad gateway",
        "429",
        "500",
        "502",
        "503",
        "504",
        "529",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

/// Pull the JSON object out of the assistant's text.
fn extract_json(provider: &str, text: &str) -> Result<serde_json::Value, InferenceError> {
    let trimmed = strip_code_fence(text.trim());
    if trimmed.is_empty() {
        return Err(InferenceError::permanent(provider, "empty response"));
    }
    serde_json::from_str(trimmed)
        .map_err(|e| InferenceError::permanent(provider, format!("response is not JSON: {e}")))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[async_trait]
impl<M> Inference for RigInference<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.provider
    }

    async fn infer(
        &self,
        schema: OutputSchema,
        input: InferenceInput,
    ) -> Result<serde_json::Value, InferenceError> {
        let message = user_message(&self.provider, input)?;
        let request = self
            .model
            .completion_request(message)
            .preamble(preamble(schema))
            .temperature(0.0)
            .max_tokens(self.max_tokens);

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                InferenceError::transient(
                    &self.provider,
                    format!("no response within {:?}", self.timeout),
                )
            })?
            .map_err(|e| classify(&self.provider, e))?;

        let text: String = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        tracing::debug!(
            provider = %self.provider,
            model = %self.model_name,
            schema = schema.name(),
            "Inference call completed"
        );

        extract_json(&self.provider, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_split_on_retryability() {
        let overloaded = CompletionError::ProviderError(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#
                .to_string(),
        );
        assert!(classify("anthropic", overloaded).is_transient());

        let rate_limited = CompletionError::ProviderError("rate_limit_error".to_string());
        assert!(classify("anthropic", rate_limited).is_transient());

        let invalid = CompletionError::ProviderError(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad image"}}"#
                .to_string(),
        );
        assert!(!classify("anthropic", invalid).is_transient());
    }

    #[test]
    fn unusable_response_is_permanent() {
        let e = CompletionError::ResponseError("no content".to_string());
        assert!(!classify("anthropic", e).is_transient());
    }

    #[test]
    fn extracts_fenced_json() {
        let value = extract_json("anthropic", "```json\n{\"exercises\": []}\n```").unwrap();
        assert_eq!(value["exercises"], serde_json::json!([]));
    }

    #[test]
    fn prose_is_permanent() {
        let err = extract_json("anthropic", "I think you did bench press.").unwrap_err();
        assert!(!err.is_transient());
        assert!(!extract_json("anthropic", "  ").unwrap_err().is_transient());
    }

    #[test]
    fn image_turn_carries_photo_and_instruction() {
        let message = user_message(
            "anthropic",
            InferenceInput::Image {
                bytes: vec![1, 2, 3],
                media_type: "image/png".to_string(),
            },
        )
        .unwrap();
        let Message::User { content } = message else {
            panic!("expected a user turn");
        };
        assert_eq!(content.len(), 2);
    }

    #[test]
    fn unknown_image_type_is_permanent() {
        let err = user_message(
            "anthropic",
            InferenceInput::Image {
                bytes: vec![0],
                media_type: "image/tiff".to_string(),
            },
        )
        .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn preamble_embeds_schema() {
        let text = preamble(OutputSchema::Workout);
        assert!(text.contains("\"exercises\""));
    }
}
