//! Inference collaborator.
//!
//! Converts unstructured input into structured output against a declared
//! schema. Two implementations:
//! - **RigInference**: Anthropic via rig-core
//! - **HeuristicInference**: offline rule-based parser (no API key, tests)

pub mod heuristic;
pub mod rig_adapter;
pub mod schema;

pub use heuristic::HeuristicInference;
pub use rig_adapter::RigInference;
pub use schema::{
    InsightRecommendation, OutputSchema, ParsedExercise, ParsedSet, ParsedWorkout, PhotoMetrics,
};

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;

use crate::config::InferenceConfig;
use crate::error::InferenceError;

/// Input handed to an inference call.
#[derive(Debug, Clone)]
pub enum InferenceInput {
    Text(String),
    Image { bytes: Vec<u8>, media_type: String },
    /// Structured context, sent as pretty-printed JSON.
    Context(serde_json::Value),
}

/// Black-box structured inference.
#[async_trait]
pub trait Inference: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &str;

    /// Produce a JSON value conforming to `schema`.
    ///
    /// Implementations must report retryable conditions (rate limits,
    /// timeouts, 5xx) as [`InferenceError::Transient`] and everything else as
    /// [`InferenceError::Permanent`].
    async fn infer(
        &self,
        schema: OutputSchema,
        input: InferenceInput,
    ) -> Result<serde_json::Value, InferenceError>;
}

/// Call `inference` and deserialize into the typed output.
///
/// An output that doesn't match the schema will not match on retry either, so
/// it is reported as permanent.
pub async fn infer_typed<T: DeserializeOwned>(
    inference: &dyn Inference,
    schema: OutputSchema,
    input: InferenceInput,
) -> Result<T, InferenceError> {
    let value = inference.infer(schema, input).await?;
    serde_json::from_value(value).map_err(|e| {
        InferenceError::permanent(
            inference.name(),
            format!("output does not match {} schema: {e}", schema.name()),
        )
    })
}

/// Create the configured inference provider.
pub fn create_inference(config: &InferenceConfig) -> Result<Arc<dyn Inference>, InferenceError> {
    match &config.api_key {
        Some(api_key) => create_anthropic_inference(config, api_key),
        None => {
            tracing::warn!("ANTHROPIC_API_KEY not set, using offline heuristic inference");
            Ok(Arc::new(HeuristicInference::new()))
        }
    }
}

fn create_anthropic_inference(
    config: &InferenceConfig,
    api_key: &SecretString,
) -> Result<Arc<dyn Inference>, InferenceError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key.expose_secret()).map_err(|e| {
            InferenceError::permanent(
                "anthropic",
                format!("Failed to create Anthropic client: {e}"),
            )
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic inference (model: {})", config.model);
    Ok(Arc::new(RigInference::new(
        model,
        "anthropic",
        &config.model,
        config.timeout,
        config.max_tokens,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(serde_json::Value);

    #[async_trait]
    impl Inference for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn infer(
            &self,
            _schema: OutputSchema,
            _input: InferenceInput,
        ) -> Result<serde_json::Value, InferenceError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn schema_mismatch_is_permanent() {
        let provider = Fixed(serde_json::json!({"nope": true}));
        let err = infer_typed::<ParsedWorkout>(
            &provider,
            OutputSchema::Workout,
            InferenceInput::Text("x".into()),
        )
        .await
        .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn typed_output() {
        let provider = Fixed(serde_json::json!({
            "summary": "Solid week",
            "recommendation": "Add a deload",
        }));
        let out: InsightRecommendation = infer_typed(
            &provider,
            OutputSchema::Insight,
            InferenceInput::Context(serde_json::json!({})),
        )
        .await
        .unwrap();
        assert_eq!(out.recommendation, "Add a deload");
        assert!(out.focus_areas.is_empty());
    }

    #[test]
    fn no_key_uses_heuristic() {
        let provider = create_inference(&InferenceConfig::default()).unwrap();
        assert_eq!(provider.name(), "heuristic");
    }

    #[test]
    fn key_selects_anthropic() {
        // rig clients accept any key at construction; auth fails on first call.
        let config = InferenceConfig {
            api_key: Some(SecretString::from("sk-test")),
            ..InferenceConfig::default()
        };
        let provider = create_inference(&config).unwrap();
        assert_eq!(provider.name(), "anthropic");
    }
}
