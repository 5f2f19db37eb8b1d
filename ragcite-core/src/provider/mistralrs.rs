//! mistral.rs provider implementation.
//!
//! This module provides an in-process LLM provider using mistral.rs.
//! Supports both local GGUF files and automatic HuggingFace downloads.

use super::{types::*, utils::is_local_gguf};
use async_trait::async_trait;
use mistralrs::{GgufModelBuilder, IsqType, Model, RequestBuilder, TextMessageRole, TextModelBuilder};
use std::path::Path;

/// mistral.rs in-process provider.
///
/// Automatically detects if model is:
/// 1. A local GGUF file path (loads directly)
/// 2. A HuggingFace model ID (downloads if needed)
///
/// The whole completion is produced before the callback fires, so callers see
/// a single chunk with `done = true`.
pub struct MistralRsProvider {
    model: Model,
    model_name: String,
}

impl MistralRsProvider {
    /// Creates a new mistral.rs provider.
    ///
    /// # Model Resolution
    ///
    /// - If `model_name` ends with `.gguf` and exists, treats it as a local file path
    /// - Otherwise, treats it as a HuggingFace model ID (auto-downloads)
    pub async fn new(model_name: impl Into<String>) -> Result<Self> {
        let model_name = model_name.into();
        let model = Self::build_model(&model_name).await?;

        Ok(Self { model, model_name })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn build_model(model_name: &str) -> Result<Model> {
        let model = if is_local_gguf(model_name) {
            let path = Path::new(model_name);
            let dir = path
                .parent()
                .ok_or_else(|| ProviderError::Other("Invalid GGUF file path".to_string()))?
                .to_str()
                .ok_or_else(|| ProviderError::Other("Invalid UTF-8 in path".to_string()))?;
            let filename = path
                .file_name()
                .ok_or_else(|| ProviderError::Other("Invalid GGUF filename".to_string()))?
                .to_str()
                .ok_or_else(|| ProviderError::Other("Invalid UTF-8 in filename".to_string()))?;

            GgufModelBuilder::new(dir, vec![filename])
                .with_logging()
                .build()
                .await
                .map_err(|e| {
                    ProviderError::Other(format!("Failed to load local GGUF '{}': {:?}", model_name, e))
                })?
        } else {
            TextModelBuilder::new(model_name)
                .with_isq(IsqType::Q4K)
                .with_logging()
                .build()
                .await
                .map_err(|e| {
                    ProviderError::Other(format!(
                        "Failed to load model '{}'. Make sure it exists on HuggingFace or is a valid local .gguf file: {:?}",
                        model_name, e
                    ))
                })?
        };

        Ok(model)
    }
}

fn role_of(message: &Message) -> TextMessageRole {
    match message.role.as_str() {
        "system" => TextMessageRole::System,
        "assistant" => TextMessageRole::Assistant,
        _ => TextMessageRole::User,
    }
}

#[async_trait]
impl Provider for MistralRsProvider {
    async fn chat<'a>(
        &'a self,
        request: ChatRequest,
        mut callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
    ) -> Result<()> {
        let builder = request
            .messages
            .iter()
            .fold(RequestBuilder::new(), |builder, message| {
                builder.add_message(role_of(message), message.content.clone())
            })
            .set_sampler_temperature(request.temperature);

        let response = self
            .model
            .send_chat_request(builder)
            .await
            .map_err(|e| ProviderError::Other(format!("mistral.rs request failed: {:?}", e)))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ProviderError::MalformedResponse("no choices returned".to_string()))?;

        callback(ChatResponse {
            model: self.model_name.clone(),
            content,
            done: true,
        });

        Ok(())
    }
}
