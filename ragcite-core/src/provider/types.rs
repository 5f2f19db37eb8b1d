//! Common types for LLM providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when interacting with a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Provider error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Provider trait for LLM backends.
///
/// Implementations provide chat completions through different backends
/// (Ollama, mistral.rs, etc.).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stream a chat completion.
    ///
    /// The callback is invoked for each chunk of the response.
    async fn chat<'a>(
        &'a self,
        request: ChatRequest,
        callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
    ) -> Result<()>;

    /// Runs a chat completion to the end and returns the concatenated text.
    ///
    /// A stream that finishes without producing any content is reported as a
    /// malformed response rather than an empty answer.
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let mut answer = String::new();
        let mut finished = false;
        self.chat(
            request,
            Box::new(|chunk: ChatResponse| {
                answer.push_str(&chunk.content);
                finished |= chunk.done;
            }),
        )
        .await?;

        if answer.trim().is_empty() {
            return Err(ProviderError::MalformedResponse(
                "model returned no content".to_string(),
            ));
        }
        if !finished {
            tracing::warn!("Model stream ended without a completion marker");
        }
        Ok(answer)
    }
}

/// Request for chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Response from chat completion (streaming chunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub content: String,
    pub done: bool,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Vec<&'static str>);

    #[async_trait]
    impl Provider for Scripted {
        async fn chat<'a>(
            &'a self,
            request: ChatRequest,
            mut callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
        ) -> Result<()> {
            let last = self.0.len().saturating_sub(1);
            for (i, piece) in self.0.iter().enumerate() {
                callback(ChatResponse {
                    model: request.model.clone(),
                    content: piece.to_string(),
                    done: i == last,
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_complete_concatenates_stream() {
        let provider = Scripted(vec!["Cats ", "are ", "mammals."]);
        let answer = provider
            .complete(ChatRequest::new("m", vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(answer, "Cats are mammals.");
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_stream() {
        let provider = Scripted(vec![]);
        let result = provider
            .complete(ChatRequest::new("m", vec![Message::user("hi")]))
            .await;
        assert!(matches!(result, Err(ProviderError::MalformedResponse(_))));
    }
}
