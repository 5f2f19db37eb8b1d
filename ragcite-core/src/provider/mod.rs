//! LLM provider abstraction layer.
//!
//! This module defines a common interface for different LLM backends
//! (Ollama, mistral.rs) used to generate grounded answers.

mod types;
mod utils;
pub mod mistralrs;
pub mod ollama;

use crate::config::LlmConfig;
use std::sync::Arc;

// Re-export common types
pub use types::{ChatRequest, ChatResponse, Message, Provider, ProviderError, Result};

// Re-export provider implementations
pub use mistralrs::MistralRsProvider;
pub use ollama::OllamaProvider;

/// Creates the language-model provider named by `config.provider`.
pub async fn create_provider(config: &LlmConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(config))),
        "mistralrs" => Ok(Arc::new(MistralRsProvider::new(config.model.clone()).await?)),
        other => Err(ProviderError::Other(format!(
            "Unsupported LLM provider: {}. Supported providers: ollama, mistralrs",
            other
        ))),
    }
}
