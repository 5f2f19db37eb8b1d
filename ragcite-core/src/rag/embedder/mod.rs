//! Embedding generation.
//!
//! This module converts text into fixed-dimension vectors. Every provider
//! reports its dimension up front, and every vector it returns is checked
//! against that dimension before it leaves the provider, so a vector of the
//! wrong shape can never reach a vector index.
//!
//! Providers are selected once, by name, through [`create_embedding_provider`]:
//!
//! | key       | implementation        | dimension source                    |
//! |-----------|-----------------------|-------------------------------------|
//! | `ollama`  | [`OllamaEmbedder`]    | config or model registry            |
//! | `openai`  | [`OpenAiEmbedder`]    | config or model registry            |
//! | `local`   | [`LocalEmbedder`]     | the model's `config.json`           |
//! | `hashing` | [`HashingEmbedder`]   | config (default 256)                |

mod hashing;
mod local;
mod ollama;
mod openai;

pub use hashing::HashingEmbedder;
pub use local::LocalEmbedder;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAiEmbedder;

use crate::config::EmbeddingConfig;
use crate::models::ModelRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during embedding generation.
#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    /// The API response contained no embeddings.
    #[error("No embeddings returned")]
    NoEmbeddings,

    #[error("Expected {expected} embeddings, received {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Embedding has {actual} dimensions, provider declares {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Cannot embed empty text")]
    EmptyInput,

    #[error("Failed to load embedding model: {0}")]
    ModelLoad(String),

    #[error("Embedding inference failed: {0}")]
    Inference(String),

    #[error("Missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("Unknown output dimension for model '{0}'; set embedding.dimension")]
    UnknownDimension(String),

    #[error("Unsupported embedding provider: {0}. Supported providers: ollama, openai, local, hashing")]
    UnsupportedProvider(String),
}

impl EmbedderError {
    /// Errors caused by configuration rather than by the provider at runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EmbedderError::MissingCredentials(_)
                | EmbedderError::UnknownDimension(_)
                | EmbedderError::UnsupportedProvider(_)
        )
    }
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedderError>;

/// Converts text into vectors of a fixed, provider-declared dimension.
///
/// Implementations must be safe for concurrent use; the same provider is
/// shared by the chunker, the ingestion pipeline and every query.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Name of the underlying model, for logs and statistics.
    fn model_name(&self) -> &str;

    /// Length of every vector this provider produces.
    fn dimension(&self) -> usize;

    /// Embeds a batch of texts, returning one vector per input in input order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbedderError::EmptyInput);
        }
        self.embed_documents(&[text.to_string()])
            .await?
            .pop()
            .ok_or(EmbedderError::NoEmbeddings)
    }
}

/// Creates the embedding provider named by `config.provider`.
pub async fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        "openai" => Arc::new(OpenAiEmbedder::new(config)?),
        "local" => Arc::new(LocalEmbedder::load(config).await?),
        "hashing" => Arc::new(HashingEmbedder::new(
            config.dimension.unwrap_or(HashingEmbedder::DEFAULT_DIMENSION),
        )),
        other => return Err(EmbedderError::UnsupportedProvider(other.to_string())),
    };

    tracing::info!(
        provider = %config.provider,
        model = provider.model_name(),
        dimension = provider.dimension(),
        "Embedding provider ready"
    );
    Ok(provider)
}

/// Output dimension of a remote model: explicit configuration wins, then the registry.
pub(crate) fn resolve_dimension(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dimension
        .or_else(|| ModelRegistry::new().dimension_of(&config.model))
        .ok_or_else(|| EmbedderError::UnknownDimension(config.model.clone()))
}

/// Checks a provider response: one vector per input, each of the declared length.
pub(crate) fn check_vectors(expected_count: usize, dimension: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected_count {
        return Err(EmbedderError::CountMismatch {
            expected: expected_count,
            actual: vectors.len(),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(EmbedderError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_dimension_prefers_config() {
        let config = EmbeddingConfig {
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: Some(512),
            ..EmbeddingConfig::default()
        };
        assert_eq!(resolve_dimension(&config).unwrap(), 512);
    }

    #[test]
    fn test_resolve_dimension_from_registry() {
        let config = EmbeddingConfig {
            model: "all-MiniLM-L6-v2".to_string(),
            ..EmbeddingConfig::default()
        };
        assert_eq!(resolve_dimension(&config).unwrap(), 384);
    }

    #[test]
    fn test_unknown_model_has_no_default_dimension() {
        let config = EmbeddingConfig {
            model: "my-private-model".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = resolve_dimension(&config).unwrap_err();
        assert!(matches!(err, EmbedderError::UnknownDimension(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_check_vectors() {
        assert!(check_vectors(2, 3, &[vec![0.0; 3], vec![1.0; 3]]).is_ok());
        assert!(matches!(
            check_vectors(2, 3, &[vec![0.0; 3]]),
            Err(EmbedderError::CountMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            check_vectors(1, 3, &[vec![0.0; 4]]),
            Err(EmbedderError::DimensionMismatch { expected: 3, actual: 4 })
        ));
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = create_embedding_provider(&config).await.err().unwrap();
        assert!(matches!(err, EmbedderError::UnsupportedProvider(_)));
    }

    #[tokio::test]
    async fn test_factory_builds_hashing_provider() {
        let config = EmbeddingConfig {
            provider: "hashing".to_string(),
            dimension: Some(32),
            ..EmbeddingConfig::default()
        };
        let provider = create_embedding_provider(&config).await.unwrap();
        assert_eq!(provider.dimension(), 32);
        assert_eq!(provider.embed_query("hello").await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_embed_query_rejects_blank_text() {
        let provider = HashingEmbedder::new(8);
        assert!(matches!(provider.embed_query("   ").await, Err(EmbedderError::EmptyInput)));
    }
}
