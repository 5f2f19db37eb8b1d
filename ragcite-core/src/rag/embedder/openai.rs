use super::{check_vectors, resolve_dimension, EmbedderError, EmbeddingProvider, Result};
use crate::config::EmbeddingConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Embeddings from any OpenAI-compatible `/v1/embeddings` endpoint.
///
/// The API key is read once, at construction, from the environment variable
/// named by `embedding.api_key_env`.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    base_url: String,
    model: String,
    api_key: String,
    dimension: usize,
    batch_size: usize,
    http_client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| EmbedderError::MissingCredentials(config.api_key_env.clone()))?;

        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            dimension: resolve_dimension(config)?,
            // `chunks` panics on zero.
            batch_size: config.batch_size.max(1),
            http_client: reqwest::Client::new(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let request = EmbeddingsRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(EmbedderError::Api(format!("{}: {}", status, error_text)));
        }

        let body = response.json::<EmbeddingsResponse>().await?;
        Ok(into_ordered_vectors(body))
    }
}

/// The API may return items out of order; `index` refers to the input position.
fn into_ordered_vectors(mut body: EmbeddingsResponse) -> Vec<Vec<f32>> {
    body.data.sort_by_key(|item| item.index);
    body.data.into_iter().map(|item| item.embedding).collect()
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            tracing::debug!(count = batch.len(), model = %self.model, "Requesting remote embeddings");
            let embeddings = self.embed_batch(batch).await?;
            check_vectors(batch.len(), self.dimension, &embeddings)?;
            vectors.extend(embeddings);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_configuration_error() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "RAGCITE_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = OpenAiEmbedder::new(&config).err().unwrap();
        assert!(matches!(err, EmbedderError::MissingCredentials(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        std::env::set_var("RAGCITE_TEST_OPENAI_BATCH_KEY", "sk-test");
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "RAGCITE_TEST_OPENAI_BATCH_KEY".to_string(),
            batch_size: 0,
            ..EmbeddingConfig::default()
        };
        let embedder = OpenAiEmbedder::new(&config).unwrap();
        assert_eq!(embedder.batch_size, 1);
    }

    #[test]
    fn test_response_reordered_by_index() {
        let body: EmbeddingsResponse = serde_json::from_str(
            r#"{"object":"list","data":[
                {"object":"embedding","index":1,"embedding":[0.0,1.0]},
                {"object":"embedding","index":0,"embedding":[1.0,0.0]}
            ],"model":"m"}"#,
        )
        .unwrap();
        assert_eq!(into_ordered_vectors(body), vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }
}
