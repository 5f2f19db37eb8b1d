//! Retrieval Augmented Generation (RAG) with source citations.
//!
//! # Architecture
//!
//! - [`loader`]: reads text files into [`SourceDocument`]s
//! - [`chunker`]: splits documents at semantic boundaries
//! - [`embedder`]: converts text to vectors (Ollama, OpenAI, local BERT, hashing)
//! - [`store`]: vector index contract, with in-memory, LanceDB and Qdrant backends
//! - [`retriever`]: similarity search and MMR diversification
//! - [`generator`]: grounded answers with deduplicated citations
//! - [`pipeline`]: ingestion and query pipelines wiring the above together
//!
//! [`RagEngine`] builds every component from a [`Config`] and is the entry
//! point used by the CLI.
//!
//! # How It Works
//!
//! 1. **Ingestion**:
//!    - Files are loaded and split where the topic shifts between sentences
//!    - Each chunk is embedded and upserted under a stable `source#position` id
//!
//! 2. **Query**:
//!    - The question is embedded and the nearest chunks are retrieved
//!    - The chunks are rendered as numbered, citation-tagged context
//!    - The LLM answers from that context and the cited sources are returned

pub mod chunker;
pub mod embedder;
pub mod generator;
mod lancedb_store;
pub mod loader;
mod memory_store;
pub mod mmr;
pub mod pipeline;
mod qdrant_store;
pub mod retriever;
pub mod similarity;
pub mod store;
mod types;

pub use chunker::SemanticChunker;
pub use embedder::{create_embedding_provider, EmbedderError, EmbeddingProvider};
pub use generator::{AnswerGenerator, INSUFFICIENT_CONTEXT_ANSWER, NO_CONTEXT_ANSWER};
pub use lancedb_store::LanceDbIndex;
pub use loader::LoaderError;
pub use memory_store::MemoryIndex;
pub use pipeline::{
    DocumentReport, DocumentStatus, IngestReport, IngestionPipeline, QueryOptions, QueryPipeline, QueryResponse,
};
pub use qdrant_store::QdrantIndex;
pub use retriever::{RetrievalMethod, Retriever};
pub use store::{create_vector_index, IndexError, MetadataFilter, UpsertReport, VectorIndex};
pub use types::{
    Chunk, Citation, GenerationResult, IndexedRecord, Metadata, MetadataValue, ScoredMatch, SourceDocument,
};

use crate::config::{Config, ConfigError};
use crate::provider::{create_provider, Provider, ProviderError};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid settings, missing credentials, or an index provisioned for
    /// another embedding dimension.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Embedding failed: {0}")]
    Embedding(#[source] EmbedderError),

    #[error("Answer generation failed: {0}")]
    Generation(#[source] ProviderError),

    #[error("Vector index error: {0}")]
    Index(#[source] IndexError),

    #[error("The index is empty; ingest documents first")]
    EmptyIndex,

    #[error("{operation} timed out after {}s", .after.as_secs_f32())]
    Timeout { operation: &'static str, after: Duration },

    #[error("Failed to load documents: {0}")]
    Loader(#[from] LoaderError),

    #[error("Query must not be empty")]
    EmptyQuery,
}

impl From<EmbedderError> for RagError {
    fn from(err: EmbedderError) -> Self {
        if err.is_configuration() {
            RagError::Configuration(err.to_string())
        } else {
            RagError::Embedding(err)
        }
    }
}

impl From<IndexError> for RagError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DimensionMismatch { .. } => RagError::Configuration(err.to_string()),
            other => RagError::Index(other),
        }
    }
}

impl From<ProviderError> for RagError {
    fn from(err: ProviderError) -> Self {
        RagError::Generation(err)
    }
}

impl From<ConfigError> for RagError {
    fn from(err: ConfigError) -> Self {
        RagError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

/// Awaits `fut` for at most `limit`, converting its error into a [`RagError`].
pub(crate) async fn timed<T, E, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    RagError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(RagError::from),
        Err(_) => {
            tracing::warn!(operation, timeout_secs = limit.as_secs_f32(), "Operation timed out");
            Err(RagError::Timeout { operation, after: limit })
        }
    }
}

/// Snapshot of the index and the embedding model feeding it.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub backend: &'static str,
    pub collection: String,
    pub records: usize,
    /// Dimension the index was provisioned with, if it has been
    pub index_dimension: Option<usize>,
    pub embedding_model: String,
    pub embedding_dimension: usize,
}

/// The main RAG engine orchestrating all components.
///
/// The engine owns the embedding provider and the vector index and builds
/// ingestion and query pipelines over them. The LLM provider is created on
/// first use, so ingestion never loads or contacts the answer model.
///
/// # Thread Safety
///
/// The engine is `Clone`; clones share the provider, index and LLM.
#[derive(Clone)]
pub struct RagEngine {
    config: Config,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    llm: Arc<OnceCell<Arc<dyn Provider>>>,
}

impl RagEngine {
    /// Validates `config` and builds the embedding provider and vector index it names.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use ragcite_core::{Config, RagEngine, rag::QueryOptions};
    /// # async fn example() -> ragcite_core::rag::Result<()> {
    /// let engine = RagEngine::from_config(Config::load_or_default()).await?;
    /// engine.ingest_path(std::path::Path::new("./docs"), true).await?;
    /// let response = engine.query("How do I request vacation?", &QueryOptions::default()).await?;
    /// println!("{}", response.result.answer);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let embedder = create_embedding_provider(&config.embedding).await?;
        let index = create_vector_index(&config.storage).await?;

        tracing::info!(
            backend = index.backend(),
            embedding_model = embedder.model_name(),
            llm = %config.llm.model,
            "RAG engine initialized"
        );

        Ok(Self {
            config,
            embedder,
            index,
            llm: Arc::new(OnceCell::new()),
        })
    }

    /// Assembles an engine from already-built components.
    pub fn from_parts(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn Provider>,
    ) -> Self {
        Self {
            config,
            embedder,
            index,
            llm: Arc::new(OnceCell::new_with(Some(llm))),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn ingestion_pipeline(&self) -> IngestionPipeline {
        let chunker = SemanticChunker::new(self.embedder.clone(), self.config.chunking.clone());
        IngestionPipeline::new(chunker, self.embedder.clone(), self.index.clone())
            .with_concurrency(self.config.ingest_concurrency)
            .with_timeout(self.config.request_timeout())
    }

    pub async fn query_pipeline(&self) -> Result<QueryPipeline> {
        let llm = self
            .llm
            .get_or_try_init(|| async { create_provider(&self.config.llm).await })
            .await?
            .clone();

        let timeout = self.config.request_timeout();
        let retriever =
            Retriever::new(self.embedder.clone(), self.index.clone(), self.config.retrieval.clone()).with_timeout(timeout);
        let generator = AnswerGenerator::new(llm, &self.config.llm).with_timeout(timeout);
        Ok(QueryPipeline::new(retriever, generator, self.config.retrieval.top_k))
    }

    /// Ingests already-loaded documents.
    pub async fn ingest(&self, documents: Vec<SourceDocument>) -> Result<IngestReport> {
        self.ingestion_pipeline().ingest(documents).await
    }

    /// Ingests a file, or the supported files in a directory.
    pub async fn ingest_path(&self, path: &Path, recursive: bool) -> Result<IngestReport> {
        self.ingestion_pipeline()
            .ingest_path(path, &self.config.loader, recursive || self.config.loader.recursive)
            .await
    }

    pub async fn query(&self, question: &str, options: &QueryOptions) -> Result<QueryResponse> {
        self.query_pipeline().await?.query(question, options).await
    }

    pub async fn query_streaming<F>(&self, question: &str, options: &QueryOptions, on_token: F) -> Result<QueryResponse>
    where
        F: FnMut(&str) + Send,
    {
        self.query_pipeline()
            .await?
            .query_streaming(question, options, on_token)
            .await
    }

    /// Deletes every record and the provisioned dimension.
    pub async fn reset(&self) -> Result<()> {
        timed(self.config.request_timeout(), "index reset", self.index.delete_all()).await?;
        tracing::info!(backend = self.index.backend(), "Index reset");
        Ok(())
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let timeout = self.config.request_timeout();
        let records = timed(timeout, "index count", self.index.count()).await?;
        let index_dimension = timed(timeout, "index dimension", self.index.dimension()).await?;

        Ok(IndexStats {
            backend: self.index.backend(),
            collection: self.config.storage.vector_db.collection_name.clone(),
            records,
            index_dimension,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimension: self.embedder.dimension(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_classified() {
        let err: RagError = EmbedderError::MissingCredentials("OPENAI_API_KEY".into()).into();
        assert!(matches!(err, RagError::Configuration(_)));

        let err: RagError = EmbedderError::Api("boom".into()).into();
        assert!(matches!(err, RagError::Embedding(_)));

        let err: RagError = IndexError::DimensionMismatch {
            existing: 384,
            requested: 768,
        }
        .into();
        assert!(matches!(err, RagError::Configuration(_)));

        let err: RagError = IndexError::NotReady.into();
        assert!(matches!(err, RagError::Index(_)));
    }

    #[tokio::test]
    async fn test_timed_reports_operation() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, IndexError>(())
        };
        let err = timed(Duration::from_millis(10), "upsert", slow).await.unwrap_err();
        assert!(matches!(err, RagError::Timeout { operation: "upsert", .. }));
    }

    #[tokio::test]
    async fn test_stats_for_fresh_memory_index() {
        let mut config = Config::default();
        config.embedding.provider = "hashing".into();
        config.embedding.dimension = Some(32);
        config.storage.storage_mode = crate::config::StorageMode::Memory;

        let engine = RagEngine::from_config(config).await.unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.records, 0);
        assert_eq!(stats.index_dimension, None);
        assert_eq!(stats.embedding_dimension, 32);
    }
}
