//! Ingestion and query pipelines.
//!
//! Ingestion: loader -> chunker -> embedding provider -> vector index.
//! Query: retriever -> answer generator.

use super::chunker::SemanticChunker;
use super::embedder::{check_vectors, EmbeddingProvider};
use super::generator::AnswerGenerator;
use super::loader::{self, LoaderError};
use super::retriever::{RetrievalMethod, Retriever};
use super::store::{MetadataFilter, VectorIndex};
use super::types::{GenerationResult, IndexedRecord, SourceDocument};
use super::{timed, RagError, Result};
use crate::config::LoaderConfig;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Success,
    /// The document produced no chunks.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub source_id: String,
    pub status: DocumentStatus,
    pub chunks_created: usize,
    pub chunks_upserted: usize,
    pub batches: usize,
    pub error: Option<String>,
}

impl DocumentReport {
    fn failed(source_id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            source_id: source_id.into(),
            status: DocumentStatus::Failed,
            chunks_created: 0,
            chunks_upserted: 0,
            batches: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Per-document results of an ingestion run, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub documents: Vec<DocumentReport>,
}

impl IngestReport {
    fn count(&self, status: DocumentStatus) -> usize {
        self.documents.iter().filter(|d| d.status == status).count()
    }

    pub fn successful(&self) -> usize {
        self.count(DocumentStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(DocumentStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(DocumentStatus::Skipped)
    }

    pub fn chunks_upserted(&self) -> usize {
        self.documents.iter().map(|d| d.chunks_upserted).sum()
    }
}

/// A document waiting to be ingested, or the reason it could not be loaded.
enum Pending {
    Loaded(SourceDocument),
    LoadFailed { source_id: String, error: LoaderError },
}

/// Turns documents into indexed chunks.
#[derive(Clone)]
pub struct IngestionPipeline {
    chunker: SemanticChunker,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    concurrency: usize,
    timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(chunker: SemanticChunker, embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            chunker,
            embedder,
            index,
            concurrency: 1,
            timeout: Duration::from_secs(60),
        }
    }

    /// Number of documents processed at once. Results keep input order.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ingests already-loaded documents.
    ///
    /// Per-document failures are recorded in the report. Configuration
    /// errors (such as an index provisioned for another dimension) abort the
    /// whole run before anything is written.
    pub async fn ingest(&self, documents: Vec<SourceDocument>) -> Result<IngestReport> {
        self.run(documents.into_iter().map(Pending::Loaded).collect()).await
    }

    /// Loads and ingests a single file or every matching file in a directory.
    ///
    /// A missing path, or a single explicit file of an unsupported type, is
    /// an error. Files inside a directory that fail to load are reported as
    /// failed documents.
    pub async fn ingest_path(&self, path: &Path, config: &LoaderConfig, recursive: bool) -> Result<IngestReport> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| LoaderError::NotFound(path.to_path_buf()))?;

        let pending = if metadata.is_file() {
            let source_id = loader::source_id_for(path.parent().unwrap_or(Path::new("")), path);
            match loader::load_file(path, source_id.clone(), config).await {
                Ok(doc) => vec![Pending::Loaded(doc)],
                Err(e @ LoaderError::Unsupported { .. }) => return Err(e.into()),
                Err(error) => vec![Pending::LoadFailed { source_id, error }],
            }
        } else {
            let files = loader::collect_files(path, config, recursive).await?;
            if files.is_empty() {
                tracing::warn!(dir = %path.display(), "No supported files found");
            }
            let mut pending = Vec::with_capacity(files.len());
            for file in files {
                let source_id = loader::source_id_for(path, &file);
                pending.push(match loader::load_file(&file, source_id.clone(), config).await {
                    Ok(doc) => Pending::Loaded(doc),
                    Err(error) => Pending::LoadFailed { source_id, error },
                });
            }
            pending
        };

        self.run(pending).await
    }

    async fn run(&self, pending: Vec<Pending>) -> Result<IngestReport> {
        timed(self.timeout, "index provisioning", self.index.ensure_ready(self.embedder.dimension())).await?;

        tracing::info!(documents = pending.len(), concurrency = self.concurrency, "Starting ingestion");
        let documents: Vec<DocumentReport> = stream::iter(pending)
            .map(|item| self.ingest_one(item))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let report = IngestReport { documents };
        tracing::info!(
            successful = report.successful(),
            failed = report.failed(),
            skipped = report.skipped(),
            chunks = report.chunks_upserted(),
            "Ingestion complete"
        );
        Ok(report)
    }

    /// Returns `Err` only for errors that must stop the whole run.
    async fn ingest_one(&self, item: Pending) -> Result<DocumentReport> {
        let document = match item {
            Pending::Loaded(document) => document,
            Pending::LoadFailed { source_id, error } => {
                tracing::warn!(source = %source_id, %error, "Failed to load document");
                return Ok(DocumentReport::failed(source_id, error));
            }
        };

        match self.process(&document).await {
            Ok(report) => Ok(report),
            Err(e @ RagError::Configuration(_)) => Err(e),
            Err(e) => {
                tracing::warn!(source = %document.source_id, error = %e, "Failed to ingest document");
                Ok(DocumentReport::failed(document.source_id, e))
            }
        }
    }

    async fn process(&self, document: &SourceDocument) -> Result<DocumentReport> {
        let chunks = timed(self.timeout, "chunking", self.chunker.chunk(document)).await?;
        if chunks.is_empty() {
            tracing::warn!(source = %document.source_id, "No chunks created");
            return Ok(DocumentReport {
                source_id: document.source_id.clone(),
                status: DocumentStatus::Skipped,
                chunks_created: 0,
                chunks_upserted: 0,
                batches: 0,
                error: None,
            });
        }

        // The document is fully embedded before anything is written.
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = timed(self.timeout, "chunk embedding", self.embedder.embed_documents(&texts)).await?;
        check_vectors(texts.len(), self.embedder.dimension(), &vectors)?;
        let chunks_created = chunks.len();
        let records: Vec<IndexedRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedRecord::new(chunk, vector))
            .collect();

        let upsert = timed(self.timeout, "upsert", self.index.upsert(records)).await?;
        tracing::debug!(
            source = %document.source_id,
            chunks = chunks_created,
            batches = upsert.batches,
            "Document ingested"
        );

        Ok(DocumentReport {
            source_id: document.source_id.clone(),
            status: DocumentStatus::Success,
            chunks_created,
            chunks_upserted: upsert.written,
            batches: upsert.batches,
            error: None,
        })
    }
}

/// Per-query settings.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Overrides the configured `retrieval.top_k`.
    pub top_k: Option<usize>,
    pub use_mmr: bool,
    pub show_sources: bool,
    pub filter: Option<MetadataFilter>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            use_mmr: false,
            show_sources: true,
            filter: None,
        }
    }
}

impl QueryOptions {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_mmr(mut self, use_mmr: bool) -> Self {
        self.use_mmr = use_mmr;
        self
    }

    pub fn with_sources(mut self, show_sources: bool) -> Self {
        self.show_sources = show_sources;
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub question: String,
    pub retrieval_method: RetrievalMethod,
    pub filtered: bool,
    #[serde(flatten)]
    pub result: GenerationResult,
}

/// Answers questions from the index.
#[derive(Clone)]
pub struct QueryPipeline {
    retriever: Retriever,
    generator: AnswerGenerator,
    default_top_k: usize,
}

impl QueryPipeline {
    pub fn new(retriever: Retriever, generator: AnswerGenerator, default_top_k: usize) -> Self {
        Self {
            retriever,
            generator,
            default_top_k,
        }
    }

    pub async fn query(&self, question: &str, options: &QueryOptions) -> Result<QueryResponse> {
        self.query_streaming(question, options, |_| {}).await
    }

    /// Like [`query`](Self::query), forwarding answer text to `on_token` as the model produces it.
    pub async fn query_streaming<F>(&self, question: &str, options: &QueryOptions, on_token: F) -> Result<QueryResponse>
    where
        F: FnMut(&str) + Send,
    {
        if question.trim().is_empty() {
            return Err(RagError::EmptyQuery);
        }

        let top_k = options.top_k.unwrap_or(self.default_top_k);
        let method = if options.use_mmr {
            RetrievalMethod::Mmr
        } else {
            RetrievalMethod::Similarity
        };
        let filter = options.filter.as_ref().filter(|f| !f.is_empty());

        tracing::info!(%method, top_k, filtered = filter.is_some(), "Processing query");
        let matches = self.retriever.retrieve(question, top_k, method, filter).await?;
        tracing::info!(retrieved = matches.len(), "Retrieved chunks");

        let mut result = self.generator.generate_streaming(question, &matches, on_token).await?;
        if !options.show_sources {
            result.citations.clear();
        }

        Ok(QueryResponse {
            question: question.to_string(),
            retrieval_method: method,
            filtered: filter.is_some(),
            result,
        })
    }
}
