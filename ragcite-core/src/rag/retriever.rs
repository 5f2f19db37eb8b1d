//! Query-time retrieval: plain similarity search or MMR diversification.

use super::embedder::{EmbedderError, EmbeddingProvider};
use super::mmr::mmr_select;
use super::store::{MetadataFilter, VectorIndex};
use super::types::ScoredMatch;
use super::{timed, RagError, Result};
use crate::config::RetrievalConfig;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How candidates are selected from the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Similarity,
    Mmr,
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalMethod::Similarity => f.write_str("similarity"),
            RetrievalMethod::Mmr => f.write_str("mmr"),
        }
    }
}

/// Turns a question into a ranked list of chunks.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
    timeout: Duration,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            index,
            config,
            timeout: Duration::from_secs(60),
        }
    }

    /// Bounds every embedding and index call made by this retriever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        method: RetrievalMethod,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredMatch>> {
        match method {
            RetrievalMethod::Similarity => self.similarity(query, top_k, filter).await,
            RetrievalMethod::Mmr => self.diverse(query, top_k, filter).await,
        }
    }

    /// The `top_k` chunks closest to the query, by descending score.
    pub async fn similarity(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredMatch>> {
        let query_vector = self.prepare(query, top_k).await?;
        let matches = timed(self.timeout, "vector search", self.index.query(&query_vector, top_k, filter)).await?;
        tracing::debug!(results = matches.len(), "Similarity retrieval complete");
        Ok(matches)
    }

    /// Up to `top_k` chunks chosen by Maximal Marginal Relevance from a
    /// larger pool of `fetch_k` nearest candidates.
    pub async fn diverse(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredMatch>> {
        let query_vector = self.prepare(query, top_k).await?;
        let fetch_k = self.config.fetch_k_for(top_k);

        let candidates = timed(self.timeout, "vector search", self.index.query(&query_vector, fetch_k, filter)).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let vectors = self.candidate_vectors(&candidates).await?;
        let picks = mmr_select(&query_vector, &vectors, top_k, self.config.mmr_lambda);
        tracing::debug!(
            candidates = candidates.len(),
            selected = picks.len(),
            lambda = self.config.mmr_lambda,
            "MMR retrieval complete"
        );

        let mut pool: Vec<Option<ScoredMatch>> = candidates.into_iter().map(Some).collect();
        Ok(picks.into_iter().filter_map(|i| pool[i].take()).collect())
    }

    /// Validates the request, checks the index is not empty and embeds the query.
    async fn prepare(&self, query: &str, top_k: usize) -> Result<Vec<f32>> {
        if query.trim().is_empty() {
            return Err(RagError::EmptyQuery);
        }
        if top_k == 0 {
            return Err(RagError::Configuration("top_k must be at least 1".into()));
        }

        let count = timed(self.timeout, "index count", self.index.count()).await?;
        if count == 0 {
            return Err(RagError::EmptyIndex);
        }

        timed(self.timeout, "query embedding", self.embedder.embed_query(query)).await
    }

    /// Stored vectors where the backend returned them, fresh embeddings otherwise.
    async fn candidate_vectors(&self, candidates: &[ScoredMatch]) -> Result<Vec<Vec<f32>>> {
        let missing: Vec<String> = candidates
            .iter()
            .filter(|c| c.vector.is_none())
            .map(|c| c.chunk.text.clone())
            .collect();

        let mut embedded = if missing.is_empty() {
            Vec::new().into_iter()
        } else {
            tracing::debug!(count = missing.len(), "Re-embedding candidates without stored vectors");
            timed(self.timeout, "candidate embedding", self.embedder.embed_documents(&missing))
                .await?
                .into_iter()
        };

        candidates
            .iter()
            .map(|c| match &c.vector {
                Some(v) => Ok(v.clone()),
                None => embedded
                    .next()
                    .ok_or_else(|| RagError::Embedding(EmbedderError::NoEmbeddings)),
            })
            .collect()
    }
}
