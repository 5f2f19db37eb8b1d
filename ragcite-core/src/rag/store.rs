//! Vector index abstraction and factory.
//!
//! This module provides a unified interface over the vector database
//! backends. Every backend enforces the same contract:
//!
//! - one dimension per index, fixed by the first `ensure_ready` call and
//!   checked on every later call and on every write;
//! - writes are split into batches, and a failed batch reports how many
//!   records earlier batches already committed;
//! - query results are ordered by descending score, ties in insertion order.

use super::lancedb_store::LanceDbIndex;
use super::memory_store::MemoryIndex;
use super::qdrant_store::QdrantIndex;
use super::types::{Chunk, IndexedRecord, MetadataValue, ScoredMatch};
use crate::config::{StorageConfig, StorageMode};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Filter key addressing a chunk's `source_id` rather than its metadata.
pub const SOURCE_ID_KEY: &str = "source_id";

#[derive(Debug, Error)]
pub enum IndexError {
    /// The index was provisioned for a different embedding dimension.
    #[error("Index dimension is {existing}, but {requested} was requested")]
    DimensionMismatch { existing: usize, requested: usize },

    #[error("Record '{id}' has a {actual}-dimensional vector, index expects {expected}")]
    InvalidVector { id: String, expected: usize, actual: usize },

    #[error("Index has not been provisioned; call ensure_ready first")]
    NotReady,

    #[error("top_k must be at least 1")]
    InvalidTopK,

    /// Batches before `batch_index` were written and stay written.
    #[error("Upsert batch {batch_index} failed after {committed} records were committed: {source}")]
    BatchFailed {
        batch_index: usize,
        committed: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Outcome of a successful upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub written: usize,
    pub batches: usize,
}

/// A conjunction of `key == value` predicates over chunk metadata.
///
/// # Example
///
/// ```no_run
/// # use ragcite_core::rag::MetadataFilter;
/// let filter = MetadataFilter::new()
///     .source("handbook.md")
///     .eq("document_type", "markdown");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: Vec<(String, MetadataValue)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.conditions.push((key.into(), value.into()));
        self
    }

    /// Restricts matches to one source document.
    pub fn source(self, source_id: impl Into<String>) -> Self {
        self.eq(SOURCE_ID_KEY, source_id.into())
    }

    pub fn conditions(&self) -> &[(String, MetadataValue)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.conditions.iter().all(|(key, expected)| {
            if key == SOURCE_ID_KEY {
                matches!(expected, MetadataValue::Text(id) if *id == chunk.source_id)
            } else {
                chunk.metadata.get(key) == Some(expected)
            }
        })
    }
}

/// Unified interface for vector index operations.
///
/// Implementations handle record storage, similarity search and provisioning
/// across the supported backends (in-memory, LanceDB for embedded, Qdrant for gRPC).
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Provisions the index for vectors of `dimension`. Idempotent; fails
    /// with [`IndexError::DimensionMismatch`] and changes nothing when the
    /// index already exists with another dimension.
    async fn ensure_ready(&self, dimension: usize) -> Result<()>;

    /// Inserts or overwrites records by id, in batches.
    async fn upsert(&self, records: Vec<IndexedRecord>) -> Result<UpsertReport>;

    /// Searches for the records most similar to `vector`.
    ///
    /// # Returns
    ///
    /// At most `top_k` matches, sorted by descending similarity score.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredMatch>>;

    /// Removes every record and the provisioned dimension.
    async fn delete_all(&self) -> Result<()>;

    /// Returns the number of records in the index; 0 when not provisioned.
    async fn count(&self) -> Result<usize>;

    /// Returns the provisioned dimension, if any.
    async fn dimension(&self) -> Result<Option<usize>>;

    /// Short backend name for statistics output.
    fn backend(&self) -> &'static str;
}

/// Creates a vector index based on the storage mode.
///
/// - `Memory` keeps records in process; nothing survives a restart
/// - `Embedded` uses LanceDB for zero-setup, on-disk storage
/// - `Grpc` uses Qdrant for remote server connectivity
///
/// Provisioning happens later, in [`VectorIndex::ensure_ready`], once the
/// embedding dimension is known.
pub async fn create_vector_index(config: &StorageConfig) -> Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match &config.storage_mode {
        StorageMode::Memory => Arc::new(MemoryIndex::new(config.upsert_batch_size)),
        StorageMode::Embedded { path } => Arc::new(LanceDbIndex::new(config, path).await?),
        StorageMode::Grpc { url } => Arc::new(QdrantIndex::new(config, url)?),
    };
    tracing::debug!(backend = index.backend(), "Vector index created");
    Ok(index)
}

/// Rejects the whole write if any vector has the wrong length.
pub(crate) fn check_record_dimensions(records: &[IndexedRecord], expected: usize) -> Result<()> {
    match records.iter().find(|r| r.vector.len() != expected) {
        Some(bad) => Err(IndexError::InvalidVector {
            id: bad.id.clone(),
            expected,
            actual: bad.vector.len(),
        }),
        None => Ok(()),
    }
}

/// Feeds `records` to `write` in batches of `batch_size`, stopping at the first failure.
pub(crate) async fn write_batches<F, Fut>(
    records: Vec<IndexedRecord>,
    batch_size: usize,
    mut write: F,
) -> Result<UpsertReport>
where
    F: FnMut(Vec<IndexedRecord>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut report = UpsertReport::default();
    let mut remaining = records.into_iter().peekable();

    while remaining.peek().is_some() {
        let batch: Vec<IndexedRecord> = remaining.by_ref().take(batch_size.max(1)).collect();
        let len = batch.len();

        write(batch).await.map_err(|source| IndexError::BatchFailed {
            batch_index: report.batches,
            committed: report.written,
            source,
        })?;

        report.written += len;
        report.batches += 1;
        tracing::debug!(batch = report.batches, records = len, "Upsert batch committed");
    }

    Ok(report)
}

/// Orders matches by descending score; the sort is stable, so ties keep backend order.
pub(crate) fn rank(matches: &mut [ScoredMatch]) {
    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
}
