//! Qdrant vector database storage implementation.
//!
//! This module provides integration with Qdrant, a high-performance vector database
//! that offers automatic deduplication, persistence, and scalability.

use super::store::{
    check_record_dimensions, rank, write_batches, IndexError, MetadataFilter, Result, UpsertReport, VectorIndex,
    SOURCE_ID_KEY,
};
use super::types::{Chunk, IndexedRecord, MetadataValue, ScoredMatch};
use crate::config::StorageConfig;
use anyhow::Context;
use async_trait::async_trait;
use qdrant_client::{
    qdrant::{
        vectors_config::Config, Condition, CreateCollectionBuilder, Distance, Filter, Payload, PointStruct, Range,
        SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder, VectorsConfig,
    },
    Qdrant,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Payload field holding the serialized chunk.
const CHUNK_FIELD: &str = "chunk";
/// Payload object holding chunk metadata, addressable as `metadata.<key>` in filters.
const METADATA_FIELD: &str = "metadata";

/// Qdrant-based vector index.
///
/// Provides persistent, scalable vector storage with automatic deduplication
/// through Qdrant's upsert mechanism. When a record with an existing ID is
/// written, it replaces the old version.
///
/// Search results do not carry stored vectors.
#[derive(Clone)]
pub struct QdrantIndex {
    client: Arc<Qdrant>,
    collection_name: String,
    batch_size: usize,
}

impl QdrantIndex {
    /// Creates a client for the server at `url`. No request is made until
    /// the first operation.
    pub fn new(config: &StorageConfig, url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .context("Failed to connect to Qdrant server")?;

        Ok(Self {
            client: Arc::new(client),
            collection_name: config.vector_db.collection_name.clone(),
            batch_size: config.upsert_batch_size,
        })
    }

    async fn collection_exists(&self) -> anyhow::Result<bool> {
        self.client
            .collection_exists(&self.collection_name)
            .await
            .context("Failed to check collection")
    }

    async fn collection_dimension(&self) -> anyhow::Result<Option<usize>> {
        if !self.collection_exists().await? {
            return Ok(None);
        }

        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .context("Failed to get collection info")?;

        let size = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|config| match config {
                Config::Params(params) => Some(params.size as usize),
                Config::ParamsMap(_) => None,
            });

        size.map(Some)
            .context("Collection exists but has no single unnamed vector configuration")
    }

    async fn write_points(&self, batch: Vec<IndexedRecord>) -> anyhow::Result<()> {
        let points = batch
            .into_iter()
            .map(to_point)
            .collect::<anyhow::Result<Vec<PointStruct>>>()?;

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .context("Failed to upsert points")?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self, dimension: usize) -> Result<()> {
        if let Some(existing) = self.collection_dimension().await? {
            if existing != dimension {
                return Err(IndexError::DimensionMismatch {
                    existing,
                    requested: dimension,
                });
            }
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name).vectors_config(VectorsConfig {
                    config: Some(Config::Params(
                        VectorParamsBuilder::new(dimension as u64, Distance::Cosine).build(),
                    )),
                }),
            )
            .await
            .context("Failed to create collection")?;

        tracing::info!(collection = %self.collection_name, dimension, "Created Qdrant collection");
        Ok(())
    }

    async fn upsert(&self, records: Vec<IndexedRecord>) -> Result<UpsertReport> {
        let dimension = self.collection_dimension().await?.ok_or(IndexError::NotReady)?;
        check_record_dimensions(&records, dimension)?;

        write_batches(records, self.batch_size, |batch| self.write_points(batch)).await
    }

    /// Searches for the most similar chunks using cosine similarity.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredMatch>> {
        if top_k == 0 {
            return Err(IndexError::InvalidTopK);
        }
        if !self.collection_exists().await? {
            return Ok(Vec::new());
        }

        let mut request = SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), top_k as u64)
            .with_payload(true);
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            request = request.filter(to_qdrant_filter(filter));
        }

        let response = self
            .client
            .search_points(request)
            .await
            .context("Failed to search points")?;

        let mut matches = response
            .result
            .into_iter()
            .map(|point| {
                let chunk_json = point
                    .payload
                    .get(CHUNK_FIELD)
                    .and_then(|v| v.as_str())
                    .context("Point payload has no chunk")?;
                let chunk: Chunk = serde_json::from_str(chunk_json).context("Malformed chunk payload")?;
                Ok(ScoredMatch {
                    chunk,
                    score: point.score,
                    vector: None,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        rank(&mut matches);
        Ok(matches)
    }

    /// Drops the collection; the next `ensure_ready` recreates it.
    async fn delete_all(&self) -> Result<()> {
        if self.collection_exists().await? {
            self.client
                .delete_collection(&self.collection_name)
                .await
                .context("Failed to delete collection")?;
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        if !self.collection_exists().await? {
            return Ok(0);
        }

        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .context("Failed to get collection info")?;

        Ok(info.result.and_then(|r| r.points_count).unwrap_or(0) as usize)
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        Ok(self.collection_dimension().await?)
    }

    fn backend(&self) -> &'static str {
        "qdrant"
    }
}

/// Qdrant point ids must be integers or UUIDs; derive a stable integer from the record id.
fn point_id(record_id: &str) -> u64 {
    let digest = Sha256::digest(record_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn to_point(record: IndexedRecord) -> anyhow::Result<PointStruct> {
    let chunk_json = serde_json::to_string(&record.chunk).context("Failed to serialize chunk")?;
    let payload: Payload = json!({
        "record_id": record.id,
        SOURCE_ID_KEY: record.chunk.source_id,
        "text": record.chunk.text,
        METADATA_FIELD: record.chunk.metadata,
        CHUNK_FIELD: chunk_json,
    })
    .try_into()
    .context("Failed to build point payload")?;

    Ok(PointStruct::new(point_id(&record.id), record.vector, payload))
}

fn to_qdrant_filter(filter: &MetadataFilter) -> Filter {
    let conditions: Vec<Condition> = filter
        .conditions()
        .iter()
        .map(|(key, value)| {
            let field = if key == SOURCE_ID_KEY {
                key.clone()
            } else {
                format!("{}.{}", METADATA_FIELD, key)
            };
            match value {
                MetadataValue::Text(v) => Condition::matches(field, v.clone()),
                MetadataValue::Integer(v) => Condition::matches(field, *v),
                MetadataValue::Bool(v) => Condition::matches(field, *v),
                MetadataValue::Float(v) => Condition::range(
                    field,
                    Range {
                        gte: Some(*v),
                        lte: Some(*v),
                        ..Default::default()
                    },
                ),
            }
        })
        .collect();

    Filter::must(conditions)
}
