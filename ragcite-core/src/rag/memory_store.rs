//! In-process vector index.
//!
//! Records live in insertion order behind a `tokio::sync::RwLock`; queries
//! are a linear cosine scan. Used for tests and ephemeral sessions.

use super::similarity::cosine_similarity;
use super::store::{
    check_record_dimensions, rank, write_batches, IndexError, MetadataFilter, Result, UpsertReport, VectorIndex,
};
use super::types::{IndexedRecord, ScoredMatch};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct MemoryIndex {
    state: RwLock<MemoryState>,
    batch_size: usize,
}

#[derive(Default)]
struct MemoryState {
    dimension: Option<usize>,
    records: Vec<IndexedRecord>,
    /// Record id -> position in `records`
    positions: HashMap<String, usize>,
}

impl MemoryState {
    fn put(&mut self, record: IndexedRecord) {
        match self.positions.get(&record.id) {
            // Overwrites keep the original insertion slot.
            Some(&slot) => self.records[slot] = record,
            None => {
                self.positions.insert(record.id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

impl MemoryIndex {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            batch_size,
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_ready(&self, dimension: usize) -> Result<()> {
        let mut state = self.state.write().await;
        match state.dimension {
            Some(existing) if existing != dimension => Err(IndexError::DimensionMismatch {
                existing,
                requested: dimension,
            }),
            Some(_) => Ok(()),
            None => {
                state.dimension = Some(dimension);
                Ok(())
            }
        }
    }

    async fn upsert(&self, records: Vec<IndexedRecord>) -> Result<UpsertReport> {
        let dimension = self.state.read().await.dimension.ok_or(IndexError::NotReady)?;
        check_record_dimensions(&records, dimension)?;

        write_batches(records, self.batch_size, |batch| async move {
            let mut state = self.state.write().await;
            for record in batch {
                state.put(record);
            }
            Ok(())
        })
        .await
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredMatch>> {
        if top_k == 0 {
            return Err(IndexError::InvalidTopK);
        }

        let state = self.state.read().await;
        let Some(dimension) = state.dimension else {
            return Ok(Vec::new());
        };
        if vector.len() != dimension {
            return Err(IndexError::DimensionMismatch {
                existing: dimension,
                requested: vector.len(),
            });
        }

        let mut matches: Vec<ScoredMatch> = state
            .records
            .iter()
            .filter(|r| filter.map_or(true, |f| f.matches(&r.chunk)))
            .map(|r| ScoredMatch {
                chunk: r.chunk.clone(),
                score: cosine_similarity(vector, &r.vector),
                vector: Some(r.vector.clone()),
            })
            .collect();

        rank(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_all(&self) -> Result<()> {
        *self.state.write().await = MemoryState::default();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.read().await.records.len())
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        Ok(self.state.read().await.dimension)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
