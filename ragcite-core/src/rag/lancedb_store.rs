//! LanceDB vector database storage implementation.
//!
//! This module provides integration with LanceDB for embedded, on-disk vector storage.

use super::store::{
    check_record_dimensions, rank, write_batches, IndexError, MetadataFilter, Result, UpsertReport, VectorIndex,
    SOURCE_ID_KEY,
};
use super::types::{Chunk, IndexedRecord, MetadataValue, ScoredMatch};
use crate::config::StorageConfig;
use anyhow::Context;
use arrow_array::{
    array::{ArrayRef, FixedSizeListArray, Float32Array, StringArray, UInt64Array},
    Array, RecordBatch, RecordBatchIterator,
};
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use lancedb::arrow::arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{connect, Connection, DistanceType, Table};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Insertion sequence of a row. Equal scores rank by it, and an overwritten
/// id keeps the value it was first written with.
const SEQ_COLUMN: &str = "seq";

/// LanceDB-based vector index for embedded deployment.
///
/// Provides zero-setup, in-process vector storage using LanceDB. The table
/// is created by `ensure_ready` with a fixed-size vector column, which is
/// where the index dimension is read back from.
///
/// Writes go through `merge_insert` keyed on the record id, so replacing a
/// record is a single commit. Upserts from one handle are serialized because
/// new sequence numbers are derived from the row count.
pub struct LanceDbIndex {
    conn: Connection,
    table_name: String,
    batch_size: usize,
    write_lock: Mutex<()>,
}

impl LanceDbIndex {
    /// Opens (or creates) the LanceDB database directory at `path`.
    pub async fn new(config: &StorageConfig, path: &str) -> Result<Self> {
        let conn = connect(path)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            conn,
            table_name: config.vector_db.collection_name.clone(),
            batch_size: config.upsert_batch_size,
            write_lock: Mutex::new(()),
        })
    }

    fn create_schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(SOURCE_ID_KEY, DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("chunk", DataType::Utf8, false),
            Field::new(SEQ_COLUMN, DataType::UInt64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
        ]))
    }

    async fn open_table(&self) -> anyhow::Result<Option<Table>> {
        let table_names = self.conn.table_names().execute().await?;
        if !table_names.contains(&self.table_name) {
            return Ok(None);
        }

        let table = self
            .conn
            .open_table(&self.table_name)
            .execute()
            .await
            .context("Failed to open LanceDB table")?;
        Ok(Some(table))
    }

    async fn table_dimension(table: &Table) -> anyhow::Result<usize> {
        let schema = table.schema().await.context("Failed to read table schema")?;
        let field = schema.field_with_name("vector").context("Missing 'vector' column")?;
        match field.data_type() {
            DataType::FixedSizeList(_, size) => Ok(*size as usize),
            other => anyhow::bail!("Unexpected vector column type: {other}"),
        }
    }

    /// Sequence numbers already assigned to the ids in `batch`.
    async fn existing_sequences(table: &Table, batch: &[IndexedRecord]) -> anyhow::Result<HashMap<String, u64>> {
        let ids: Vec<String> = batch.iter().map(|r| sql_quote(&r.id)).collect();
        let batches: Vec<RecordBatch> = table
            .query()
            .only_if(format!("id IN ({})", ids.join(", ")))
            .select(Select::columns(&["id", SEQ_COLUMN]))
            .limit(batch.len())
            .execute()
            .await
            .context("Failed to look up existing records")?
            .try_collect()
            .await
            .context("Failed to collect existing records")?;

        let mut sequences = HashMap::new();
        for found in &batches {
            let ids = string_column(found, "id")?;
            let seqs = seq_column(found)?;
            for i in 0..found.num_rows() {
                sequences.insert(ids.value(i).to_string(), seqs.value(i));
            }
        }
        Ok(sequences)
    }

    async fn write_batch(&self, table: &Table, dimension: usize, batch: Vec<IndexedRecord>) -> anyhow::Result<()> {
        let batch = last_write_wins(batch);
        let existing = Self::existing_sequences(table, &batch).await?;

        // Rows are never deleted individually, so the count is the next free sequence.
        let mut next = table.count_rows(None).await.context("Failed to count rows")? as u64;
        let seqs: Vec<u64> = batch
            .iter()
            .map(|record| {
                existing.get(&record.id).copied().unwrap_or_else(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect();

        let record_batch = to_record_batch(Self::create_schema(dimension), dimension, batch, seqs)?;
        let schema_ref = record_batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(record_batch)], schema_ref));

        let mut merge = table.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge.execute(reader).await.context("Failed to merge records into LanceDB")?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LanceDbIndex {
    async fn ensure_ready(&self, dimension: usize) -> Result<()> {
        if let Some(table) = self.open_table().await? {
            let existing = Self::table_dimension(&table).await?;
            if existing != dimension {
                return Err(IndexError::DimensionMismatch {
                    existing,
                    requested: dimension,
                });
            }
            return Ok(());
        }

        self.conn
            .create_empty_table(&self.table_name, Self::create_schema(dimension))
            .execute()
            .await
            .context("Failed to create LanceDB table")?;

        tracing::info!(table = %self.table_name, dimension, "Created LanceDB table");
        Ok(())
    }

    async fn upsert(&self, records: Vec<IndexedRecord>) -> Result<UpsertReport> {
        let table = self.open_table().await?.ok_or(IndexError::NotReady)?;
        let dimension = Self::table_dimension(&table).await?;
        check_record_dimensions(&records, dimension)?;

        let _guard = self.write_lock.lock().await;
        write_batches(records, self.batch_size, |batch| self.write_batch(&table, dimension, batch)).await
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
        let Some(table) = self.open_table().await? else {
            return Ok(Vec::new());
        };

        let filter = filter.filter(|f| !f.is_empty());
        let source_clause = filter.and_then(source_predicate);
        // Metadata lives in the serialized chunk, so metadata predicates are
        // applied after the search, over every candidate.
        let post_filter = filter.filter(|f| f.conditions().iter().any(|(k, _)| k != SOURCE_ID_KEY));
        let limit = if post_filter.is_some() {
            table.count_rows(None).await.context("Failed to count rows")?.max(top_k)
        } else {
            top_k
        };

        let mut query = table
            .query()
            .nearest_to(vector)
            .context("Invalid query vector")?
            .distance_type(DistanceType::Cosine)
            .limit(limit);
        if let Some(clause) = source_clause {
            query = query.only_if(clause);
        }

        let results = query.execute().await.context("Failed to execute LanceDB query")?;
        let batches: Vec<RecordBatch> = results
            .try_collect()
            .await
            .context("Failed to collect query results")?;

        let mut sequenced = Vec::new();
        for batch in &batches {
            sequenced.extend(read_matches(batch)?);
        }
        // Insertion order first, so the stable rank below breaks ties by it.
        sequenced.sort_by_key(|(seq, _)| *seq);
        let mut matches: Vec<ScoredMatch> = sequenced.into_iter().map(|(_, m)| m).collect();
        if let Some(filter) = post_filter {
            matches.retain(|m| filter.matches(&m.chunk));
        }

        rank(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_all(&self) -> Result<()> {
        if self.open_table().await?.is_some() {
            self.conn
                .drop_table(&self.table_name, &[])
                .await
                .context("Failed to drop table")?;
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        match self.open_table().await? {
            Some(table) => Ok(table.count_rows(None).await.context("Failed to count rows")?),
            None => Ok(0),
        }
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        match self.open_table().await? {
            Some(table) => Ok(Some(Self::table_dimension(&table).await?)),
            None => Ok(None),
        }
    }

    fn backend(&self) -> &'static str {
        "lancedb"
    }
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// SQL pushdown for the reserved `source_id` key.
fn source_predicate(filter: &MetadataFilter) -> Option<String> {
    let clauses: Vec<String> = filter
        .conditions()
        .iter()
        .filter(|(key, _)| key == SOURCE_ID_KEY)
        .map(|(_, value)| match value {
            MetadataValue::Text(id) => format!("{} = {}", SOURCE_ID_KEY, sql_quote(id)),
            // A non-text source id can never match.
            _ => "FALSE".to_string(),
        })
        .collect();

    (!clauses.is_empty()).then(|| clauses.join(" AND "))
}

/// Collapses repeated ids in one batch to their last occurrence, in first-seen order.
fn last_write_wins(batch: Vec<IndexedRecord>) -> Vec<IndexedRecord> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<IndexedRecord> = Vec::with_capacity(batch.len());
    for record in batch {
        match slots.get(&record.id) {
            Some(&slot) => unique[slot] = record,
            None => {
                slots.insert(record.id.clone(), unique.len());
                unique.push(record);
            }
        }
    }
    unique
}

fn to_record_batch(
    schema: Arc<Schema>,
    dimension: usize,
    records: Vec<IndexedRecord>,
    seqs: Vec<u64>,
) -> anyhow::Result<RecordBatch> {
    let mut ids = Vec::with_capacity(records.len());
    let mut sources = Vec::with_capacity(records.len());
    let mut texts = Vec::with_capacity(records.len());
    let mut chunks = Vec::with_capacity(records.len());
    let mut values = Vec::with_capacity(records.len() * dimension);

    for record in records {
        chunks.push(serde_json::to_string(&record.chunk).context("Failed to serialize chunk")?);
        ids.push(record.id);
        sources.push(record.chunk.source_id);
        texts.push(record.chunk.text);
        values.extend(record.vector);
    }

    let vector_array = FixedSizeListArray::try_new(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dimension as i32,
        Arc::new(Float32Array::from(values)),
        None,
    )
    .context("Failed to build vector column")?;

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids)) as ArrayRef,
            Arc::new(StringArray::from(sources)) as ArrayRef,
            Arc::new(StringArray::from(texts)) as ArrayRef,
            Arc::new(StringArray::from(chunks)) as ArrayRef,
            Arc::new(UInt64Array::from(seqs)) as ArrayRef,
            Arc::new(vector_array) as ArrayRef,
        ],
    )
    .context("Failed to create record batch")
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("Missing '{name}' column"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("Failed to cast '{name}' to StringArray"))
}

fn seq_column(batch: &RecordBatch) -> anyhow::Result<&UInt64Array> {
    batch
        .column_by_name(SEQ_COLUMN)
        .context("Missing 'seq' column")?
        .as_any()
        .downcast_ref::<UInt64Array>()
        .context("Failed to cast 'seq' to UInt64Array")
}

fn read_matches(batch: &RecordBatch) -> anyhow::Result<Vec<(u64, ScoredMatch)>> {
    let chunk_array = string_column(batch, "chunk")?;
    let seq_array = seq_column(batch)?;
    let vector_array = batch
        .column_by_name("vector")
        .context("Missing 'vector' column")?
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .context("Failed to cast 'vector' to FixedSizeListArray")?;
    let distance_array = batch
        .column_by_name("_distance")
        .context("Missing '_distance' column")?
        .as_any()
        .downcast_ref::<Float32Array>()
        .context("Failed to cast '_distance' to Float32Array")?;

    (0..batch.num_rows())
        .map(|i| {
            let chunk: Chunk = serde_json::from_str(chunk_array.value(i)).context("Malformed chunk column")?;
            let stored = vector_array.value(i);
            let vector = stored
                .as_any()
                .downcast_ref::<Float32Array>()
                .map(|values| values.values().to_vec());

            let scored = ScoredMatch {
                chunk,
                // Cosine distance is 1 - cosine similarity.
                score: 1.0 - distance_array.value(i),
                vector,
            };
            Ok((seq_array.value(i), scored))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn record(source: &str, position: usize, vector: Vec<f32>) -> IndexedRecord {
        IndexedRecord::new(
            Chunk::new(format!("{source} #{position}"), source, position, 2).with_metadata("page", position + 1),
            vector,
        )
    }

    async fn open(dir: &tempfile::TempDir) -> LanceDbIndex {
        let path = dir.path().to_string_lossy().to_string();
        LanceDbIndex::new(&StorageConfig::default(), &path).await.unwrap()
    }

    #[test]
    fn test_source_predicate_escapes_quotes() {
        let filter = MetadataFilter::new().source("o'brien.md").eq("page", 1);
        assert_eq!(source_predicate(&filter).unwrap(), "source_id = 'o''brien.md'");
        assert!(source_predicate(&MetadataFilter::new().eq("page", 1)).is_none());
    }

    #[tokio::test]
    async fn test_lancedb_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir).await;

        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(index.dimension().await.unwrap(), None);

        index.ensure_ready(3).await.unwrap();
        index.ensure_ready(3).await.unwrap();
        index
            .upsert(vec![
                record("a.md", 0, vec![1.0, 0.0, 0.0]),
                record("a.md", 1, vec![0.0, 1.0, 0.0]),
                record("b.md", 0, vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let hits = index.query(&[0.0, 1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits[0].chunk.record_id(), "a.md#1");
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert_eq!(hits[0].vector.as_deref(), Some(&[0.0, 1.0, 0.0][..]));

        // Overwrite keeps one row per id.
        index.upsert(vec![record("a.md", 1, vec![0.0, 1.0, 0.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let filter = MetadataFilter::new().source("a.md").eq("page", 1);
        let hits = index.query(&[0.0, 0.0, 1.0], 5, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.record_id(), "a.md#0");
    }

    #[tokio::test]
    async fn test_overwrite_keeps_count_and_tie_order() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir).await;
        index.ensure_ready(2).await.unwrap();

        index
            .upsert(vec![
                record("a.md", 0, vec![1.0, 0.0]),
                record("b.md", 0, vec![1.0, 0.0]),
                record("c.md", 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        // Rewrite the first record twice, once as a duplicate within the batch.
        let mut replacement = record("a.md", 0, vec![1.0, 0.0]);
        replacement.chunk.text = "rewritten".into();
        index
            .upsert(vec![record("a.md", 0, vec![1.0, 0.0]), replacement])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let hits = index.query(&[1.0, 0.0], 3, None).await.unwrap();
        let ids: Vec<String> = hits.iter().map(|h| h.chunk.record_id()).collect();
        assert_eq!(ids, vec!["a.md#0", "b.md#0", "c.md#0"]);
        assert_eq!(hits[0].chunk.text, "rewritten");

        index.upsert(vec![record("d.md", 0, vec![1.0, 0.0])]).await.unwrap();
        let hits = index.query(&[1.0, 0.0], 4, None).await.unwrap();
        assert_eq!(hits[3].chunk.record_id(), "d.md#0");
    }

    #[tokio::test]
    async fn test_lancedb_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir).await;
        index.ensure_ready(384).await.unwrap();

        let err = index.ensure_ready(768).await.unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { existing: 384, requested: 768 }));
        assert_eq!(index.dimension().await.unwrap(), Some(384));

        index.delete_all().await.unwrap();
        index.ensure_ready(768).await.unwrap();
    }
}
