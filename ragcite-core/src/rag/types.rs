use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar metadata value attached to a document or chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(v) => write!(f, "{}", v),
            MetadataValue::Integer(v) => write!(f, "{}", v),
            MetadataValue::Float(v) => write!(f, "{}", v),
            MetadataValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        MetadataValue::Integer(value.into())
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        MetadataValue::Integer(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Metadata keys consulted, in order, for a citation locator.
pub const LOCATOR_KEYS: [&str; 2] = ["page", "section"];

/// A normalized document handed to the chunker by a loader.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub source_id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl SourceDocument {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A contiguous span of one document's text; the unit of retrieval.
///
/// # Example
///
/// ```no_run
/// # use ragcite_core::rag::Chunk;
/// let chunk = Chunk::new("Cats are mammals.", "animals.txt", 0, 2)
///     .with_metadata("page", 3);
/// assert_eq!(chunk.record_id(), "animals.txt#0");
/// assert_eq!(chunk.locator().as_deref(), Some("page 3"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub source_id: String,
    pub position_index: usize,
    pub total_chunks: usize,
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(
        text: impl Into<String>,
        source_id: impl Into<String>,
        position_index: usize,
        total_chunks: usize,
    ) -> Self {
        Self {
            text: text.into(),
            source_id: source_id.into(),
            position_index,
            total_chunks,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Stable identifier of the record holding this chunk.
    pub fn record_id(&self) -> String {
        format!("{}#{}", self.source_id, self.position_index)
    }

    /// Page or section the chunk came from, if the loader recorded one.
    pub fn locator(&self) -> Option<String> {
        LOCATOR_KEYS.iter().find_map(|key| {
            self.metadata
                .get(*key)
                .map(|value| format!("{} {}", key, value))
        })
    }
}

/// A chunk together with its embedding, as stored in a vector index.
#[derive(Debug, Clone)]
pub struct IndexedRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub chunk: Chunk,
}

impl IndexedRecord {
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: chunk.record_id(),
            vector,
            chunk,
        }
    }
}

/// A search result containing a chunk and its similarity score.
///
/// Returned by vector search operations, ordered by descending similarity score.
/// Higher scores indicate better matches to the query. `vector` carries the
/// stored embedding when the backend returns it.
#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub chunk: Chunk,
    pub score: f32,
    pub vector: Option<Vec<f32>>,
}

/// A deduplicated reference to a source backing an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub source_id: String,
    pub locator: Option<String>,
    /// Best relevance score among the matches that produced this citation
    pub score: f32,
}

impl Citation {
    /// Inline marker used in the prompt context, e.g. `[report.md, page 2]`.
    pub fn marker(&self) -> String {
        match &self.locator {
            Some(locator) => format!("[{}, {}]", self.source_id, locator),
            None => format!("[{}]", self.source_id),
        }
    }
}

/// The answer to one query and the sources it was grounded in.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub retrieved_chunks: usize,
    /// The model stated that the supplied context could not answer the question
    pub insufficient_context: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_is_stable() {
        let a = Chunk::new("x", "doc.md", 3, 5);
        let b = Chunk::new("different text", "doc.md", 3, 5);
        assert_eq!(a.record_id(), b.record_id());
        assert_ne!(a.record_id(), Chunk::new("x", "doc.md", 4, 5).record_id());
    }

    #[test]
    fn test_locator_prefers_page() {
        let chunk = Chunk::new("x", "doc.pdf", 0, 1)
            .with_metadata("section", "Intro")
            .with_metadata("page", 7);
        assert_eq!(chunk.locator().as_deref(), Some("page 7"));

        let chunk = Chunk::new("x", "doc.md", 0, 1).with_metadata("section", "Intro");
        assert_eq!(chunk.locator().as_deref(), Some("section Intro"));

        assert_eq!(Chunk::new("x", "doc.md", 0, 1).locator(), None);
    }

    #[test]
    fn test_citation_marker() {
        let citation = Citation {
            source_id: "report.md".to_string(),
            locator: Some("page 2".to_string()),
            score: 0.9,
        };
        assert_eq!(citation.marker(), "[report.md, page 2]");
    }

    #[test]
    fn test_metadata_value_untagged_serde() {
        let parsed: Metadata =
            serde_json::from_str(r#"{"page": 3, "title": "Intro", "score": 0.5, "draft": true}"#).unwrap();
        assert_eq!(parsed["page"], MetadataValue::Integer(3));
        assert_eq!(parsed["title"], MetadataValue::Text("Intro".to_string()));
        assert_eq!(parsed["score"], MetadataValue::Float(0.5));
        assert_eq!(parsed["draft"], MetadataValue::Bool(true));
    }
}
