//! Semantic text chunking.
//!
//! A document is split into sentence-like units, every unit is embedded, and
//! a chunk boundary is placed wherever the cosine distance between two
//! neighbouring units is unusually large: strictly above the configured
//! percentile of all neighbouring distances in the same document.
//!
//! Chunks are always contiguous spans of the original text, so whitespace
//! inside a chunk is preserved exactly as the loader produced it.

use super::embedder::{check_vectors, EmbedderError, EmbeddingProvider};
use super::similarity::{cosine_distance, percentile};
use super::types::{Chunk, SourceDocument};
use crate::config::ChunkingConfig;
use regex::Regex;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

/// Metadata key recording how a chunk's boundaries were chosen.
pub const CHUNK_METHOD_KEY: &str = "chunk_method";

fn sentence_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.?!]\s+").expect("valid sentence regex"))
}

/// Splits documents into semantically coherent chunks.
#[derive(Clone)]
pub struct SemanticChunker {
    embedder: Arc<dyn EmbeddingProvider>,
    config: ChunkingConfig,
}

impl SemanticChunker {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, config: ChunkingConfig) -> Self {
        Self { embedder, config }
    }

    /// Chunks one document.
    ///
    /// Returns no chunks for a document that is empty or whitespace-only.
    /// An embedding failure fails the whole document; no partial chunk list
    /// is ever returned.
    pub async fn chunk(&self, document: &SourceDocument) -> Result<Vec<Chunk>, EmbedderError> {
        let text = document.text.as_str();
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let units = split_units(text);
        let segments = if units.len() <= 1 {
            vec![trimmed_span(text, 0..text.len())]
        } else {
            let unit_texts: Vec<String> = units.iter().map(|r| text[r.clone()].to_string()).collect();
            let vectors = self.embedder.embed_documents(&unit_texts).await?;
            check_vectors(units.len(), self.embedder.dimension(), &vectors)?;
            let breaks = breakpoints(&vectors, self.config.breakpoint_percentile);
            group_units(&units, &breaks)
        };

        let mut pieces: Vec<(&str, &'static str)> = Vec::new();
        for span in segments {
            let segment = &text[span];
            if self.config.enforce_max_size && segment.len() > self.config.chunk_size {
                for piece in chunk_text(segment, self.config.chunk_size, self.config.chunk_overlap) {
                    pieces.push((piece, "size"));
                }
            } else {
                pieces.push((segment, "semantic"));
            }
        }

        let total = pieces.len();
        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(position, (piece, method))| {
                let mut chunk = Chunk::new(piece, document.source_id.clone(), position, total);
                chunk.metadata = document.metadata.clone();
                chunk.with_metadata(CHUNK_METHOD_KEY, method)
            })
            .collect();

        tracing::debug!(
            source = %document.source_id,
            units = units.len(),
            chunks = chunks.len(),
            "Chunked document"
        );
        Ok(chunks)
    }
}

/// Byte ranges of the sentence-like units of `text`, trimmed, never empty.
fn split_units(text: &str) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut start = 0;
    for m in sentence_break().find_iter(text) {
        // Keep the terminal punctuation with its sentence.
        let end = m.start() + 1;
        push_unit(text, start..end, &mut units);
        start = m.end();
    }
    push_unit(text, start..text.len(), &mut units);
    units
}

fn push_unit(text: &str, range: Range<usize>, units: &mut Vec<Range<usize>>) {
    let span = trimmed_span(text, range);
    if !span.is_empty() {
        units.push(span);
    }
}

fn trimmed_span(text: &str, range: Range<usize>) -> Range<usize> {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return range.start..range.start;
    }
    (range.start + leading)..(range.end - trailing)
}

/// Indices `i` such that a boundary falls between unit `i` and unit `i + 1`.
fn breakpoints(vectors: &[Vec<f32>], breakpoint_percentile: f32) -> Vec<usize> {
    let distances: Vec<f32> = vectors
        .windows(2)
        .map(|pair| cosine_distance(&pair[0], &pair[1]))
        .collect();

    let Some(threshold) = percentile(&distances, breakpoint_percentile) else {
        return Vec::new();
    };

    distances
        .iter()
        .enumerate()
        .filter(|(_, d)| **d > threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Joins consecutive units into segments, cutting after each breakpoint.
fn group_units(units: &[Range<usize>], breaks: &[usize]) -> Vec<Range<usize>> {
    let mut segments = Vec::with_capacity(breaks.len() + 1);
    let mut first = 0;
    for &b in breaks {
        segments.push(units[first].start..units[b].end);
        first = b + 1;
    }
    if let Some(last) = units.last() {
        segments.push(units[first].start..last.end);
    }
    segments
}

/// Splits text into overlapping windows of at most `chunk_size` bytes.
///
/// Window edges are moved to the nearest UTF-8 character boundary, and each
/// window is trimmed; whitespace-only windows are dropped.
pub(crate) fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<&str> {
    if text.len() <= chunk_size {
        return vec![text];
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + chunk_size).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        // A single character wider than chunk_size still has to go somewhere.
        if end == start {
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece);
        }

        if end == text.len() {
            break;
        }

        let mut next = (start + step).min(end);
        while !text.is_char_boundary(next) {
            next -= 1;
        }
        start = if next > start { next } else { end };
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::embedder::Result as EmbedResult;
    use crate::rag::types::MetadataValue;
    use async_trait::async_trait;

    /// Puts every sentence mentioning mammals on one axis and everything else on another.
    struct TopicEmbedder;

    #[async_trait]
    impl EmbeddingProvider for TopicEmbedder {
        fn model_name(&self) -> &str {
            "topic"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed_documents(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("mammals") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
    }

    struct ConstantEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ConstantEmbedder {
        fn model_name(&self) -> &str {
            "constant"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed_documents(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.6, 0.8]).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed_documents(&self, _texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
            Err(EmbedderError::Api("service unavailable".into()))
        }
    }

    /// Returns one vector too many.
    struct OverEagerEmbedder;

    #[async_trait]
    impl EmbeddingProvider for OverEagerEmbedder {
        fn model_name(&self) -> &str {
            "over-eager"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed_documents(&self, texts: &[String]) -> EmbedResult<Vec<Vec<f32>>> {
            Ok((0..=texts.len()).map(|i| vec![i as f32, 1.0]).collect())
        }
    }

    fn chunker(embedder: impl EmbeddingProvider + 'static) -> SemanticChunker {
        SemanticChunker::new(Arc::new(embedder), ChunkingConfig::default())
    }

    #[test]
    fn test_split_units() {
        let text = "  One.  Two?\nThree! Four";
        let units: Vec<&str> = split_units(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(units, vec!["One.", "Two?", "Three!", "Four"]);
    }

    #[test]
    fn test_split_units_keeps_decimals_together() {
        let text = "Pi is 3.14 roughly. Done.";
        let units: Vec<&str> = split_units(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(units, vec!["Pi is 3.14 roughly.", "Done."]);
    }

    #[tokio::test]
    async fn test_topic_shift_creates_boundary() {
        let doc = SourceDocument::new(
            "animals.txt",
            "Cats are mammals. Dogs are mammals. The stock market fell today.",
        );
        let chunks = chunker(TopicEmbedder).chunk(&doc).await.unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Cats are mammals. Dogs are mammals.");
        assert_eq!(chunks[1].text, "The stock market fell today.");
        assert_eq!(chunks[1].metadata[CHUNK_METHOD_KEY], MetadataValue::from("semantic"));
    }

    #[tokio::test]
    async fn test_uniform_distances_give_single_chunk() {
        let text = "First sentence.  Second   sentence. Third sentence.";
        let doc = SourceDocument::new("uniform.txt", text);
        let chunks = chunker(ConstantEmbedder).chunk(&doc).await.unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].total_chunks, 1);
    }

    #[tokio::test]
    async fn test_single_unit_does_not_embed() {
        let doc = SourceDocument::new("one.txt", "  just one sentence without a break  ");
        let chunks = chunker(FailingEmbedder).chunk(&doc).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "just one sentence without a break");
    }

    #[tokio::test]
    async fn test_whitespace_document_has_no_chunks() {
        let doc = SourceDocument::new("blank.txt", " \n\t ");
        assert!(chunker(FailingEmbedder).chunk(&doc).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_positions_are_contiguous_and_metadata_carried() {
        let doc = SourceDocument::new(
            "mixed.md",
            "Cats are mammals. Markets fell. Whales are mammals. Bonds rose.",
        )
        .with_metadata("document_type", "markdown");
        let chunks = chunker(TopicEmbedder).chunk(&doc).await.unwrap();

        let n = chunks.len();
        assert!(n >= 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.position_index, i);
            assert_eq!(chunk.total_chunks, n);
            assert_eq!(chunk.source_id, "mixed.md");
            assert_eq!(chunk.metadata["document_type"], MetadataValue::from("markdown"));
            assert!(!chunk.text.is_empty());
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_document() {
        let doc = SourceDocument::new("a.txt", "One. Two. Three.");
        assert!(chunker(FailingEmbedder).chunk(&doc).await.is_err());
    }

    #[tokio::test]
    async fn test_vector_count_mismatch_fails_document() {
        let doc = SourceDocument::new("a.txt", "One. Two.");
        let err = chunker(OverEagerEmbedder).chunk(&doc).await.unwrap_err();
        assert!(matches!(err, EmbedderError::CountMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn test_enforce_max_size_splits_long_segment() {
        let config = ChunkingConfig {
            chunk_size: 10,
            chunk_overlap: 2,
            enforce_max_size: true,
            ..ChunkingConfig::default()
        };
        let chunker = SemanticChunker::new(Arc::new(ConstantEmbedder), config);
        let doc = SourceDocument::new("long.txt", "0123456789ABCDEF");
        let chunks = chunker.chunk(&doc).await.unwrap();

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["0123456789", "89ABCDEF"]);
        assert_eq!(chunks[0].metadata[CHUNK_METHOD_KEY], MetadataValue::from("size"));
    }

    #[test]
    fn test_chunk_text_small() {
        assert_eq!(chunk_text("Hello", 10, 2), vec!["Hello"]);
    }

    #[test]
    fn test_chunk_text_respects_char_boundaries() {
        let text = "ééééé";
        let chunks = chunk_text(text, 3, 0);
        assert!(chunks.iter().all(|c| !c.is_empty()));
        assert_eq!(chunks.concat(), text);
    }
}
