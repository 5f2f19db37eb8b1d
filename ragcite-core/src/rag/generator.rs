//! Grounded answer generation with source citations.
//!
//! Retrieved chunks are rendered into a numbered context block, each entry
//! tagged with the same bracketed marker the model is asked to cite with:
//!
//! ```text
//! Source 1 [handbook.md, page 3]:
//! Vacation requests go through the HR portal.
//!
//! ---
//! Source 2 [faq.md]:
//! ...
//! ```

use super::types::{Citation, GenerationResult, ScoredMatch};
use super::{timed, RagError, Result};
use crate::config::LlmConfig;
use crate::provider::{ChatRequest, ChatResponse, Message, Provider, ProviderError};
use std::sync::Arc;
use std::time::Duration;

/// Returned without calling the model when retrieval produced nothing.
pub const NO_CONTEXT_ANSWER: &str = "I couldn't find any relevant information to answer your question.";

/// The sentence the model is told to use when the context cannot answer.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "The provided context does not contain enough information to answer this question.";

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant that answers questions based on the provided context.

IMPORTANT INSTRUCTIONS:
1. Answer the question using ONLY information from the context below
2. Include citations by referencing the source documents in square brackets, exactly as they appear in the context, e.g. [source_name, page X]
3. If the context doesn't contain enough information to answer the question, reply with exactly: \"The provided context does not contain enough information to answer this question.\"
4. Be concise but comprehensive
5. Maintain factual accuracy - don't make up information";

/// Builds prompts from retrieved chunks and turns model output into a [`GenerationResult`].
#[derive(Clone)]
pub struct AnswerGenerator {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl AnswerGenerator {
    pub fn new(provider: Arc<dyn Provider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Answers `question` from `matches`, in one model call.
    pub async fn generate(&self, question: &str, matches: &[ScoredMatch]) -> Result<GenerationResult> {
        self.generate_streaming(question, matches, |_| {}).await
    }

    /// Like [`generate`](Self::generate), forwarding each piece of model
    /// output to `on_token` as it arrives.
    pub async fn generate_streaming<F>(
        &self,
        question: &str,
        matches: &[ScoredMatch],
        mut on_token: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(&str) + Send,
    {
        if matches.is_empty() {
            tracing::info!("No context retrieved; skipping generation");
            on_token(NO_CONTEXT_ANSWER);
            return Ok(GenerationResult {
                answer: NO_CONTEXT_ANSWER.to_string(),
                citations: Vec::new(),
                retrieved_chunks: 0,
                insufficient_context: true,
            });
        }

        let request = self.build_request(question, matches);
        tracing::debug!(chunks = matches.len(), model = %self.model, "Generating answer");

        let mut answer = String::new();
        timed(
            self.timeout,
            "answer generation",
            self.provider.chat(
                request,
                Box::new(|chunk: ChatResponse| {
                    if !chunk.content.is_empty() {
                        on_token(&chunk.content);
                        answer.push_str(&chunk.content);
                    }
                }),
            ),
        )
        .await?;

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            return Err(RagError::Generation(ProviderError::MalformedResponse(
                "model returned no content".to_string(),
            )));
        }
        let insufficient_context = reports_insufficient_context(&answer);
        let citations = if insufficient_context {
            Vec::new()
        } else {
            collect_citations(matches)
        };

        tracing::info!(
            answer_len = answer.len(),
            citations = citations.len(),
            insufficient_context,
            "Answer generated"
        );

        Ok(GenerationResult {
            answer,
            citations,
            retrieved_chunks: matches.len(),
            insufficient_context,
        })
    }

    fn build_request(&self, question: &str, matches: &[ScoredMatch]) -> ChatRequest {
        let user = format!(
            "Context:\n{}\n\nQuestion: {}\n\nAnswer with citations:",
            format_context(matches),
            question.trim()
        );
        ChatRequest::new(self.model.clone(), vec![Message::system(SYSTEM_PROMPT), Message::user(user)])
            .with_temperature(self.temperature)
    }
}

fn citation_for(m: &ScoredMatch) -> Citation {
    Citation {
        source_id: m.chunk.source_id.clone(),
        locator: m.chunk.locator(),
        score: m.score,
    }
}

/// Renders matches in retrieval order as numbered, citation-tagged sources.
pub fn format_context(matches: &[ScoredMatch]) -> String {
    matches
        .iter()
        .enumerate()
        .map(|(i, m)| format!("Source {} {}:\n{}\n", i + 1, citation_for(m).marker(), m.chunk.text))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// One citation per distinct (source, locator), in first-seen order, each
/// carrying the best score among its matches.
pub fn collect_citations(matches: &[ScoredMatch]) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();
    for m in matches {
        let candidate = citation_for(m);
        match citations
            .iter_mut()
            .find(|c| c.source_id == candidate.source_id && c.locator == candidate.locator)
        {
            Some(existing) => existing.score = existing.score.max(candidate.score),
            None => citations.push(candidate),
        }
    }
    citations
}

fn reports_insufficient_context(answer: &str) -> bool {
    let normalize = |s: &str| {
        s.trim()
            .trim_end_matches('.')
            .trim_matches('"')
            .to_lowercase()
    };
    normalize(answer).starts_with(&normalize(INSUFFICIENT_CONTEXT_ANSWER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, Result as ProviderResult};
    use crate::rag::types::Chunk;
    use crate::rag::RagError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies with a fixed script, one callback per piece, and records the request.
    struct ScriptedLlm {
        pieces: Vec<&'static str>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        fn new(pieces: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                pieces,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedLlm {
        async fn chat<'a>(
            &'a self,
            request: ChatRequest,
            mut callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
        ) -> ProviderResult<()> {
            self.seen.lock().unwrap().push(request.clone());
            for (i, piece) in self.pieces.iter().enumerate() {
                callback(ChatResponse {
                    model: request.model.clone(),
                    content: piece.to_string(),
                    done: i + 1 == self.pieces.len(),
                });
            }
            Ok(())
        }
    }

    struct BrokenLlm;

    #[async_trait]
    impl Provider for BrokenLlm {
        async fn chat<'a>(
            &'a self,
            _request: ChatRequest,
            _callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
        ) -> ProviderResult<()> {
            Err(ProviderError::Api("model not found".into()))
        }
    }

    /// Finishes the stream without producing any text.
    struct SilentLlm;

    #[async_trait]
    impl Provider for SilentLlm {
        async fn chat<'a>(
            &'a self,
            request: ChatRequest,
            mut callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
        ) -> ProviderResult<()> {
            callback(ChatResponse {
                model: request.model,
                content: "  ".to_string(),
                done: true,
            });
            Ok(())
        }
    }

    fn scored(source: &str, page: Option<i64>, score: f32) -> ScoredMatch {
        let mut chunk = Chunk::new(format!("text from {source}"), source, 0, 1);
        if let Some(page) = page {
            chunk = chunk.with_metadata("page", page);
        }
        ScoredMatch {
            chunk,
            score,
            vector: None,
        }
    }

    #[test]
    fn test_citations_deduplicated_in_first_seen_order() {
        let matches = vec![
            scored("A", None, 0.9),
            scored("A", None, 0.95),
            scored("B", None, 0.8),
            scored("A", None, 0.7),
        ];
        let citations = collect_citations(&matches);
        let sources: Vec<&str> = citations.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(sources, vec!["A", "B"]);
        assert!((citations[0].score - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_citations_distinguish_locators() {
        let matches = vec![scored("A", Some(1), 0.9), scored("A", Some(2), 0.8), scored("A", Some(1), 0.7)];
        let citations = collect_citations(&matches);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[1].marker(), "[A, page 2]");
    }

    #[test]
    fn test_format_context() {
        let matches = vec![scored("a.md", Some(3), 0.9), scored("b.md", None, 0.8)];
        assert_eq!(
            format_context(&matches),
            "Source 1 [a.md, page 3]:\ntext from a.md\n\n---\nSource 2 [b.md]:\ntext from b.md\n"
        );
    }

    #[tokio::test]
    async fn test_generate_attaches_citations() {
        let llm = ScriptedLlm::new(vec!["Cats are ", "mammals [a.md]."]);
        let generator = AnswerGenerator::new(llm.clone(), &LlmConfig::default());
        let matches = vec![scored("a.md", None, 0.9), scored("a.md", None, 0.8)];

        let result = generator.generate("What are cats?", &matches).await.unwrap();
        assert_eq!(result.answer, "Cats are mammals [a.md].");
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.retrieved_chunks, 2);
        assert!(!result.insufficient_context);

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let prompt = &seen[0].messages[1].content;
        assert!(prompt.contains("Source 1 [a.md]:"));
        assert!(prompt.contains("Question: What are cats?"));
    }

    #[tokio::test]
    async fn test_no_matches_skips_model() {
        let llm = ScriptedLlm::new(vec!["should not be used"]);
        let generator = AnswerGenerator::new(llm.clone(), &LlmConfig::default());

        let result = generator.generate("anything", &[]).await.unwrap();
        assert_eq!(result.answer, NO_CONTEXT_ANSWER);
        assert!(result.citations.is_empty());
        assert!(llm.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_context_drops_citations() {
        let llm = ScriptedLlm::new(vec![INSUFFICIENT_CONTEXT_ANSWER]);
        let generator = AnswerGenerator::new(llm, &LlmConfig::default());

        let result = generator.generate("Who won?", &[scored("a.md", None, 0.4)]).await.unwrap();
        assert!(result.insufficient_context);
        assert!(result.citations.is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let generator = AnswerGenerator::new(Arc::new(BrokenLlm), &LlmConfig::default());
        let err = generator.generate("q", &[scored("a.md", None, 0.4)]).await.unwrap_err();
        assert!(matches!(err, RagError::Generation(_)));
    }

    #[tokio::test]
    async fn test_empty_reply_is_malformed_response() {
        let generator = AnswerGenerator::new(Arc::new(SilentLlm), &LlmConfig::default());
        let err = generator.generate("q", &[scored("a.md", None, 0.4)]).await.unwrap_err();
        assert!(matches!(
            err,
            RagError::Generation(ProviderError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_streaming_forwards_pieces() {
        let llm = ScriptedLlm::new(vec!["one ", "two"]);
        let generator = AnswerGenerator::new(llm, &LlmConfig::default());
        let mut streamed = Vec::new();

        let result = generator
            .generate_streaming("q", &[scored("a.md", None, 0.4)], |t| streamed.push(t.to_string()))
            .await
            .unwrap();
        assert_eq!(streamed, vec!["one ", "two"]);
        assert_eq!(result.answer, "one two");
    }
}
