//! ragcite-core - Retrieval-augmented question answering with citations
//!
//! Provides the components of a RAG pipeline:
//! - Document loading and semantic chunking
//! - Embedding providers (Ollama, OpenAI-compatible, local BERT, hashing)
//! - Vector indexes (in-memory, LanceDB embedded, Qdrant over gRPC)
//! - Similarity and MMR retrieval
//! - LLM provider abstraction (Ollama, mistral.rs) for grounded answers
//! - Configuration management
//!
//! ## Primary API
//!
//! Most callers build a [`RagEngine`] from a [`Config`] and use its
//! `ingest_path` and `query` methods.

pub mod config;
pub mod models;
pub mod provider;
pub mod rag;

pub use config::{Config, ConfigError, StorageMode};
pub use rag::{
    Citation, GenerationResult, IndexStats, IngestReport, MetadataFilter, QueryOptions, QueryResponse, RagEngine,
    RagError, SourceDocument,
};

// Provider exports
pub use provider::{ChatRequest, ChatResponse, Message, Provider, ProviderError};
