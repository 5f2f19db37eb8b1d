//! ragcite - Retrieval-augmented question answering with source citations
//!
//! This is the convenience wrapper crate that re-exports `ragcite-core`.
//!
//! # Quick Start
//!
//! ```toml
//! [dependencies]
//! ragcite = "0.1"
//! ```
//!
//! # Features
//!
//! - `metal`: Apple Silicon acceleration for local models
//! - `cuda`: NVIDIA acceleration for local models

pub use ragcite_core::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use ragcite_core::rag::{EmbeddingProvider, VectorIndex};
    pub use ragcite_core::*;
}
