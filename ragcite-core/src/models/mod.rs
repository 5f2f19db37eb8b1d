//! Known embedding models.

mod registry;

pub use registry::{default_models, EmbeddingModel, ModelRegistry};
