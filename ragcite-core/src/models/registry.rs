use serde::{Deserialize, Serialize};

/// A known embedding model and the dimension of the vectors it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub id: String,
    pub embedding_dim: usize,
    pub description: String,
}

impl EmbeddingModel {
    fn new(id: &str, embedding_dim: usize, description: &str) -> Self {
        Self {
            id: id.to_string(),
            embedding_dim,
            description: description.to_string(),
        }
    }
}

/// Lookup table used by remote providers to learn their output dimension
/// without issuing a probe request.
pub struct ModelRegistry {
    models: Vec<EmbeddingModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: default_models(),
        }
    }

    /// Finds a model by id. Ollama tags (`name:tag`) match on the name part.
    pub fn get(&self, id: &str) -> Option<&EmbeddingModel> {
        let base = id.split(':').next().unwrap_or(id);
        self.models
            .iter()
            .find(|m| m.id == id)
            .or_else(|| self.models.iter().find(|m| m.id == base))
    }

    pub fn dimension_of(&self, id: &str) -> Option<usize> {
        self.get(id).map(|m| m.embedding_dim)
    }

    pub fn all_models(&self) -> &[EmbeddingModel] {
        &self.models
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_models() -> Vec<EmbeddingModel> {
    vec![
        EmbeddingModel::new("BAAI/bge-base-en-v1.5", 768, "English general-purpose, base size"),
        EmbeddingModel::new("BAAI/bge-large-en-v1.5", 1024, "English general-purpose, large size"),
        EmbeddingModel::new("all-mpnet-base-v2", 768, "Sentence-transformers MPNet"),
        EmbeddingModel::new("all-MiniLM-L6-v2", 384, "Small and fast sentence-transformers model"),
        EmbeddingModel::new("all-MiniLM-L12-v2", 384, "Sentence-transformers MiniLM, 12 layers"),
        EmbeddingModel::new("nomic-embed-text", 768, "Ollama default embedding model"),
        EmbeddingModel::new("mxbai-embed-large", 1024, "Higher quality Ollama embedding model"),
        EmbeddingModel::new("text-embedding-3-small", 1536, "OpenAI small embedding model"),
        EmbeddingModel::new("text-embedding-3-large", 3072, "OpenAI large embedding model"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_models() {
        let registry = ModelRegistry::new();
        assert!(!registry.all_models().is_empty());
    }

    #[test]
    fn test_dimension_lookup() {
        let registry = ModelRegistry::new();
        assert_eq!(registry.dimension_of("all-MiniLM-L6-v2"), Some(384));
        assert_eq!(registry.dimension_of("BAAI/bge-base-en-v1.5"), Some(768));
        assert_eq!(registry.dimension_of("unknown-model"), None);
    }

    #[test]
    fn test_ollama_tag_matches_base_name() {
        let registry = ModelRegistry::new();
        assert_eq!(registry.dimension_of("nomic-embed-text:latest"), Some(768));
    }

    #[test]
    fn test_model_ids_unique() {
        let registry = ModelRegistry::new();
        let ids: Vec<_> = registry.all_models().iter().map(|m| m.id.as_str()).collect();
        let mut unique_ids = ids.clone();
        unique_ids.sort();
        unique_ids.dedup();
        assert_eq!(ids.len(), unique_ids.len(), "Model IDs must be unique");
    }
}
