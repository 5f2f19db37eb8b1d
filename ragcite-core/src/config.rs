use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the whole retrieval pipeline.
///
/// Every component receives the section it needs at construction time; nothing
/// reads configuration from global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    /// Deadline applied to every external call (embedding, index, LLM)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Number of documents ingested concurrently
    #[serde(default = "default_ingest_concurrency")]
    pub ingest_concurrency: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Embedding provider selection.
///
/// `provider` is the factory key: `ollama`, `openai`, `local` or `hashing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Explicit output dimension. Required for remote models missing from the registry.
    #[serde(default)]
    pub dimension: Option<usize>,
    /// Environment variable holding the API key (remote APIs only)
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Directory with config.json, tokenizer.json and model.safetensors (local provider)
    #[serde(default)]
    pub model_dir: Option<String>,
    /// Maximum number of texts sent per embedding request
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

/// Semantic chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Percentile of consecutive-sentence distances above which a boundary is placed
    #[serde(default = "default_breakpoint_percentile")]
    pub breakpoint_percentile: f32,
    /// Soft target chunk length in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap used when an oversized segment is split by size
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Split semantic segments longer than `chunk_size` with a sliding window
    #[serde(default)]
    pub enforce_max_size: bool,
}

/// Retrieval parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidate pool for MMR. Defaults to `top_k * 4`.
    #[serde(default)]
    pub fetch_k: Option<usize>,
    /// 1.0 = pure relevance, 0.0 = pure diversity
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
}

/// Configuration for the answer-generating model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `ollama` or `mistralrs`
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f64,
}

/// Vector database storage mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StorageMode {
    /// In-process, non-persistent storage
    Memory,
    /// Embedded storage - runs in-process with zero setup (default)
    Embedded { path: String },
    /// gRPC storage - connect to external vector database server
    Grpc { url: String },
}

impl Default for StorageMode {
    fn default() -> Self {
        Self::Embedded {
            path: "./data/ragcite_vectordb".to_string(),
        }
    }
}

/// Storage configuration for the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub vector_db: VectorDbConfig,
    /// Records written per upsert request
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
}

/// Vector database configuration (collection/index name, etc.).
///
/// Provider-agnostic configuration that works with any vector DB backend
/// (Qdrant, LanceDB, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDbConfig {
    /// Collection/index name for storing vectors
    pub collection_name: String,
}

/// Configuration for document loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// File extensions to load (without the dot)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Path components containing any of these strings are skipped
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Descend into subdirectories when loading a directory
    #[serde(default)]
    pub recursive: bool,
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_ingest_concurrency() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_breakpoint_percentile() -> f32 {
    95.0
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_top_k() -> usize {
    5
}

fn default_mmr_lambda() -> f32 {
    0.5
}

fn default_upsert_batch_size() -> usize {
    100
}

fn default_extensions() -> Vec<String> {
    vec!["txt".to_string(), "md".to_string(), "markdown".to_string()]
}

fn default_exclude_patterns() -> Vec<String> {
    [".git", "node_modules", "target", "__pycache__", ".venv"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "nomic-embed-text".to_string(),
            base_url: Some("http://localhost:11434".to_string()),
            dimension: None,
            api_key_env: default_api_key_env(),
            model_dir: None,
            batch_size: default_embedding_batch_size(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            breakpoint_percentile: default_breakpoint_percentile(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            enforce_max_size: false,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fetch_k: None,
            mmr_lambda: default_mmr_lambda(),
        }
    }
}

impl RetrievalConfig {
    /// Size of the MMR candidate pool for a request of `top_k` results.
    pub fn fetch_k_for(&self, top_k: usize) -> usize {
        self.fetch_k.unwrap_or(top_k.saturating_mul(4)).max(top_k)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.2:latest".to_string(),
            base_url: "http://localhost:11434".to_string(),
            temperature: 0.7,
        }
    }
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            collection_name: "ragcite_documents".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::default(),
            vector_db: VectorDbConfig::default(),
            upsert_batch_size: default_upsert_batch_size(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            exclude_patterns: default_exclude_patterns(),
            recursive: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            storage: StorageConfig::default(),
            loader: LoaderConfig::default(),
            request_timeout_secs: default_request_timeout_secs(),
            ingest_concurrency: default_ingest_concurrency(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `config.yaml` if it exists, otherwise use defaults.
    pub fn load_or_default() -> Self {
        Self::load("config.yaml").unwrap_or_default()
    }

    /// Timeout applied to each external call.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Checks value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if !(0.0..=100.0).contains(&chunking.breakpoint_percentile) {
            return Err(invalid(format!(
                "chunking.breakpoint_percentile must be within 0..=100, got {}",
                chunking.breakpoint_percentile
            )));
        }
        if chunking.chunk_size == 0 {
            return Err(invalid("chunking.chunk_size must be positive"));
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            return Err(invalid("chunking.chunk_overlap must be less than chunking.chunk_size"));
        }

        let retrieval = &self.retrieval;
        if !(1..=20).contains(&retrieval.top_k) {
            return Err(invalid(format!(
                "retrieval.top_k must be within 1..=20, got {}",
                retrieval.top_k
            )));
        }
        if !(0.0..=1.0).contains(&retrieval.mmr_lambda) {
            return Err(invalid(format!(
                "retrieval.mmr_lambda must be within 0..=1, got {}",
                retrieval.mmr_lambda
            )));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(invalid(format!(
                "llm.temperature must be within 0..=2, got {}",
                self.llm.temperature
            )));
        }

        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be positive"));
        }
        if self.embedding.dimension == Some(0) {
            return Err(invalid("embedding.dimension must be positive"));
        }
        if self.storage.upsert_batch_size == 0 {
            return Err(invalid("storage.upsert_batch_size must be positive"));
        }
        if self.ingest_concurrency == 0 {
            return Err(invalid("ingest_concurrency must be positive"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
