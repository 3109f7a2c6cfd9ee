//! Configuration for the filing index.
//!
//! Supports both environment variables and a YAML config file.
//! Environment variables take precedence over config file values.
//! The resulting `Config` is immutable and passed by value (or `Arc`)
//! to every component constructor.

use crate::error::{FilingIndexError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// LLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the LLM API (e.g. "https://openrouter.ai/api").
    pub base_url: String,

    /// API key for authentication.
    pub api_key: String,

    /// Model name.
    pub model: String,

    /// Maximum tokens for a response.
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f32,

    /// Bounded retry count for transient failures.
    #[serde(default = "default_llm_retries")]
    pub retries: u32,

    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_max_tokens() -> u32 {
    4096
}

fn default_llm_retries() -> u32 {
    10
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model: "openai/gpt-4o".to_string(),
            max_tokens: default_llm_max_tokens(),
            temperature: 0.0,
            retries: default_llm_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Embedding service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding service (e.g. "http://localhost:11435").
    pub url: String,

    /// Embedding model name.
    pub model: String,

    /// Output vector dimension; must match the service's output.
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,

    /// Texts per remote batch call.
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,

    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_embedding_dim() -> usize {
    768
}

fn default_embed_batch_size() -> usize {
    32
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11435".to_string(),
            model: "nomic-embed-text-v2-moe".to_string(),
            dim: default_embedding_dim(),
            batch_size: default_embed_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path.
    pub database_path: PathBuf,

    /// Directory where ingested PDFs are copied.
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/filing_index.db"),
            upload_dir: PathBuf::from("data/uploads"),
        }
    }
}

/// Tree generation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Pages scanned for a table of contents.
    #[serde(default = "default_toc_check_pages")]
    pub toc_check_pages: usize,

    /// Pages either side of a ToC entry's declared page searched when
    /// verifying that the title actually appears there.
    #[serde(default = "default_toc_match_window")]
    pub toc_match_window: usize,

    /// A node spanning more pages than this is subdivided.
    #[serde(default = "default_max_pages_per_node")]
    pub max_pages_per_node: usize,

    /// A node with more tokens than this is subdivided.
    #[serde(default = "default_max_tokens_per_node")]
    pub max_tokens_per_node: usize,

    /// Minimum coverage score for accepting a proposed subdivision.
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f64,
}

fn default_toc_check_pages() -> usize {
    20
}

fn default_toc_match_window() -> usize {
    2
}

fn default_max_pages_per_node() -> usize {
    10
}

fn default_max_tokens_per_node() -> usize {
    20000
}

fn default_accuracy_threshold() -> f64 {
    0.6
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            toc_check_pages: default_toc_check_pages(),
            toc_match_window: default_toc_match_window(),
            max_pages_per_node: default_max_pages_per_node(),
            max_tokens_per_node: default_max_tokens_per_node(),
            accuracy_threshold: default_accuracy_threshold(),
        }
    }
}

/// Chunking tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_chunk_overlap_tokens")]
    pub overlap_tokens: usize,

    #[serde(default = "default_chunk_min_tokens")]
    pub min_tokens: usize,
}

fn default_chunk_max_tokens() -> usize {
    512
}

fn default_chunk_overlap_tokens() -> usize {
    64
}

fn default_chunk_min_tokens() -> usize {
    32
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_chunk_overlap_tokens(),
            min_tokens: default_chunk_min_tokens(),
        }
    }
}

/// Retrieval tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Token budget for the assembled answer context.
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,

    /// Nodes returned by value search per (sub-question, document) pair.
    #[serde(default = "default_value_search_top_k")]
    pub value_search_top_k: usize,

    /// Cap on outstanding LLM calls during fan-out.
    #[serde(default = "default_retrieval_concurrency")]
    pub concurrency: usize,
}

fn default_context_budget_tokens() -> usize {
    50000
}

fn default_value_search_top_k() -> usize {
    20
}

fn default_retrieval_concurrency() -> usize {
    8
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            context_budget_tokens: default_context_budget_tokens(),
            value_search_top_k: default_value_search_top_k(),
            concurrency: default_retrieval_concurrency(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// HTTP server bind address.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
}

fn default_server_addr() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig::default(),
            tree: TreeConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            server_addr: default_server_addr(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_BASE_URL, LLM_API_KEY, ...)
    /// 2. Config file (~/.config/filing-index/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FilingIndexError::io(path, e))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| FilingIndexError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = env::var("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = env::var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = env::var("LLM_RETRIES") {
            if let Ok(n) = v.parse() {
                self.llm.retries = n;
            }
        }
        if let Ok(v) = env::var("EMBEDDING_URL") {
            self.embedding.url = v;
        }
        if let Ok(v) = env::var("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = env::var("EMBEDDING_DIM") {
            if let Ok(n) = v.parse() {
                self.embedding.dim = n;
            }
        }
        if let Ok(v) = env::var("EMBED_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.embedding.batch_size = n;
            }
        }
        if let Ok(v) = env::var("DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SERVER_ADDR") {
            self.server_addr = v;
        }
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "filing-index")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.llm.base_url.is_empty() {
            return Err(FilingIndexError::Config(
                "LLM base URL is required. Set LLM_BASE_URL or add to config file.".to_string(),
            ));
        }

        if self.llm.api_key.is_empty() {
            return Err(FilingIndexError::Config(
                "LLM API key is required. Set LLM_API_KEY or add to config file.".to_string(),
            ));
        }

        if self.llm.model.is_empty() {
            return Err(FilingIndexError::Config(
                "LLM model is required. Set LLM_MODEL or add to config file.".to_string(),
            ));
        }

        if self.embedding.url.is_empty() {
            return Err(FilingIndexError::Config(
                "Embedding service URL is required. Set EMBEDDING_URL or add to config file."
                    .to_string(),
            ));
        }

        if self.embedding.dim == 0 {
            return Err(FilingIndexError::Config(
                "Embedding dimension must be non-zero.".to_string(),
            ));
        }

        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(FilingIndexError::Config(
                "chunking.overlap_tokens must be smaller than chunking.max_tokens.".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a config from explicit LLM values (useful for testing).
    pub fn with_llm(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm: LlmConfig {
                base_url: base_url.into(),
                api_key: api_key.into(),
                model: model.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.llm.base_url.is_empty());
        assert_eq!(config.llm.retries, 10);
        assert_eq!(config.embedding.dim, 768);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.tree.toc_check_pages, 20);
        assert_eq!(config.tree.max_pages_per_node, 10);
        assert_eq!(config.tree.max_tokens_per_node, 20000);
        assert!((config.tree.accuracy_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.chunking.max_tokens, 512);
        assert_eq!(config.chunking.overlap_tokens, 64);
        assert_eq!(config.chunking.min_tokens, 32);
        assert_eq!(config.retrieval.context_budget_tokens, 50000);
        assert_eq!(config.retrieval.value_search_top_k, 20);
        assert_eq!(config.retrieval.concurrency, 8);
    }

    #[test]
    fn test_validate_fails_without_required_fields() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_llm() {
        let config = Config::with_llm("https://api.example.com", "test-key", "gpt-4o");
        assert_eq!(config.llm.base_url, "https://api.example.com");
        assert_eq!(config.llm.api_key, "test-key");
        assert_eq!(config.llm.model, "gpt-4o");
    }

    #[test]
    fn test_validate_rejects_overlap_ge_max() {
        let mut config = Config::with_llm("https://api.example.com", "k", "m");
        config.chunking.overlap_tokens = config.chunking.max_tokens;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_partial_file_uses_defaults() {
        let yaml = r#"
llm:
  base_url: "https://api.example.com"
  api_key: "key"
  model: "gpt-4o"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.base_url, "https://api.example.com");
        assert_eq!(config.embedding.dim, 768);
        assert_eq!(config.retrieval.value_search_top_k, 20);
    }
}
