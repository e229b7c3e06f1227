use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ScriptoriumConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub context: ContextConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub corpus_db: String,
    pub memory_db: String,
    pub audit_log: String,
    pub reader_pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hashed`, `local`, or `none`.
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexingConfig {
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Fusion {
    Weighted,
    Rrf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub candidate_multiplier: usize,
    pub fusion: Fusion,
    /// Share of the blended score taken from vector similarity (0.0 = lexical only).
    pub vector_weight: f64,
    pub rrf_k: usize,
    pub dedup_threshold: f64,
    pub technique_boost: f64,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub default_session: String,
    pub read_limit: usize,
    pub context_window: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub default_token_budget: usize,
    pub passages: usize,
    pub min_truncated_tokens: usize,
}

/// Describes the external inference service. Nothing in the memory or corpus
/// stores depends on these values.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InferenceConfig {
    pub model: String,
    pub endpoint: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 8765,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_scriptorium_dir().to_string_lossy().into_owned(),
            corpus_db: "corpus.db".into(),
            memory_db: "memory.db".into(),
            audit_log: "audit.jsonl".into(),
            reader_pool_size: 4,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_scriptorium_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "hashed".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 120,
            workers: 4,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            candidate_multiplier: 4,
            fusion: Fusion::Weighted,
            vector_weight: 0.3,
            rrf_k: 60,
            dedup_threshold: 0.8,
            technique_boost: 0.5,
            timeout_ms: 2000,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_session: "default".into(),
            read_limit: 30,
            context_window: 12,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_token_budget: 2000,
            passages: 5,
            min_truncated_tokens: 16,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: "qwen2.5:14b".into(),
            endpoint: "http://127.0.0.1:11434".into(),
        }
    }
}

/// Returns `~/.scriptorium/`
pub fn default_scriptorium_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".scriptorium")
}

/// Returns the default config file path: `~/.scriptorium/config.toml`
pub fn default_config_path() -> PathBuf {
    default_scriptorium_dir().join("config.toml")
}

impl ScriptoriumConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            ScriptoriumConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config rooted at `data_dir`, everything else default. Used by tests and embedders.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.as_ref().to_string_lossy().into_owned();
        config
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SCRIPTORIUM_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("SCRIPTORIUM_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("SCRIPTORIUM_INFERENCE_MODEL") {
            self.inference.model = val;
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.indexing.chunk_size >= 64, "indexing.chunk_size must be >= 64");
        anyhow::ensure!(
            self.indexing.chunk_overlap < self.indexing.chunk_size / 2,
            "indexing.chunk_overlap must be less than half of chunk_size"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.retrieval.vector_weight),
            "retrieval.vector_weight must be between 0.0 and 1.0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.retrieval.dedup_threshold),
            "retrieval.dedup_threshold must be between 0.0 and 1.0"
        );
        Ok(())
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn corpus_db_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.storage.corpus_db)
    }

    pub fn memory_db_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.storage.memory_db)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.storage.audit_log)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
