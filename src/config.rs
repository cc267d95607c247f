use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the ragvault service.
///
/// Values are read once at startup and handed to the constructors that need them; nothing in
/// the library reaches back into a global copy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base64-encoded 32-byte master key used to wrap tenant keys at rest.
    pub master_key: String,
    /// Persistence backend for documents, chunks and wrapped keys.
    pub store_backend: StoreBackend,
    /// SQLite database file (used when `store_backend` is SQLite).
    pub database_path: String,
    /// Vector index engine backing tenant namespaces.
    pub index_backend: IndexBackend,
    /// Base URL of the Qdrant instance (required when `index_backend` is Qdrant).
    pub qdrant_url: Option<String>,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Prefix applied to every tenant namespace name.
    pub namespace_prefix: String,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL for the Ollama runtime (embeddings and answer generation).
    pub ollama_url: Option<String>,
    /// Provider used for grounded-answer synthesis.
    pub generation_provider: GenerationProvider,
    /// Model identifier used for grounded-answer synthesis.
    pub generation_model: String,
    /// Tokenizer used to measure chunk sizes (model or encoding name, or `approx`).
    pub chunk_tokenizer: String,
    /// Upper token bound for a single chunk.
    pub chunk_max_tokens: usize,
    /// Target token overlap between adjacent chunks.
    pub chunk_overlap: usize,
    /// Number of chunks embedded and upserted per batch.
    pub embedding_batch_size: usize,
    /// Seconds an unwrapped tenant key stays cached.
    pub key_cache_ttl_secs: u64,
    /// Retries granted to a queued ingestion after its first failed run.
    pub ingest_max_retries: u32,
    /// Number of documents the worker pool processes concurrently.
    pub ingest_workers: usize,
    /// Upper bound for one search request, end to end.
    pub search_timeout_ms: u64,
    /// Result count used when the caller does not specify one.
    pub search_default_top_k: usize,
    /// Largest result count a caller may request.
    pub search_max_top_k: usize,
    /// Root directory for locally stored uploads.
    pub storage_root: String,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported persistence backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process memory; everything is lost on restart.
    Memory,
    /// Local SQLite file.
    Sqlite,
}

/// Supported vector index engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexBackend {
    /// In-process exact index, suitable for development and tests.
    Memory,
    /// Remote Qdrant instance accessed over HTTP.
    Qdrant,
}

/// Supported embedding backends for the processing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Deterministic byte-hash embeddings; no external service required.
    Hash,
    /// Local Ollama runtime.
    Ollama,
}

/// Supported answer-generation backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationProvider {
    /// Grounded-answer synthesis disabled.
    None,
    /// Local Ollama runtime.
    Ollama,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// `from_env` is a thin wrapper; tests feed a map instead of mutating the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| {
            optional(key).ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
        };

        let config = Self {
            master_key: required("MASTER_KEY")?,
            store_backend: parse_or("STORE_BACKEND", optional("STORE_BACKEND"), StoreBackend::Memory)?,
            database_path: optional("DATABASE_PATH").unwrap_or_else(|| "./ragvault.db".into()),
            index_backend: parse_or("INDEX_BACKEND", optional("INDEX_BACKEND"), IndexBackend::Memory)?,
            qdrant_url: optional("QDRANT_URL"),
            qdrant_api_key: optional("QDRANT_API_KEY"),
            namespace_prefix: optional("NAMESPACE_PREFIX").unwrap_or_else(|| "tenant".into()),
            embedding_provider: parse_or(
                "EMBEDDING_PROVIDER",
                optional("EMBEDDING_PROVIDER"),
                EmbeddingProvider::Hash,
            )?,
            embedding_model: optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".into()),
            embedding_dimension: parse_or(
                "EMBEDDING_DIMENSION",
                optional("EMBEDDING_DIMENSION"),
                768,
            )?,
            ollama_url: optional("OLLAMA_URL"),
            generation_provider: parse_or(
                "GENERATION_PROVIDER",
                optional("GENERATION_PROVIDER"),
                GenerationProvider::None,
            )?,
            generation_model: optional("GENERATION_MODEL").unwrap_or_else(|| "llama3.1".into()),
            chunk_tokenizer: optional("CHUNK_TOKENIZER").unwrap_or_else(|| "cl100k_base".into()),
            chunk_max_tokens: parse_or("CHUNK_MAX_TOKENS", optional("CHUNK_MAX_TOKENS"), 512)?,
            chunk_overlap: parse_or("CHUNK_OVERLAP", optional("CHUNK_OVERLAP"), 50)?,
            embedding_batch_size: parse_or(
                "EMBEDDING_BATCH_SIZE",
                optional("EMBEDDING_BATCH_SIZE"),
                32,
            )?,
            key_cache_ttl_secs: parse_or(
                "KEY_CACHE_TTL_SECS",
                optional("KEY_CACHE_TTL_SECS"),
                300,
            )?,
            ingest_max_retries: parse_or(
                "INGEST_MAX_RETRIES",
                optional("INGEST_MAX_RETRIES"),
                3,
            )?,
            ingest_workers: parse_or("INGEST_WORKERS", optional("INGEST_WORKERS"), 4)?,
            search_timeout_ms: parse_or(
                "SEARCH_TIMEOUT_MS",
                optional("SEARCH_TIMEOUT_MS"),
                10_000,
            )?,
            search_default_top_k: parse_or(
                "SEARCH_DEFAULT_TOP_K",
                optional("SEARCH_DEFAULT_TOP_K"),
                10,
            )?,
            search_max_top_k: parse_or("SEARCH_MAX_TOP_K", optional("SEARCH_MAX_TOP_K"), 50)?,
            storage_root: optional("STORAGE_ROOT").unwrap_or_else(|| "./uploads".into()),
            server_port: optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.index_backend == IndexBackend::Qdrant && self.qdrant_url.is_none() {
            return Err(ConfigError::MissingVariable("QDRANT_URL".into()));
        }
        // A durable index next to volatile keys would outlive the keys that sealed it.
        if self.index_backend == IndexBackend::Qdrant && self.store_backend == StoreBackend::Memory
        {
            return Err(ConfigError::InvalidValue("STORE_BACKEND".into()));
        }
        if self.namespace_prefix.is_empty()
            || !self
                .namespace_prefix
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(ConfigError::InvalidValue("NAMESPACE_PREFIX".into()));
        }
        if self.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        if self.chunk_max_tokens == 0 {
            return Err(ConfigError::InvalidValue("CHUNK_MAX_TOKENS".into()));
        }
        if self.embedding_batch_size == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_BATCH_SIZE".into()));
        }
        if self.search_default_top_k == 0 || self.search_max_top_k < self.search_default_top_k {
            return Err(ConfigError::InvalidValue("SEARCH_DEFAULT_TOP_K".into()));
        }
        Ok(())
    }

    /// Key cache entry lifetime.
    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }

    /// Search latency budget.
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for IndexBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for GenerationProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

/// Load `.env` (when present) and then the process environment.
pub fn load_config() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        store_backend = ?config.store_backend,
        index_backend = ?config.index_backend,
        qdrant_url = ?config.qdrant_url,
        embedding_provider = ?config.embedding_provider,
        embedding_dimension = config.embedding_dimension,
        generation_provider = ?config.generation_provider,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    Ok(config)
}
