#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Output dimension of all-MiniLM-L6-v2, the model behind the default embedding service.
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 384;
pub const DEFAULT_NLIST: u32 = 128;
pub const DEFAULT_NPROBE: u32 = 10;
pub const DEFAULT_QUERY_LIMIT: usize = 10;
pub const DEFAULT_TOKENS_PER_WORD: f64 = 1.3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub summarization: SummarizationConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Wire format the embedding service uses for vectors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingEncoding {
    /// Plain JSON float arrays
    Plain,
    /// Base64 of little-endian half floats
    #[default]
    Base64F16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub batch_size: u32,
    pub dimension: u32,
    pub encoding: EmbeddingEncoding,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 7050,
            batch_size: 16,
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            encoding: EmbeddingEncoding::default(),
            timeout_seconds: 30,
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub min_length: u32,
    pub max_length: u32,
    /// Words-to-tokens ratio used to cap `max_length` for short inputs.
    pub tokens_per_word: f64,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 7000,
            min_length: 50,
            max_length: 250,
            tokens_per_word: DEFAULT_TOKENS_PER_WORD,
            timeout_seconds: 60,
            retry_attempts: 3,
        }
    }
}

/// Storage engine behind the vector index.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    /// Built-in segment store with per-segment IVF_FLAT indexes
    #[default]
    Segment,
    /// LanceDB table with an IVF_FLAT index
    Lance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackend,
    pub collection: String,
    pub nlist: u32,
    pub nprobe: u32,
    pub default_limit: usize,
    /// Rows a growing segment accepts before it is sealed and indexed.
    pub segment_seal_rows: usize,
    pub operation_timeout_seconds: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            collection: "documents".to_string(),
            nlist: DEFAULT_NLIST,
            nprobe: DEFAULT_NPROBE,
            default_limit: DEFAULT_QUERY_LIMIT,
            segment_seal_rows: 4096,
            operation_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid embedding dimension: {0} (must be between 2 and 8192)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid summary bounds: min {0} must be below max {1}")]
    InvalidSummaryBounds(u32, u32),
    #[error("Invalid tokens per word ratio: {0} (must be above 0 and at most 10)")]
    InvalidTokensPerWord(f64),
    #[error("Invalid collection name: {0:?} (letters, digits and underscores only)")]
    InvalidCollectionName(String),
    #[error("Invalid nlist: {0} (must be between 1 and 65536)")]
    InvalidNlist(u32),
    #[error("Invalid nprobe: {0} (must be between 1 and nlist {1})")]
    InvalidNprobe(u32, u32),
    #[error("Invalid default query limit: {0} (must be between 1 and 16384)")]
    InvalidQueryLimit(usize),
    #[error("Invalid segment seal threshold: {0} (must be at least 1)")]
    InvalidSealRows(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Default configuration directory, `~/.rag-search`
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".rag-search"))
            .or({
                #[cfg(windows)]
                {
                    dirs::data_dir().map(|data| data.join("rag-search"))
                }
                #[cfg(not(windows))]
                {
                    None
                }
            })
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.summarization.validate()?;
        self.index.validate()?;
        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Directory holding the segment store for the configured collection
    #[inline]
    pub fn collection_path(&self) -> PathBuf {
        self.get_base_dir()
            .join("collections")
            .join(&self.index.collection)
    }

    /// Directory holding the LanceDB database
    #[inline]
    pub fn lance_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }
}

fn validate_endpoint(protocol: &str, host: &str, port: u16) -> Result<Url, ConfigError> {
    if protocol != "http" && protocol != "https" {
        return Err(ConfigError::InvalidProtocol(protocol.to_string()));
    }

    if port == 0 {
        return Err(ConfigError::InvalidPort(port));
    }

    let url_str = format!("{}://{}:{}", protocol, host, port);
    Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
}

fn validate_timeout(seconds: u64) -> Result<(), ConfigError> {
    if !(1..=600).contains(&seconds) {
        return Err(ConfigError::InvalidTimeout(seconds));
    }
    Ok(())
}

fn validate_retry_attempts(attempts: u32) -> Result<(), ConfigError> {
    if !(1..=10).contains(&attempts) {
        return Err(ConfigError::InvalidRetryAttempts(attempts));
    }
    Ok(())
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.protocol, &self.host, self.port)?;

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(2..=8192).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }

        validate_timeout(self.timeout_seconds)?;
        validate_retry_attempts(self.retry_attempts)?;
        Ok(())
    }

    pub fn url(&self) -> Result<Url, ConfigError> {
        validate_endpoint(&self.protocol, &self.host, self.port)
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        validate_endpoint(&self.protocol, &host, self.port)?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    pub fn set_dimension(&mut self, dimension: u32) -> Result<(), ConfigError> {
        if !(2..=8192).contains(&dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(dimension));
        }
        self.dimension = dimension;
        Ok(())
    }
}

impl SummarizationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.protocol, &self.host, self.port)?;

        if self.min_length >= self.max_length {
            return Err(ConfigError::InvalidSummaryBounds(
                self.min_length,
                self.max_length,
            ));
        }

        if !(self.tokens_per_word > 0.0 && self.tokens_per_word <= 10.0) {
            return Err(ConfigError::InvalidTokensPerWord(self.tokens_per_word));
        }

        validate_timeout(self.timeout_seconds)?;
        validate_retry_attempts(self.retry_attempts)?;
        Ok(())
    }

    pub fn url(&self) -> Result<Url, ConfigError> {
        validate_endpoint(&self.protocol, &self.host, self.port)
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        validate_endpoint(&self.protocol, &host, self.port)?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_bounds(&mut self, min_length: u32, max_length: u32) -> Result<(), ConfigError> {
        if min_length >= max_length {
            return Err(ConfigError::InvalidSummaryBounds(min_length, max_length));
        }
        self.min_length = min_length;
        self.max_length = max_length;
        Ok(())
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.is_empty()
            || !self
                .collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::InvalidCollectionName(self.collection.clone()));
        }

        if !(1..=65536).contains(&self.nlist) {
            return Err(ConfigError::InvalidNlist(self.nlist));
        }

        if self.nprobe == 0 || self.nprobe > self.nlist {
            return Err(ConfigError::InvalidNprobe(self.nprobe, self.nlist));
        }

        if !(1..=16384).contains(&self.default_limit) {
            return Err(ConfigError::InvalidQueryLimit(self.default_limit));
        }

        if self.segment_seal_rows == 0 {
            return Err(ConfigError::InvalidSealRows(self.segment_seal_rows));
        }

        validate_timeout(self.operation_timeout_seconds)?;
        Ok(())
    }

    pub fn set_nprobe(&mut self, nprobe: u32) -> Result<(), ConfigError> {
        if nprobe == 0 || nprobe > self.nlist {
            return Err(ConfigError::InvalidNprobe(nprobe, self.nlist));
        }
        self.nprobe = nprobe;
        Ok(())
    }
}
