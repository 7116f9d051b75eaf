use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Transport the MCP server listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// JSON-RPC over stdin/stdout.
    Stdio,
    /// Streamable HTTP on `host:port`.
    #[default]
    #[serde(alias = "sse")]
    Http,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" | "sse" => Ok(Self::Http),
            other => Err(format!("unknown transport '{other}', expected stdio or http")),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// Distance function used by the vector store for nearest-neighbour queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Squared Euclidean distance.
    #[default]
    #[serde(rename = "l2")]
    L2,
    /// `1 - cosine_similarity`.
    #[serde(rename = "cosine")]
    Cosine,
    /// `1 - dot_product`.
    #[serde(rename = "ip")]
    InnerProduct,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L2 => "l2",
            Self::Cosine => "cosine",
            Self::InnerProduct => "ip",
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" => Ok(Self::L2),
            "cosine" => Ok(Self::Cosine),
            "ip" => Ok(Self::InnerProduct),
            other => Err(format!("unknown distance '{other}', expected l2, cosine or ip")),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which embedding backend turns text into vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// On-device model (requires the `local-embeddings` feature).
    Local,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    #[serde(alias = "google")]
    Gemini,
    /// Deterministic feature hashing, no model download.
    Hash,
}

impl FromStr for EmbeddingProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "fastembed" => Ok(Self::Local),
            "openai" | "openrouter" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "gemini" | "google" => Ok(Self::Gemini),
            "hash" => Ok(Self::Hash),
            other => Err(format!("unknown embedding provider '{other}'")),
        }
    }
}

impl fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
            Self::Hash => "hash",
        };
        f.write_str(s)
    }
}

/// Embedding provider configuration.
///
/// Unset fields fall back to the selected provider's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider to use. When absent the memory crate picks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<EmbeddingProviderKind>,
    /// Model name (e.g. "all-MiniLM-L6-v2", "text-embedding-3-small").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Vector dimensions. Must match any existing collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    /// API key for remote providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL override for remote providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding the vector store files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Collection name inside the store.
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    /// Distance metric for new collections.
    #[serde(default)]
    pub distance: DistanceMetric,
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Characters of content echoed back in the save confirmation.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// Directory for exports written without an explicit filename.
    /// `None` means the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./memkeep_db")
}

fn default_collection_name() -> String {
    "mcp_memories".to_string()
}

fn default_preview_chars() -> usize {
    100
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            collection_name: default_collection_name(),
            distance: DistanceMetric::default(),
            embedding: EmbeddingConfig::default(),
            preview_chars: default_preview_chars(),
            export_dir: None,
        }
    }
}

/// MCP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to (http transport).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on (http transport).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8050
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: Transport::default(),
        }
    }
}

/// Top-level memkeep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemkeepConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Partition key used by the tool surface.
    #[serde(default = "default_user_id")]
    pub default_user_id: String,
}

fn default_user_id() -> String {
    "user".to_string()
}

impl Default for MemkeepConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            memory: MemoryConfig::default(),
            default_user_id: default_user_id(),
        }
    }
}

/// Resolve the memkeep config directory (~/.memkeep/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".memkeep"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.memkeep/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, then apply environment overrides.
pub fn load_config() -> Result<MemkeepConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    let mut config = load_config_from(&path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<MemkeepConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(MemkeepConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: MemkeepConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut MemkeepConfig) -> Result<(), ConfigError> {
    apply_overrides_with(config, |key| std::env::var(key).ok())
}

/// Apply overrides from an arbitrary key lookup. Empty values are ignored.
pub fn apply_overrides_with<F>(config: &mut MemkeepConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(host) = get("HOST") {
        config.server.host = host;
    }
    if let Some(port) = get("PORT") {
        config.server.port = parse_value("PORT", &port)?;
    }
    if let Some(transport) = get("TRANSPORT") {
        config.server.transport = parse_value("TRANSPORT", &transport)?;
    }
    if let Some(user) = get("MEMKEEP_USER_ID") {
        config.default_user_id = user;
    }
    if let Some(dir) = get("MEMKEEP_DATA_DIR") {
        config.memory.data_dir = PathBuf::from(dir);
    }
    if let Some(name) = get("MEMKEEP_COLLECTION") {
        config.memory.collection_name = name;
    }
    if let Some(distance) = get("MEMKEEP_DISTANCE") {
        config.memory.distance = parse_value("MEMKEEP_DISTANCE", &distance)?;
    }
    if let Some(dir) = get("MEMKEEP_EXPORT_DIR") {
        config.memory.export_dir = Some(PathBuf::from(dir));
    }

    let embedding = &mut config.memory.embedding;
    if let Some(provider) = get("EMBEDDING_PROVIDER") {
        embedding.provider = Some(parse_value("EMBEDDING_PROVIDER", &provider)?);
    }
    if let Some(model) = get("EMBEDDING_MODEL_CHOICE") {
        embedding.model = Some(model);
    }
    if let Some(dims) = get("EMBEDDING_DIMENSIONS") {
        embedding.dimensions = Some(parse_value("EMBEDDING_DIMENSIONS", &dims)?);
    }
    if let Some(key) = get("EMBEDDING_API_KEY") {
        embedding.api_key = Some(key);
    }
    if let Some(url) = get("EMBEDDING_BASE_URL") {
        embedding.base_url = Some(url);
    }

    Ok(())
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}
