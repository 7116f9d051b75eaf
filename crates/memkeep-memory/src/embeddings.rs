//! Embedding providers for vector storage.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use memkeep_config::{EmbeddingConfig, EmbeddingProviderKind};

use crate::error::{MemoryError, MemoryResult};

/// Trait for embedding text into vectors.
///
/// Implementations are deterministic for identical input within a process and
/// always return vectors of exactly [`dimensions`](Self::dimensions) floats.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier.
    fn id(&self) -> &str;
    /// Model name.
    fn model(&self) -> &str;
    /// Vector dimensions.
    fn dimensions(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::Embedding("Empty embedding result".into()))
    }
    /// Embed a batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>>;
}

fn check_dimensions(expected: usize, embeddings: &[Vec<f32>]) -> MemoryResult<()> {
    match embeddings.iter().find(|e| e.len() != expected) {
        Some(bad) => Err(MemoryError::DimensionMismatch {
            expected,
            actual: bad.len(),
        }),
        None => Ok(()),
    }
}

fn check_count(expected: usize, embeddings: &[Vec<f32>]) -> MemoryResult<()> {
    if embeddings.len() != expected {
        return Err(MemoryError::Embedding(format!(
            "expected {expected} embeddings, provider returned {}",
            embeddings.len()
        )));
    }
    Ok(())
}

fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

fn api_error_message(json: &serde_json::Value) -> &str {
    json.get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown error")
}

fn parse_float_array(value: Option<&serde_json::Value>, what: &str) -> MemoryResult<Vec<f32>> {
    let array = value
        .and_then(|e| e.as_array())
        .ok_or_else(|| MemoryError::Embedding(format!("Missing {what} array")))?;
    Ok(array
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect())
}

/// OpenAI (or OpenAI-compatible) embedding provider.
pub struct OpenAiEmbedding {
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedding {
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";
    pub const DEFAULT_DIMENSIONS: usize = 1536;
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    pub fn new(api_key: String) -> Self {
        Self::with_model(
            api_key,
            Self::DEFAULT_MODEL.to_string(),
            Self::DEFAULT_DIMENSIONS,
        )
    }

    pub fn with_model(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            api_key,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            model,
            dimensions,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    fn id(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let json: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            let msg = api_error_message(&json);
            return Err(MemoryError::Embedding(format!(
                "OpenAI embedding error: {msg}"
            )));
        }

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| MemoryError::Embedding("Invalid embedding response format".into()))?;

        let mut embeddings = Vec::with_capacity(texts.len());
        for item in data {
            embeddings.push(parse_float_array(item.get("embedding"), "embedding")?);
        }

        check_count(texts.len(), &embeddings)?;
        check_dimensions(self.dimensions, &embeddings)?;
        Ok(embeddings)
    }
}

/// Ollama embedding provider (`/api/embed`).
pub struct OllamaEmbedding {
    base_url: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
}

impl OllamaEmbedding {
    pub const DEFAULT_MODEL: &'static str = "nomic-embed-text";
    pub const DEFAULT_DIMENSIONS: usize = 768;
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    pub fn new(base_url: impl Into<String>, model: String, dimensions: usize) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
            dimensions,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    fn id(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let json: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            let msg = api_error_message(&json);
            return Err(MemoryError::Embedding(format!(
                "Ollama embedding error: {msg}"
            )));
        }

        let data = json
            .get("embeddings")
            .and_then(|d| d.as_array())
            .ok_or_else(|| MemoryError::Embedding("Invalid embedding response format".into()))?;

        let embeddings = data
            .iter()
            .map(|item| parse_float_array(Some(item), "embedding"))
            .collect::<MemoryResult<Vec<_>>>()?;

        check_count(texts.len(), &embeddings)?;
        check_dimensions(self.dimensions, &embeddings)?;
        Ok(embeddings)
    }
}

/// Google Gemini embedding provider (`batchEmbedContents`).
pub struct GeminiEmbedding {
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
}

impl GeminiEmbedding {
    pub const DEFAULT_MODEL: &'static str = "gemini-embedding-001";
    pub const DEFAULT_DIMENSIONS: usize = 768;
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn new(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            api_key,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            model,
            dimensions,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    fn id(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let model_path = format!("models/{}", self.model);
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": model_path,
                    "content": { "parts": [{ "text": text }] },
                    "outputDimensionality": self.dimensions,
                })
            })
            .collect();

        let resp = self
            .client
            .post(format!(
                "{}/{model_path}:batchEmbedContents",
                self.base_url
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await?;

        let status = resp.status();
        let json: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            let msg = api_error_message(&json);
            return Err(MemoryError::Embedding(format!(
                "Gemini embedding error: {msg}"
            )));
        }

        let data = json
            .get("embeddings")
            .and_then(|d| d.as_array())
            .ok_or_else(|| MemoryError::Embedding("Invalid embedding response format".into()))?;

        let embeddings = data
            .iter()
            .map(|item| parse_float_array(item.get("values"), "values"))
            .collect::<MemoryResult<Vec<_>>>()?;

        check_count(texts.len(), &embeddings)?;
        check_dimensions(self.dimensions, &embeddings)?;
        Ok(embeddings)
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lower-cased alphanumeric token is hashed with SHA-256 into a signed
/// bucket; the result is L2-normalised. Texts sharing words land close
/// together, which is enough for offline use and tests, but it has no notion
/// of synonyms.
#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dimensions: usize,
}

impl HashEmbedding {
    pub const MODEL: &'static str = "feature-hash-sha256";
    pub const DEFAULT_DIMENSIONS: usize = 384;

    pub fn new(dimensions: usize) -> MemoryResult<Self> {
        if dimensions == 0 {
            return Err(MemoryError::Config(
                "hash embedding dimensions must be positive".into(),
            ));
        }
        Ok(Self { dimensions })
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(head) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self {
            dimensions: Self::DEFAULT_DIMENSIONS,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    fn id(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        Self::MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// On-device embedding model backed by fastembed (ONNX runtime).
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedding {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_name: String,
    dimensions: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedding {
    pub const DEFAULT_MODEL: &'static str = "all-MiniLM-L6-v2";

    /// Load the model. Downloads it on first use; this blocks for seconds.
    pub fn load(model_name: &str) -> MemoryResult<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let (model, dimensions) = match model_name {
            "all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
                (EmbeddingModel::AllMiniLML6V2, 384)
            }
            "bge-small-en-v1.5" | "BAAI/bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            other => {
                return Err(MemoryError::Config(format!(
                    "Unsupported local embedding model: {other}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5"
                )));
            }
        };

        info!(model = %model_name, "Loading local embedding model");
        let embedder = TextEmbedding::try_new(InitOptions::new(model)).map_err(|e| {
            MemoryError::Config(format!("Failed to initialize embedding model: {e}"))
        })?;
        info!(model = %model_name, dimensions, "Local embedding model loaded");

        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(embedder)),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    fn id(&self) -> &str {
        "local"
    }

    fn model(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let texts = texts.to_vec();
        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|e| MemoryError::Embedding(format!("embedding model lock poisoned: {e}")))?;
            model
                .embed(texts, None)
                .map_err(|e| MemoryError::Embedding(e.to_string()))
        })
        .await??;

        check_dimensions(self.dimensions, &embeddings)?;
        Ok(embeddings)
    }
}

/// Provider used when the configuration does not name one.
///
/// Only the on-device model qualifies; without it a provider must be chosen
/// explicitly.
pub fn default_provider_kind() -> Option<EmbeddingProviderKind> {
    cfg!(feature = "local-embeddings").then_some(EmbeddingProviderKind::Local)
}

/// Build the configured embedding provider.
///
/// Called once at startup; loading a local model may take several seconds.
pub async fn build_provider(config: &EmbeddingConfig) -> MemoryResult<Arc<dyn EmbeddingProvider>> {
    let kind = config
        .provider
        .or_else(default_provider_kind)
        .ok_or_else(|| {
            MemoryError::Config(
                "no embedding provider configured and local embeddings are not compiled in; \
                 set EMBEDDING_PROVIDER (openai, ollama, gemini or hash) or rebuild with \
                 --features local-embeddings"
                    .into(),
            )
        })?;

    let provider: Arc<dyn EmbeddingProvider> = match kind {
        EmbeddingProviderKind::Local => load_local(config).await?,
        EmbeddingProviderKind::OpenAi => {
            let api_key = require_api_key(config, "openai")?;
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| OpenAiEmbedding::DEFAULT_MODEL.to_string());
            let dims = config
                .dimensions
                .unwrap_or(OpenAiEmbedding::DEFAULT_DIMENSIONS);
            let mut provider = OpenAiEmbedding::with_model(api_key, model, dims);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url.as_str());
            }
            Arc::new(provider)
        }
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedding::new(
            config
                .base_url
                .as_deref()
                .unwrap_or(OllamaEmbedding::DEFAULT_BASE_URL),
            config
                .model
                .clone()
                .unwrap_or_else(|| OllamaEmbedding::DEFAULT_MODEL.to_string()),
            config
                .dimensions
                .unwrap_or(OllamaEmbedding::DEFAULT_DIMENSIONS),
        )),
        EmbeddingProviderKind::Gemini => {
            let api_key = require_api_key(config, "gemini")?;
            let mut provider = GeminiEmbedding::new(
                api_key,
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| GeminiEmbedding::DEFAULT_MODEL.to_string()),
                config
                    .dimensions
                    .unwrap_or(GeminiEmbedding::DEFAULT_DIMENSIONS),
            );
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url.as_str());
            }
            Arc::new(provider)
        }
        EmbeddingProviderKind::Hash => {
            warn!("Using the hash embedding provider: search matches shared words only");
            Arc::new(HashEmbedding::new(
                config
                    .dimensions
                    .unwrap_or(HashEmbedding::DEFAULT_DIMENSIONS),
            )?)
        }
    };

    info!(
        provider = provider.id(),
        model = provider.model(),
        dimensions = provider.dimensions(),
        "Embedding provider ready"
    );
    Ok(provider)
}

fn require_api_key(config: &EmbeddingConfig, provider: &str) -> MemoryResult<String> {
    config.api_key.clone().ok_or_else(|| {
        MemoryError::Config(format!(
            "{provider} embeddings require EMBEDDING_API_KEY (or memory.embedding.api_key)"
        ))
    })
}

#[cfg(feature = "local-embeddings")]
async fn load_local(config: &EmbeddingConfig) -> MemoryResult<Arc<dyn EmbeddingProvider>> {
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| LocalEmbedding::DEFAULT_MODEL.to_string());
    let provider = tokio::task::spawn_blocking(move || LocalEmbedding::load(&model)).await??;
    if let Some(dims) = config.dimensions {
        if dims != provider.dimensions() {
            return Err(MemoryError::DimensionMismatch {
                expected: dims,
                actual: provider.dimensions(),
            });
        }
    }
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "local-embeddings"))]
async fn load_local(_config: &EmbeddingConfig) -> MemoryResult<Arc<dyn EmbeddingProvider>> {
    Err(MemoryError::Config(
        "local embeddings are not compiled in; rebuild with --features local-embeddings \
         or set EMBEDDING_PROVIDER"
            .into(),
    ))
}
