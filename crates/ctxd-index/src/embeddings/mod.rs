//! Embedding provider trait and implementations.
//!
//! Providers turn chunk text into fixed-dimension, L2-normalized vectors:
//! - [`FastEmbedEmbeddings`]: local ONNX model (feature `fastembed`)
//! - [`HttpEmbeddings`]: OpenAI-compatible `/embeddings` endpoint
//! - [`HashEmbeddings`]: deterministic feature hashing, offline

pub mod hashing;
pub mod http;
#[cfg(feature = "fastembed")]
pub mod onnx;
pub mod retry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "fastembed")]
pub use onnx::FastEmbedEmbeddings;
pub use hashing::HashEmbeddings;
pub use http::HttpEmbeddings;
pub use retry::{retry, RetryPolicy};

/// Default local model.
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited after {0} retries")]
    RateLimited(u32),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Unknown embedding provider: {0}")]
    UnknownProvider(String),

    #[error("Embedding provider '{0}' is not available in this build")]
    ProviderUnavailable(String),
}

impl EmbeddingError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::RateLimited(_) | Self::ModelError(_) => true,
            Self::ApiError { status, .. } => *status >= 500,
            Self::InvalidResponse(_) | Self::UnknownProvider(_) | Self::ProviderUnavailable(_) => false,
        }
    }
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed multiple texts in one call, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed any number of texts in batches of at most `batch_size`.
    ///
    /// Output has the same length and order as the input.
    async fn embed_many(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = batch_size.clamp(1, self.max_batch_size().max(1));
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            let embedded = self.embed_batch(batch).await?;
            if embedded.len() != batch.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embedded.len()
                )));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }

    /// Load the model ahead of first use. Idempotent.
    async fn warm_up(&self) -> Result<(), EmbeddingError> {
        Ok(())
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left as is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Which provider to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    FastEmbed,
    Http,
    Hash,
}

impl FromStr for ProviderKind {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fastembed" | "local" => Ok(Self::FastEmbed),
            "http" | "openai" => Ok(Self::Http),
            "hash" => Ok(Self::Hash),
            other => Err(EmbeddingError::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FastEmbed => "fastembed",
            Self::Http => "http",
            Self::Hash => "hash",
        })
    }
}

/// Identity of the vectors a provider configuration produces, recorded with
/// the chunk table. Hash embeddings ignore the model name.
pub fn embedding_fingerprint(kind: ProviderKind, model: &str, dimensions: usize) -> String {
    match kind {
        ProviderKind::Hash => format!("hash:{}", dimensions),
        kind => format!("{}:{}:{}", kind, model, dimensions),
    }
}

/// Settings used to construct a provider.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub provider: ProviderKind,
    pub model: String,
    pub dimensions: usize,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub cache_dir: Option<std::path::PathBuf>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::FastEmbed,
            model: DEFAULT_MODEL.to_string(),
            dimensions: crate::DEFAULT_DIMENSIONS,
            endpoint: http::DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            cache_dir: None,
        }
    }
}

impl EmbeddingSettings {
    pub fn fingerprint(&self) -> String {
        embedding_fingerprint(self.provider, &self.model, self.dimensions)
    }
}

/// Build the provider described by `settings`.
///
/// Asking for the local provider in a build without the `fastembed`
/// feature is an error rather than a silent switch to another model.
pub fn create_provider(settings: &EmbeddingSettings) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    debug!("Creating {:?} embedding provider for {}", settings.provider, settings.model);
    match settings.provider {
        ProviderKind::Http => Ok(Arc::new(HttpEmbeddings::new(
            settings.endpoint.clone(),
            settings.api_key.clone(),
            settings.model.clone(),
            settings.dimensions,
        ))),
        ProviderKind::Hash => Ok(Arc::new(HashEmbeddings::new(settings.dimensions))),
        ProviderKind::FastEmbed => create_local(settings),
    }
}

#[cfg(feature = "fastembed")]
fn create_local(settings: &EmbeddingSettings) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let provider = FastEmbedEmbeddings::new(&settings.model, settings.cache_dir.clone())?;
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "fastembed"))]
fn create_local(settings: &EmbeddingSettings) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    Err(EmbeddingError::ProviderUnavailable(format!(
        "fastembed ({}); rebuild with `--features fastembed` or set embeddings.provider",
        settings.model
    )))
}
