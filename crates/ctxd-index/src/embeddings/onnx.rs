//! Local embeddings via fastembed's ONNX runtime.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{l2_normalize, EmbeddingError, EmbeddingProvider};

fn resolve_model(name: &str) -> Result<(EmbeddingModel, usize), EmbeddingError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        other => Err(EmbeddingError::ModelError(format!("unsupported local model: {}", other))),
    }
}

/// Sentence embeddings computed in-process.
///
/// The model is loaded once, on first use or [`EmbeddingProvider::warm_up`],
/// and inference runs on the blocking thread pool.
pub struct FastEmbedEmbeddings {
    name: String,
    model: EmbeddingModel,
    dimensions: usize,
    cache_dir: Option<PathBuf>,
    loaded: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl FastEmbedEmbeddings {
    pub fn new(name: &str, cache_dir: Option<PathBuf>) -> Result<Self, EmbeddingError> {
        let (model, dimensions) = resolve_model(name)?;
        Ok(Self {
            name: name.to_string(),
            model,
            dimensions,
            cache_dir,
            loaded: OnceCell::new(),
        })
    }

    async fn model(&self) -> Result<Arc<Mutex<TextEmbedding>>, EmbeddingError> {
        let model = self
            .loaded
            .get_or_try_init(|| async {
                info!("Loading embedding model: {}", self.name);
                let mut options = TextInitOptions::new(self.model.clone()).with_show_download_progress(false);
                if let Some(dir) = &self.cache_dir {
                    options = options.with_cache_dir(dir.clone());
                }

                let loaded = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await
                    .map_err(|e| EmbeddingError::ModelError(e.to_string()))?
                    .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;

                info!("Model {} loaded", self.name);
                Ok::<_, EmbeddingError>(Arc::new(Mutex::new(loaded)))
            })
            .await?;
        Ok(model.clone())
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model().await?;
        let texts = texts.to_vec();
        debug!("Embedding batch of {} texts", texts.len());

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| EmbeddingError::ModelError("model lock poisoned".to_string()))?;
            let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
            let mut vectors = guard
                .embed(refs, None)
                .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;
            for vector in vectors.iter_mut() {
                l2_normalize(vector);
            }
            Ok(vectors)
        })
        .await
        .map_err(|e| EmbeddingError::ModelError(e.to_string()))?
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    async fn warm_up(&self) -> Result<(), EmbeddingError> {
        self.model().await.map(|_| ())
    }
}
