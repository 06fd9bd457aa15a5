//! Deterministic feature-hashing embeddings.
//!
//! Each lowercased word and each of its character trigrams is hashed into
//! one of `dimensions` buckets with a hash-derived sign, then the vector is
//! L2-normalized. Identical text always yields an identical vector, and
//! texts sharing vocabulary land close together. No model or network is
//! needed.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingError, EmbeddingProvider};

/// Offline embedder based on the hashing trick.
#[derive(Debug, Clone)]
pub struct HashEmbeddings {
    dimensions: usize,
    model: String,
}

impl HashEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model: format!("feature-hash-{}", dimensions),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    /// Embed synchronously.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();

        for word in lowered
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut vector, word, 1.0);

            let chars: Vec<char> = word.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    self.add_feature(&mut vector, &format!("#{}", gram), 0.5);
                }
            }
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbeddings {
    fn default() -> Self {
        Self::new(crate::DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashEmbeddings::new(384);
        let a = embedder.embed_sync("def foo():\n    return 1");
        let b = embedder.embed_sync("def foo():\n    return 1");

        assert_eq!(a.len(), 384);
        assert_eq!(a, b);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_text_is_closer() {
        let embedder = HashEmbeddings::default();
        let query = embedder.embed_sync("parse configuration file");
        let near = embedder.embed_sync("function to parse the configuration file");
        let far = embedder.embed_sync("render html template widget");

        assert!(dot(&query, &near) > dot(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashEmbeddings::new(16);
        assert!(embedder.embed_sync("  ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let embedder = HashEmbeddings::new(32);
        let texts = vec!["alpha".to_string(), "beta gamma".to_string()];

        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], embedder.embed("beta gamma").await.unwrap());
        assert_eq!(embedder.model_name(), "feature-hash-32");
    }
}
