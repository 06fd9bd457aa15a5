//! OpenAI-compatible HTTP embedding provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{l2_normalize, EmbeddingError, EmbeddingProvider};

/// Default endpoint for the `http` provider.
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embeddings served by a remote `/embeddings` endpoint.
pub struct HttpEmbeddings {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: Client,
}

impl HttpEmbeddings {
    pub fn new(endpoint: String, api_key: Option<String>, model: String, dimensions: usize) -> Self {
        Self {
            endpoint,
            api_key,
            model,
            dimensions,
            client: Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send embedding request, waiting out rate limits.
    async fn send_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request_body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut retry_count = 0;
        let mut backoff_secs = 1u64;

        loop {
            debug!("Sending embedding request for {} texts to {}", texts.len(), self.endpoint);

            let mut request = self.client.post(&self.endpoint).json(&request_body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;
            let status = response.status();

            if status.is_success() {
                let parsed: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                return self.collect_vectors(parsed, texts.len());
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > MAX_RATE_LIMIT_RETRIES {
                    return Err(EmbeddingError::RateLimited(MAX_RATE_LIMIT_RETRIES));
                }

                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                warn!(
                    "Rate limited, retrying after {} seconds (attempt {}/{})",
                    retry_after, retry_count, MAX_RATE_LIMIT_RETRIES
                );

                tokio::time::sleep(tokio::time::Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError {
                status: status.as_u16(),
                message,
            });
        }
    }

    /// Order by response index, check shape, normalize.
    fn collect_vectors(&self, response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut data = response.data;
        if data.len() != expected {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                expected,
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);

        data.into_iter()
            .map(|d| {
                let mut vector = d.embedding;
                if vector.len() != self.dimensions {
                    return Err(EmbeddingError::InvalidResponse(format!(
                        "expected {} dimensions, got {}",
                        self.dimensions,
                        vector.len()
                    )));
                }
                l2_normalize(&mut vector);
                Ok(vector)
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Embedding batch of {} texts", texts.len());
        self.send_request(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        64
    }
}
