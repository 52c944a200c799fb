//! Embedding functions.
//!
//! [`HashingEmbedder`] is the default: local, deterministic across restarts
//! and machines, and dependency-free at runtime. [`OpenAiEmbedder`] calls a
//! remote `/embeddings` endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use taskmind_config::ProviderConfig;
use taskmind_core::error::ProviderError;
use taskmind_core::provider::Embedder;
use tracing::debug;

use crate::openai_compat::{check_status, http_client};

const BIGRAM_WEIGHT: f32 = 0.5;

/// Feature-hashing embedder over lower-cased word tokens and bigrams.
///
/// Each feature is hashed with SHA-256; the first eight bytes pick a bucket
/// and the ninth picks a sign. The vector is L2-normalized, so empty input
/// yields the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Synchronous core of [`Embedder::embed`].
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let mut v = vec![0.0f32; self.dimension];
        for token in &tokens {
            self.add_feature(&mut v, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut v, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_text(text))
    }
}

/// Remote embeddings through an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
            client: http_client()?,
        })
    }

    pub fn from_config(config: &ProviderConfig, dimension: usize) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured("remote embeddings need an API key".into())
        })?;
        Self::new(&config.api_url, api_key, &config.embedding_model, dimension)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
            "encoding_format": "float",
            "dimensions": self.dimension,
        });

        debug!(model = %self.model, chars = text.len(), "Sending embedding request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let response = check_status(response).await?;
        let api_resp: EmbeddingApiResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse embedding response: {e}"))
        })?;

        let embedding = api_resp
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::InvalidResponse("No embedding in response".into()))?;

        if embedding.len() != self.dimension {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}
