//! Embedders: a deterministic offline hash embedder and an OpenAI-compatible client.

use crate::openai_backend::{join_url, map_reqwest, ENV_LLM_API_KEY};
use capsule_core::{BackendError, Embedder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_HASH_DIMS: usize = 64;
pub const DEFAULT_EMBEDDINGS_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDINGS_DIMS: usize = 1_536;

/// Byte-hash embedding. Not semantically strong, but stable across runs, which is all
/// routing tests and offline deployments need.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, input: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];
        for (i, b) in input.to_lowercase().as_bytes().iter().enumerate() {
            let idx = (i.wrapping_mul(31) ^ (*b as usize)) % self.dims;
            v[idx] += (*b as f32) / 255.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    fn version(&self) -> String {
        format!("hash-v1:{}", self.dims)
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsData>,
}

#[derive(Deserialize)]
struct EmbeddingsData {
    embedding: Vec<f32>,
}

/// `POST {endpoint}/embeddings`. The version tag names model and dimension so a model
/// swap never mixes vectors.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dims,
            api_key: std::env::var(ENV_LLM_API_KEY).ok().filter(|k| !k.trim().is_empty()),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl Embedder for OpenAiEmbedder {
    fn version(&self) -> String {
        format!("openai:{}:{}", self.model, self.dims)
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        tracing::debug!(target: "capsule::adapters::embeddings", model = %self.model, input_len = text.len(), "Fetching embedding");
        let mut builder = self
            .client
            .post(join_url(&self.endpoint, "embeddings"))
            .timeout(self.timeout)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: text,
            });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: EmbeddingsResponse = response.json().await.map_err(map_reqwest)?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| BackendError::Malformed("response missing data[0].embedding".to_string()))?;
        if embedding.len() != self.dims {
            return Err(BackendError::Malformed(format!(
                "expected {} dimensions, got {}",
                self.dims,
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedding_is_unit_length_and_stable() {
        let e = HashEmbedder::default();
        let a = e.embed("Chief Strategist").await.unwrap();
        let b = e.embed("chief strategist").await.unwrap();
        assert_eq!(a.len(), DEFAULT_HASH_DIMS);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn versions_distinguish_dimension_and_model() {
        assert_ne!(HashEmbedder::new(32).version(), HashEmbedder::new(64).version());
        let a = OpenAiEmbedder::new("http://h/v1", "small", 1536);
        let b = OpenAiEmbedder::new("http://h/v1", "large", 1536);
        assert_ne!(a.version(), b.version());
    }

    #[test]
    fn empty_input_embeds_to_zero() {
        assert!(HashEmbedder::default().embed_sync("").iter().all(|x| *x == 0.0));
    }
}
