//! Embedding provider abstraction and the OpenAI-compatible
//! transport.
//!
//! Providers turn text into fixed-length dense vectors. The engine
//! ships two implementations:
//!
//! - **[`OpenAiCompatProvider`]** — speaks HTTPS to
//!   `{base_url}/embeddings` with `Bearer` auth. Construction fails
//!   with [`Error::Config`] when the key or base URL is missing.
//! - **[`HashEmbedder`]** — deterministic offline vectors derived
//!   from token hashes; used by tests and embedded hosts that index
//!   without a network provider.
//!
//! Every transport future is raced against the caller's
//! [`CancelToken`] so in-flight requests are interrupted, not
//! awaited to completion. Retry and per-attempt timeouts are applied
//! by callers through [`crate::retry::with_retry_and_timeout`].

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in the book meta.
    fn model_name(&self) -> &str;

    /// Vector length, when the provider declares one up front. The
    /// indexer validates every returned vector against it, so a
    /// misconfigured dimension degrades the run instead of persisting
    /// mixed-length embeddings.
    fn dims(&self) -> Option<usize>;

    /// Embed a single query text.
    async fn embed(&self, text: &str, cancel: &CancelToken) -> Result<Vec<f32>>;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_many(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>>;

    /// Probe the provider. `Ok(true)` means a request just succeeded.
    async fn health_check(&self, cancel: &CancelToken) -> Result<bool>;
}

/// Build the provider named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiCompatProvider::new(config)?)),
        "disabled" => Err(Error::Config("embedding provider is disabled".into())),
        other => Err(Error::Config(format!("unknown embedding provider: {other}"))),
    }
}

// ============ OpenAI-compatible provider ============

/// Provider for any endpoint speaking the OpenAI embeddings wire
/// shape: JSON body `{model, input, encoding_format: "float"}`,
/// response `{data: [{embedding, index}…]}` sorted by `index` before
/// use.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    model: String,
    dims: Option<usize>,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model is required".into()))?;
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("embedding.api_key is required".into()))?;
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("embedding.base_url is required".into()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            model,
            dims: config.dims,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "encoding_format": "float",
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "http {}: {}",
                status.as_u16(),
                detail
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("bad response body: {e}")))?;

        let mut data = parsed.data;
        data.sort_by_key(|item| item.index);

        if data.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                data.len()
            )));
        }

        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed(&self, text: &str, cancel: &CancelToken) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(&[text.to_string()], cancel).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Embedding("empty embedding response".into()))
    }

    async fn embed_many(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        cancel.check()?;
        debug!(count = texts.len(), model = %self.model, "requesting embeddings");
        tokio::select! {
            result = self.request_embeddings(texts) => result,
            _ = cancel.cancelled() => Err(Error::IndexingAborted),
        }
    }

    async fn health_check(&self, cancel: &CancelToken) -> Result<bool> {
        cancel.check()?;
        let probe = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send();
        let response = tokio::select! {
            result = probe => result?,
            _ = cancel.cancelled() => return Err(Error::IndexingAborted),
        };
        Ok(response.status().is_success())
    }
}

// ============ Deterministic offline provider ============

/// Deterministic embedder: folds token hashes into a fixed-length
/// unit vector. The same text always yields the same vector, and
/// texts sharing tokens land near each other, which is enough for
/// tests and for hosts that index without a network provider.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = usize::from(digest[0]) % self.dims;
            let sign = if digest[1] % 2 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    async fn embed(&self, text: &str, _cancel: &CancelToken) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_many(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        cancel.check()?;
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    async fn health_check(&self, _cancel: &CancelToken) -> Result<bool> {
        Ok(true)
    }
}
